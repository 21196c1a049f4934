use tokio::sync::watch;

/// Sender side held by the application orchestrator.
/// Call `trigger()` to broadcast shutdown to all listeners.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side handed to startup sequences that must stop early on shutdown.
/// Clone freely; each clone independently observes the signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Construct a linked handle/signal pair.
///
/// ```rust,ignore
/// let (handle, signal) = shutdown::new_pair();
/// ```
pub fn new_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Broadcast the shutdown signal to all outstanding [`ShutdownSignal`]s.
    pub fn trigger(self) {
        // Errors only if all receivers have been dropped.
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered, immediately if it already was.
    ///
    /// A dropped handle that never triggered means nobody can stop us; in that
    /// case this never resolves.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|&v| v).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Wait for `SIGINT` (Ctrl-C) or `SIGTERM` (container stop / kill).
pub async fn wait_for_os_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv()  => tracing::info!("🔔 SIGINT received"),
        _ = sigterm.recv() => tracing::info!("🔔 SIGTERM received"),
    }
    Ok(())
}
