use std::sync::Arc;

use crate::config::Config;
use crate::handler::{Handler, HandlerFn, StatusLogger};
use crate::model::{Event, ProcessStatus};
use crate::retrier::{Retrier, RetryError, StartupError};
use crate::shutdown;

// ── Error type ─────────────────────────────────────────────────────────────────

/// Top-level application error, surfaced only at startup.
#[derive(Debug)]
pub enum AppError {
    Config(crate::config::ConfigError),
    Startup(StartupError),
    Compose(RetryError),
    Signal(std::io::Error),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e)  => write!(f, "config error: {e}"),
            Self::Startup(e) => write!(f, "startup error: {e}"),
            Self::Compose(e) => write!(f, "handler composition error: {e}"),
            Self::Signal(e)  => write!(f, "signal handler error: {e}"),
        }
    }
}

impl std::error::Error for AppError {}

// ── Entry point ────────────────────────────────────────────────────────────────

/// Run the retrier for every configured route until SIGINT / SIGTERM.
///
/// # Startup sequence
/// 1. Load and validate configuration from environment variables.
/// 2. Connect the publisher session and declare every route's topology.
/// 3. Compose the handler: status logger inside the retry middleware.
/// 4. Start one consumer per route on its instant queue.
/// 5. Wait for a signal, then stop consuming and log metrics.
///
/// The handler here asks for a retry on every message, which walks each
/// message through the full delay → dead-letter path.
pub async fn run() -> Result<(), AppError> {
    let cfg = Config::load().map_err(AppError::Config)?;
    cfg.log_summary();

    let (shutdown_handle, shutdown_signal) = shutdown::new_pair();

    let retrier = Arc::new(
        Retrier::new(cfg.rabbitmq_hosts.clone(), cfg.routes.clone())
            .with_connect_timeout(cfg.connect_timeout)
            .with_pool_size(cfg.publisher_pool_size)
            .with_prefetch(cfg.prefetch_count),
    );

    // Startup must not outlive a Ctrl-C during a slow connect.
    let startup = async {
        retrier
            .run_publisher(shutdown_signal.clone())
            .await
            .map_err(AppError::Startup)?;

        let handler = StatusLogger::new(HandlerFn(|_event: &dyn Event| {
            ProcessStatus::RetryRequested
        }));
        let handler: Arc<dyn Handler> =
            Arc::new(retrier.wrap(handler).map_err(AppError::Compose)?);

        retrier
            .run_consumers(handler, shutdown_signal.clone())
            .await
            .map_err(AppError::Startup)
    };

    let consumers = tokio::select! {
        started = startup => started?,
        signal = shutdown::wait_for_os_signal() => {
            signal.map_err(AppError::Signal)?;
            shutdown_handle.trigger();
            tracing::info!("🛑 signal received during startup");
            return Ok(());
        }
    };

    tracing::info!(
        routes = ?consumers.routes().collect::<Vec<_>>(),
        "✅ retrier ready, waiting for messages"
    );

    shutdown::wait_for_os_signal().await.map_err(AppError::Signal)?;
    tracing::info!("🛑 signal received, stopping consumers...");
    shutdown_handle.trigger();

    let closed = retrier.health().closed_routes();
    if !closed.is_empty() {
        tracing::warn!(routes = ?closed, "consumers closed before shutdown");
    }
    consumers.abort();
    consumers.join().await;

    retrier.metrics().log_summary();
    tracing::info!("✅ shutdown complete");
    Ok(())
}
