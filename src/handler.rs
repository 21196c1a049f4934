use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Event, ProcessStatus};

/// Processes one event and reports what should happen to it.
///
/// Handlers compose by wrapping: [`StatusLogger`] and
/// [`crate::retrier::RetryMiddleware`] both take an inner handler and are
/// handlers themselves.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_event(&self, event: &dyn Event) -> ProcessStatus;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle_event(&self, event: &dyn Event) -> ProcessStatus {
        (**self).handle_event(event).await
    }
}

/// Adapts a synchronous closure into a [`Handler`].
///
/// ```rust,ignore
/// let handler = HandlerFn(|_event: &dyn Event| ProcessStatus::RetryRequested);
/// ```
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&dyn Event) -> ProcessStatus + Send + Sync + 'static,
{
    async fn handle_event(&self, event: &dyn Event) -> ProcessStatus {
        (self.0)(event)
    }
}

/// Logs the outcome of every event the inner handler processes.
pub struct StatusLogger<H> {
    inner: H,
}

impl<H: Handler> StatusLogger<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Handler> Handler for StatusLogger<H> {
    async fn handle_event(&self, event: &dyn Event) -> ProcessStatus {
        let status = self.inner.handle_event(event).await;
        let route = event.route().unwrap_or("<none>");
        let retry_count = event.retry_envelope().map(|e| e.retry_count).unwrap_or(0);
        match status {
            ProcessStatus::Completed => {
                tracing::info!(route, retry_count, %status, "processed")
            }
            ProcessStatus::RetryRequested => {
                tracing::warn!(route, retry_count, %status, "processed")
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[tokio::test]
    async fn closure_handler_returns_its_status() {
        let handler = HandlerFn(|event: &dyn Event| {
            if event.value() == b"bad" {
                ProcessStatus::RetryRequested
            } else {
                ProcessStatus::Completed
            }
        });

        assert_eq!(
            handler.handle_event(&Message::new("bad")).await,
            ProcessStatus::RetryRequested
        );
        assert_eq!(
            handler.handle_event(&Message::new("good")).await,
            ProcessStatus::Completed
        );
    }

    #[tokio::test]
    async fn status_logger_passes_status_through() {
        let logged = StatusLogger::new(HandlerFn(|_: &dyn Event| ProcessStatus::RetryRequested));
        let msg = Message::new("x").with_route("orders");
        assert_eq!(logged.handle_event(&msg).await, ProcessStatus::RetryRequested);
    }

    #[tokio::test]
    async fn shared_handler_delegates() {
        let shared: Arc<dyn Handler> = Arc::new(HandlerFn(|_: &dyn Event| ProcessStatus::Completed));
        assert_eq!(
            shared.handle_event(&Message::new("x")).await,
            ProcessStatus::Completed
        );
    }
}
