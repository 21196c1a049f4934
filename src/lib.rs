//! Delayed retry and dead-lettering for RabbitMQ consumers.
//!
//! Every route gets three fanout exchange/queue pairs: `instant`, `delay` and
//! `dead_letter`. A handler that returns [`ProcessStatus::RetryRequested`]
//! has its message re-published to the delay queue, where the broker holds it
//! for the route's TTL and then dead-letters it back to the instant exchange.
//! Once the route's retry budget is used up the message goes to the
//! dead-letter queue and stays there.
//!
//! ```rust,ignore
//! let retrier = Arc::new(Retrier::new(hosts, routes));
//! retrier.run_publisher(signal.clone()).await?;
//! let handler = Arc::new(retrier.wrap(my_handler)?);
//! let consumers = retrier.run_consumers(handler, signal).await?;
//! ```

pub mod app;
pub mod config;
pub mod handler;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod model;
pub mod retrier;
pub mod retry;
pub mod shutdown;

pub use config::{Config, RouteConfig, RouteConfigs};
pub use handler::{Handler, HandlerFn, StatusLogger};
pub use health::{ConsumerHealth, ConsumerState};
pub use messaging::Tier;
pub use model::{Event, Message, ProcessStatus, RetryEnvelope, HEADER_MESSAGE_ROUTE};
pub use retrier::{Retrier, RetryError, RetryMiddleware, StartupError};
pub use retry::{decide, RetryDecision};
