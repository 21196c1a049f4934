mod consumer;
mod producer;
mod rabbit;
mod topology;

pub use consumer::{ConsumerError, ConsumerSupervisor};
pub use producer::{PublishError, PublisherSession, RetryPublisher};
pub use rabbit::{
    connect, consumer_tag, exchange_name, queue_name, Pool, RabbitError, Tier,
    DEAD_LETTER_EXCHANGE_ARG, DEFAULT_CONNECT_TIMEOUT, RETRY_COUNT_HEADER,
};
pub use topology::{
    provision, Binding, ExchangeSpec, QueueArguments, QueueSpec, TierTopology, TopologyChannel,
    TopologyError,
};
