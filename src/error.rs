use thiserror::Error;

use crate::topic_partition::TopicPartition;

/// Errors raised by a [`crate::driver::Driver`] implementation.
///
/// Mirrors `common-kafka`'s split of `RecvErr`/`OffsetErr` into small,
/// per-concern variants rather than one grab-bag enum.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("driver is shutting down")]
    Stopped,
    #[error("operation cancelled")]
    Cancelled,
}

impl DriverError {
    /// Classifies a driver error as part of the driver's declared "stopped"
    /// family: benign during shutdown, fatal otherwise.
    pub fn is_stopped(&self) -> bool {
        matches!(self, DriverError::Stopped | DriverError::Cancelled)
    }
}

/// Errors raised while flushing attached producer work before a commit.
#[derive(Debug, Error)]
pub enum ProducerFlushError {
    #[error("failed to produce attached message for {tp} offset {offset}: {source}")]
    Send {
        tp: TopicPartition,
        offset: i64,
        #[source]
        source: rdkafka::error::KafkaError,
    },
}

/// Top-level error type for the consumer core.
///
/// `Crashed` is the variant the spec requires the service to surface on an
/// irrecoverable producer send failure during attached-flush: the consumer
/// process should be brought down so the partition is re-consumed from its
/// last committed offset on restart.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("producer flush failed, crashing to preserve at-least-once: {0}")]
    Crashed(#[from] ProducerFlushError),
}
