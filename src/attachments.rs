use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::error::ProducerFlushError;
use crate::topic_partition::TopicPartition;

/// A pending delivery on the attached producer, keyed so it can be flushed
/// once its consumer offset is about to be committed.
pub type DeliveryFuture = tokio::sync::oneshot::Receiver<Result<(), rdkafka::error::KafkaError>>;

/// Tracks producer records that must be durably delivered before the
/// consumer commits past the offset that caused them to be produced.
///
/// Grounded in `common-kafka::kafka_producer::send_iter_to_kafka`'s
/// `join_all(delivery_futures)` flush, generalized to be indexed by the
/// consumer offset that attached the work rather than flushed unconditionally.
#[derive(Default)]
pub struct AttachmentsRegistry {
    pending: Mutex<HashMap<(TopicPartition, i64), Vec<DeliveryFuture>>>,
}

impl AttachmentsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, tp: TopicPartition, offset: i64, future: DeliveryFuture) {
        self.pending
            .lock()
            .await
            .entry((tp, offset))
            .or_default()
            .push(future);
    }

    /// Removes and returns any futures attached to `(tp, offset)`.
    pub async fn publish_for_tp_offset(
        &self,
        tp: &TopicPartition,
        offset: i64,
    ) -> Vec<DeliveryFuture> {
        self.pending
            .lock()
            .await
            .remove(&(tp.clone(), offset))
            .unwrap_or_default()
    }
}

/// Thin abstraction over the attached producer, so the commit coordinator
/// need not depend on a concrete `rdkafka::producer::FutureProducer`.
#[async_trait]
pub trait AttachedProducer: Send + Sync {
    async fn wait_many(
        &self,
        tp: &TopicPartition,
        offset: i64,
        futures: Vec<DeliveryFuture>,
    ) -> Result<(), ProducerFlushError>;
}

/// Default implementation: awaits each delivery future and maps the first
/// failure into a [`ProducerFlushError`].
pub struct JoinAllProducer;

#[async_trait]
impl AttachedProducer for JoinAllProducer {
    async fn wait_many(
        &self,
        tp: &TopicPartition,
        offset: i64,
        futures: Vec<DeliveryFuture>,
    ) -> Result<(), ProducerFlushError> {
        for result in join_all(futures).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    return Err(ProducerFlushError::Send {
                        tp: tp.clone(),
                        offset,
                        source,
                    })
                }
                Err(_) => {
                    // The sending half was dropped without a reply; treat as
                    // a transport error against the attached producer.
                    return Err(ProducerFlushError::Send {
                        tp: tp.clone(),
                        offset,
                        source: rdkafka::error::KafkaError::Canceled,
                    })
                }
            }
        }
        Ok(())
    }
}

pub type SharedAttachments = Arc<AttachmentsRegistry>;
