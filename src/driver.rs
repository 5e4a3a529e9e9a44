use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::topic_partition::TopicPartition;

/// A single record as delivered by the broker, prior to being materialized
/// into a [`crate::message::Message`].
#[derive(Debug, Clone)]
pub struct Record {
    pub tp: TopicPartition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

/// Broker operations the consumer core treats as an external collaborator.
///
/// Implementations are possibly-failing coroutines; [`DriverError::is_stopped`]
/// tells the core whether a given failure is part of benign shutdown.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn fetch(
        &self,
        active: &HashSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Record>>, DriverError>;

    async fn commit(
        &self,
        offsets: &HashMap<TopicPartition, i64>,
    ) -> Result<bool, DriverError>;

    async fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), DriverError>;

    async fn seek_to_committed(
        &self,
    ) -> Result<HashMap<TopicPartition, Option<i64>>, DriverError>;

    async fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError>;

    async fn assignment(&self) -> Result<HashSet<TopicPartition>, DriverError>;

    async fn highwater(&self, tp: &TopicPartition) -> Result<i64, DriverError>;

    async fn earliest_offsets(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError>;

    async fn highwaters(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError>;

    async fn subscribe(&self, topics: &[String]) -> Result<(), DriverError>;

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication: i16,
    ) -> Result<(), DriverError>;
}
