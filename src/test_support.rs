//! In-memory [`Driver`] used by this crate's own unit tests and by the
//! `tests/` integration suite (enabled via the `test-support` feature).
//!
//! Grounded in `kafka-deduplicator`'s `tests/common/mod.rs` convention of a
//! shared, file-local test-fixture module rather than a production mock
//! crate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{Driver, Record};
use crate::error::DriverError;
use crate::topic_partition::TopicPartition;

/// A scriptable [`Driver`]: each call to `fetch` pops the next queued batch
/// (or returns an empty map once exhausted, then a `Stopped` error once
/// `stop_after_exhausted` is set), and `commit` appends to a recording log
/// inspectable via [`MockDriver::commit_log`].
pub struct MockDriver {
    batches: Mutex<VecDeque<HashMap<TopicPartition, Vec<Record>>>>,
    commit_log: Mutex<Vec<HashMap<TopicPartition, i64>>>,
    assignment: Mutex<HashSet<TopicPartition>>,
    committed: Mutex<HashMap<TopicPartition, i64>>,
    commit_fails_next: Mutex<bool>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            commit_log: Mutex::new(Vec::new()),
            assignment: Mutex::new(HashSet::new()),
            committed: Mutex::new(HashMap::new()),
            commit_fails_next: Mutex::new(false),
        }
    }

    pub fn with_single_batch(batch: HashMap<TopicPartition, Vec<Record>>) -> Self {
        let driver = Self::new();
        *driver.assignment.lock().unwrap() = batch.keys().cloned().collect();
        driver.batches.lock().unwrap().push_back(batch);
        driver
    }

    pub fn set_assignment(&self, tps: HashSet<TopicPartition>) {
        *self.assignment.lock().unwrap() = tps;
    }

    pub fn push_batch(&self, batch: HashMap<TopicPartition, Vec<Record>>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn commit_log(&self) -> Vec<HashMap<TopicPartition, i64>> {
        self.commit_log.lock().unwrap().clone()
    }

    pub fn fail_next_commit(&self) {
        *self.commit_fails_next.lock().unwrap() = true;
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn fetch(
        &self,
        active: &HashSet<TopicPartition>,
        _timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Record>>, DriverError> {
        let Some(batch) = self.batches.lock().unwrap().pop_front() else {
            return Err(DriverError::Stopped);
        };
        Ok(batch
            .into_iter()
            .filter(|(tp, _)| active.contains(tp))
            .collect())
    }

    async fn commit(
        &self,
        offsets: &HashMap<TopicPartition, i64>,
    ) -> Result<bool, DriverError> {
        let mut fail = self.commit_fails_next.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(DriverError::Kafka(rdkafka::error::KafkaError::Canceled));
        }
        drop(fail);
        self.commit_log.lock().unwrap().push(offsets.clone());
        self.committed.lock().unwrap().extend(offsets.clone());
        Ok(true)
    }

    async fn seek(&self, _tp: &TopicPartition, _offset: i64) -> Result<(), DriverError> {
        Ok(())
    }

    async fn seek_to_committed(
        &self,
    ) -> Result<HashMap<TopicPartition, Option<i64>>, DriverError> {
        Ok(self
            .committed
            .lock()
            .unwrap()
            .iter()
            .map(|(tp, &offset)| (tp.clone(), Some(offset)))
            .collect())
    }

    async fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
        Ok(self.committed.lock().unwrap().get(tp).copied())
    }

    async fn assignment(&self) -> Result<HashSet<TopicPartition>, DriverError> {
        Ok(self.assignment.lock().unwrap().clone())
    }

    async fn highwater(&self, _tp: &TopicPartition) -> Result<i64, DriverError> {
        Ok(0)
    }

    async fn earliest_offsets(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError> {
        Ok(tps.iter().map(|tp| (tp.clone(), 0)).collect())
    }

    async fn highwaters(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError> {
        Ok(tps.iter().map(|tp| (tp.clone(), 0)).collect())
    }

    async fn subscribe(&self, _topics: &[String]) -> Result<(), DriverError> {
        Ok(())
    }

    async fn create_topic(
        &self,
        _topic: &str,
        _partitions: i32,
        _replication: i16,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}
