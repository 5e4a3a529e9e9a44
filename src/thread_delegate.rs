//! Runs a blocking broker driver on a dedicated OS thread and marshals
//! calls across the boundary via two mailboxes.
//!
//! Grounded in the dedicated-thread pattern `materialize`'s
//! `KafkaSourceReader` uses for its metadata-refresh thread
//! (`_metadata_thread_handle: UnparkOnDropHandle<()>`, a `std::thread`
//! polling a blocking consumer handle and publishing results over a
//! `crossbeam_channel`) — the teacher repo has no equivalent of its own
//! (its consumers are natively async via `rdkafka::consumer::StreamConsumer`),
//! so this component is grounded on the wider example pack instead.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::driver::{Driver, Record};
use crate::error::DriverError;
use crate::topic_partition::TopicPartition;

/// The synchronous counterpart of [`Driver`], implemented against a
/// blocking client library and run entirely on the dedicated consumer
/// thread.
pub trait BlockingDriver: Send + 'static {
    fn fetch(
        &self,
        active: &HashSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Record>>, DriverError>;
    fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<bool, DriverError>;
    fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), DriverError>;
    fn seek_to_committed(&self) -> Result<HashMap<TopicPartition, Option<i64>>, DriverError>;
    fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError>;
    fn assignment(&self) -> Result<HashSet<TopicPartition>, DriverError>;
    fn highwater(&self, tp: &TopicPartition) -> Result<i64, DriverError>;
    fn earliest_offsets(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError>;
    fn highwaters(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError>;
    fn subscribe(&self, topics: &[String]) -> Result<(), DriverError>;
    fn create_topic(&self, topic: &str, partitions: i32, replication: i16)
        -> Result<(), DriverError>;
}

/// A main-loop-bound call queued for the consumer thread to execute.
enum Command {
    Fetch {
        active: HashSet<TopicPartition>,
        timeout: Duration,
        reply: oneshot::Sender<Result<HashMap<TopicPartition, Vec<Record>>, DriverError>>,
    },
    Commit {
        offsets: HashMap<TopicPartition, i64>,
        reply: oneshot::Sender<Result<bool, DriverError>>,
    },
    Seek {
        tp: TopicPartition,
        offset: i64,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    SeekToCommitted {
        reply: oneshot::Sender<Result<HashMap<TopicPartition, Option<i64>>, DriverError>>,
    },
    Position {
        tp: TopicPartition,
        reply: oneshot::Sender<Result<Option<i64>, DriverError>>,
    },
    Assignment {
        reply: oneshot::Sender<Result<HashSet<TopicPartition>, DriverError>>,
    },
    Highwater {
        tp: TopicPartition,
        reply: oneshot::Sender<Result<i64, DriverError>>,
    },
    EarliestOffsets {
        tps: HashSet<TopicPartition>,
        reply: oneshot::Sender<Result<HashMap<TopicPartition, i64>, DriverError>>,
    },
    Highwaters {
        tps: HashSet<TopicPartition>,
        reply: oneshot::Sender<Result<HashMap<TopicPartition, i64>, DriverError>>,
    },
    Subscribe {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    CreateTopic {
        topic: String,
        partitions: i32,
        replication: i16,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    Shutdown,
}

/// A [`Driver`] that owns a dedicated OS thread running a [`BlockingDriver`].
/// Every async trait method enqueues a [`Command`] and awaits its reply.
pub struct ThreadDelegateDriver {
    tx: std_mpsc::Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadDelegateDriver {
    pub fn spawn(inner: impl BlockingDriver) -> Self {
        let (tx, rx) = std_mpsc::channel::<Command>();
        let handle = std::thread::Builder::new()
            .name("driver-thread".into())
            .spawn(move || {
                for command in rx {
                    match command {
                        Command::Fetch { active, timeout, reply } => {
                            let _ = reply.send(inner.fetch(&active, timeout));
                        }
                        Command::Commit { offsets, reply } => {
                            let _ = reply.send(inner.commit(&offsets));
                        }
                        Command::Seek { tp, offset, reply } => {
                            let _ = reply.send(inner.seek(&tp, offset));
                        }
                        Command::SeekToCommitted { reply } => {
                            let _ = reply.send(inner.seek_to_committed());
                        }
                        Command::Position { tp, reply } => {
                            let _ = reply.send(inner.position(&tp));
                        }
                        Command::Assignment { reply } => {
                            let _ = reply.send(inner.assignment());
                        }
                        Command::Highwater { tp, reply } => {
                            let _ = reply.send(inner.highwater(&tp));
                        }
                        Command::EarliestOffsets { tps, reply } => {
                            let _ = reply.send(inner.earliest_offsets(&tps));
                        }
                        Command::Highwaters { tps, reply } => {
                            let _ = reply.send(inner.highwaters(&tps));
                        }
                        Command::Subscribe { topics, reply } => {
                            let _ = reply.send(inner.subscribe(&topics));
                        }
                        Command::CreateTopic { topic, partitions, replication, reply } => {
                            let _ = reply.send(inner.create_topic(&topic, partitions, replication));
                        }
                        Command::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn driver thread");

        Self {
            tx,
            handle: Some(handle),
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, DriverError>>) -> Command,
    ) -> Result<T, DriverError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| DriverError::Stopped)?;
        reply_rx.await.map_err(|_| DriverError::Stopped)?
    }
}

impl Drop for ThreadDelegateDriver {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[async_trait]
impl Driver for ThreadDelegateDriver {
    async fn fetch(
        &self,
        active: &HashSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Record>>, DriverError> {
        let active = active.clone();
        self.call(|reply| Command::Fetch { active, timeout, reply }).await
    }

    async fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<bool, DriverError> {
        let offsets = offsets.clone();
        self.call(|reply| Command::Commit { offsets, reply }).await
    }

    async fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<(), DriverError> {
        let tp = tp.clone();
        self.call(|reply| Command::Seek { tp, offset, reply }).await
    }

    async fn seek_to_committed(
        &self,
    ) -> Result<HashMap<TopicPartition, Option<i64>>, DriverError> {
        self.call(|reply| Command::SeekToCommitted { reply }).await
    }

    async fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
        let tp = tp.clone();
        self.call(|reply| Command::Position { tp, reply }).await
    }

    async fn assignment(&self) -> Result<HashSet<TopicPartition>, DriverError> {
        self.call(|reply| Command::Assignment { reply }).await
    }

    async fn highwater(&self, tp: &TopicPartition) -> Result<i64, DriverError> {
        let tp = tp.clone();
        self.call(|reply| Command::Highwater { tp, reply }).await
    }

    async fn earliest_offsets(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError> {
        let tps = tps.clone();
        self.call(|reply| Command::EarliestOffsets { tps, reply }).await
    }

    async fn highwaters(
        &self,
        tps: &HashSet<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, i64>, DriverError> {
        let tps = tps.clone();
        self.call(|reply| Command::Highwaters { tps, reply }).await
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), DriverError> {
        let topics = topics.to_vec();
        self.call(|reply| Command::Subscribe { topics, reply }).await
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication: i16,
    ) -> Result<(), DriverError> {
        let topic = topic.to_string();
        self.call(|reply| Command::CreateTopic { topic, partitions, replication, reply })
            .await
    }
}

/// A rebalance notification raised by the thread-side driver callbacks,
/// routed to the main loop's [`crate::rebalance::RebalanceHandler`] so
/// ledger mutation and the external callbacks happen under the loop's
/// single-writer discipline. The thread blocks on `done` until the main
/// loop finishes processing, the same way the source's thread-side
/// rebalance callbacks await a promise before returning control to the
/// driver's own poll loop.
pub enum RebalanceNotice {
    Revoked {
        tps: HashSet<TopicPartition>,
        done: oneshot::Sender<()>,
    },
    Assigned {
        tps: HashSet<TopicPartition>,
        done: oneshot::Sender<()>,
    },
}

/// Sent from the consumer thread; blocks that thread (via `blocking_send`)
/// until the main loop accepts the notice for processing.
pub type RebalanceNoticeSender = tokio::sync::mpsc::Sender<RebalanceNotice>;
pub type RebalanceNoticeReceiver = tokio::sync::mpsc::Receiver<RebalanceNotice>;

/// Pumps rebalance notices from the consumer thread onto the main loop's
/// [`crate::rebalance::RebalanceHandler`].
pub async fn run_rebalance_pump(
    mut rx: RebalanceNoticeReceiver,
    handler: std::sync::Arc<crate::rebalance::RebalanceHandler>,
) {
    while let Some(notice) = rx.recv().await {
        match notice {
            RebalanceNotice::Revoked { tps, done } => {
                handler.on_partitions_revoked(tps).await;
                let _ = done.send(());
            }
            RebalanceNotice::Assigned { tps, done } => {
                handler.on_partitions_assigned(tps).await;
                let _ = done.send(());
            }
        }
    }
}
