use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use crate::driver::Driver;
use crate::flow::FlowController;
use crate::ledger::AckLedger;
use crate::message::Message;
use crate::topic_partition::TopicPartition;

pub type RecordCallback = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, ()> + Send + Sync>;
/// Forces an on-demand commit; returns whether one actually occurred.
pub type CommitTrigger = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Tracks time since the last commit progress, for the livelock detector.
///
/// Marked on every non-empty fetch, cleared on whatever represents forward
/// progress: a successful commit, a partitions-assigned rebalance, a seek, or
/// a clean shutdown drain. Shared (not owned by the fetcher alone) because
/// the commit coordinator and rebalance handler also need to clear it.
#[derive(Default)]
pub struct LivelockClock {
    last_progress_at: Mutex<Option<Instant>>,
}

impl LivelockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark(&self) {
        *self.last_progress_at.lock().await = Some(Instant::now());
    }

    pub async fn clear(&self) {
        *self.last_progress_at.lock().await = None;
    }

    pub async fn elapsed(&self) -> Option<Duration> {
        self.last_progress_at.lock().await.map(|t| t.elapsed())
    }
}

/// The long-lived cooperative task that pulls record batches and dispatches
/// them to the application callback in round-robin-by-topic order.
///
/// Grounded in `ingestion-consumer::consumer::IngestionConsumerLoop::run`'s
/// loop shape (stop-flag check at the head, per-cycle error backoff) fused
/// with `cymbal::consumer::start_consumer`'s per-iteration health/metrics
/// reporting, here replaced by the flow latch and livelock timestamp.
pub struct Fetcher<D: Driver + ?Sized> {
    driver: Arc<D>,
    flow: Arc<FlowController>,
    ledger: Arc<AckLedger>,
    callback: RecordCallback,
    commit_every: Option<u64>,
    commit_trigger: CommitTrigger,
    stop: Arc<AtomicBool>,
    clock: Arc<LivelockClock>,
}

impl<D: Driver + ?Sized> Fetcher<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<D>,
        flow: Arc<FlowController>,
        ledger: Arc<AckLedger>,
        callback: RecordCallback,
        commit_every: Option<u64>,
        commit_trigger: CommitTrigger,
        stop: Arc<AtomicBool>,
        clock: Arc<LivelockClock>,
    ) -> Self {
        Self {
            driver,
            flow,
            ledger,
            callback,
            commit_every,
            commit_trigger,
            stop,
            clock,
        }
    }

    /// Time since the last commit progress, for the livelock detector.
    pub async fn time_since_last_batch(&self) -> Option<Duration> {
        self.clock.elapsed().await
    }

    pub async fn clear_livelock_clock(&self) {
        self.clock.clear().await;
    }

    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub async fn run(&self) {
        loop {
            if self.is_stopping() {
                break;
            }

            self.flow.wait_until_active().await;
            if self.is_stopping() {
                break;
            }

            if !self.flow.is_initialized().await {
                match self.driver.assignment().await {
                    Ok(assignment) => self.flow.ensure_initialized(assignment).await,
                    Err(e) if e.is_stopped() => break,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to fetch assignment");
                        panic!("driver.assignment failed: {e:?}");
                    }
                }
            }

            let active = self.flow.active_partitions().await;
            if active.is_empty() {
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }

            let records = match self.driver.fetch(&active, FETCH_TIMEOUT).await {
                Ok(records) => records,
                Err(e) if e.is_stopped() => break,
                Err(e) => {
                    tracing::error!(error = %e, "fetch failed");
                    panic!("driver.fetch failed: {e:?}");
                }
            };

            // Prevents starvation if the driver returned synchronously.
            tokio::task::yield_now().await;

            if !records.is_empty() {
                self.clock.mark().await;
            }

            self.dispatch_round_robin(records, &active).await;
        }
    }

    async fn dispatch_round_robin(
        &self,
        records: HashMap<TopicPartition, Vec<crate::driver::Record>>,
        active: &std::collections::HashSet<TopicPartition>,
    ) {
        let mut topics: Vec<String> = Vec::new();
        let mut per_topic: HashMap<String, std::collections::VecDeque<crate::driver::Record>> =
            HashMap::new();

        for (_tp, recs) in records {
            for rec in recs {
                let topic = rec.tp.topic.clone();
                if !per_topic.contains_key(&topic) {
                    topics.push(topic.clone());
                }
                per_topic.entry(topic).or_default().push_back(rec);
            }
        }

        let mut rotation = topics;
        while !rotation.is_empty() {
            if !self.flow.is_flow_active() {
                return;
            }

            let mut next_rotation = Vec::with_capacity(rotation.len());
            for topic in rotation {
                let Some(queue) = per_topic.get_mut(&topic) else {
                    continue;
                };
                let Some(rec) = queue.pop_front() else {
                    continue;
                };
                if !queue.is_empty() {
                    next_rotation.push(topic);
                }

                if active.contains(&rec.tp) {
                    self.dispatch_one(rec).await;
                }

                if !self.flow.is_flow_active() {
                    return;
                }
            }
            rotation = next_rotation;
        }
    }

    async fn dispatch_one(&self, rec: crate::driver::Record) {
        metrics::counter!("consumer_message_in").increment(1);
        metrics::gauge!("consumer_partition_highwater", "tp" => rec.tp.to_string())
            .set(rec.offset as f64);

        let read_offset = self.ledger.read_offset(&rec.tp).await;
        if read_offset.is_some_and(|ro| rec.offset <= ro) {
            debug!(tp = %rec.tp, offset = rec.offset, "dropping re-delivered record");
            return;
        }

        if let Some(n) = self.commit_every {
            if self.ledger.n_acked().await >= n {
                self.ledger.reset_n_acked().await;
                (self.commit_trigger)().await;
            }
        }

        let message = Arc::new(Message::new(
            rec.tp.clone(),
            rec.offset,
            rec.key,
            rec.value,
            rec.timestamp,
        ));
        self.ledger.track(&message).await;
        (self.callback)(message).await;
        self.ledger.set_read_offset(&rec.tp, rec.offset).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Record;
    use crate::test_support::MockDriver;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(topic, partition)
    }

    #[tokio::test]
    async fn round_robin_spreads_across_topics_per_pass() {
        let mut batch = HashMap::new();
        for topic in ["a", "b"] {
            for partition in 0..2 {
                let tp = tp(topic, partition);
                let recs: Vec<Record> = (0..100)
                    .map(|i| Record {
                        tp: tp.clone(),
                        offset: i,
                        key: None,
                        value: None,
                        timestamp: None,
                    })
                    .collect();
                batch.insert(tp, recs);
            }
        }

        let driver = Arc::new(MockDriver::with_single_batch(batch.clone()));
        let flow = Arc::new(FlowController::new());
        let assignment: std::collections::HashSet<_> = batch.keys().cloned().collect();
        flow.ensure_initialized(assignment).await;
        let ledger = Arc::new(AckLedger::new());

        let per_tp_counts: Arc<StdMutex<HashMap<TopicPartition, usize>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let seen_order: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let counts = per_tp_counts.clone();
        let order = seen_order.clone();
        let callback: RecordCallback = Arc::new(move |msg| {
            let counts = counts.clone();
            let order = order.clone();
            Box::pin(async move {
                *counts.lock().unwrap().entry(msg.tp.clone()).or_default() += 1;
                order.lock().unwrap().push(msg.tp.topic.clone());
            })
        });

        let dispatched_total = Arc::new(AtomicUsize::new(0));
        let total_for_cb = dispatched_total.clone();
        let counting_callback: RecordCallback = Arc::new(move |msg| {
            let cb = callback.clone();
            let total = total_for_cb.clone();
            Box::pin(async move {
                total.fetch_add(1, Ordering::SeqCst);
                cb(msg).await;
            })
        });

        let stop = Arc::new(AtomicBool::new(false));
        let fetcher = Fetcher::new(
            driver.clone(),
            flow.clone(),
            ledger,
            counting_callback,
            None,
            Arc::new(|| Box::pin(async { false })),
            stop.clone(),
            Arc::new(LivelockClock::new()),
        );

        // Drive one fetch cycle, then stop before the driver's sentinel
        // "stopped" error would otherwise terminate the loop.
        let handle = tokio::spawn(async move { fetcher.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.store(true, Ordering::SeqCst);
        flow.resume_flow();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

        let order = seen_order.lock().unwrap();
        // First four deliveries must touch all four TPs' topics before any
        // topic repeats twice within one topic-rotation "wave": since each
        // topic has 200 combined records across its two partitions, a
        // single round-robin pass emits exactly one record per topic.
        assert_eq!(order.len() % 2, 0, "topics interleave in pairs");
        let first_two: std::collections::HashSet<_> = order.iter().take(2).cloned().collect();
        assert_eq!(first_two, ["a".to_string(), "b".to_string()].into_iter().collect());
    }
}
