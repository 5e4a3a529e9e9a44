use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::attachments::{AttachedProducer, AttachmentsRegistry};
use crate::driver::Driver;
use crate::fetcher::LivelockClock;
use crate::ledger::AckLedger;

const COMMIT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(300);

type CommitFuture = Shared<BoxFuture<'static, bool>>;

/// Periodic and on-demand commits, with a single-writer discipline that
/// coalesces concurrent callers onto one in-flight driver commit.
///
/// Grounded in `ingestion-consumer::consumer`'s "commit is routine, log on
/// failure, never treat it as fatal on its own" tone, combined with
/// `cymbal::consumer`'s "flush producer work, then commit offsets" ordering
/// (`txn.associate_offsets` / `txn.commit` after `send_keyed_iter_to_kafka`).
pub struct CommitCoordinator<D: Driver + ?Sized> {
    driver: Arc<D>,
    ledger: Arc<AckLedger>,
    attachments: Arc<AttachmentsRegistry>,
    producer: Arc<dyn AttachedProducer>,
    clock: Arc<LivelockClock>,
    in_flight: Mutex<Option<CommitFuture>>,
}

impl<D: Driver + ?Sized + 'static> CommitCoordinator<D> {
    pub fn new(
        driver: Arc<D>,
        ledger: Arc<AckLedger>,
        attachments: Arc<AttachmentsRegistry>,
        producer: Arc<dyn AttachedProducer>,
        clock: Arc<LivelockClock>,
    ) -> Self {
        Self {
            driver,
            ledger,
            attachments,
            producer,
            clock,
            in_flight: Mutex::new(None),
        }
    }

    /// Public entry point: coalesces with any in-flight commit. Returns
    /// `false` without committing if this call piggybacked on another.
    ///
    /// The check-for-existing and install-a-fresh-future steps happen under
    /// a single lock acquisition: splitting them across two separate lock
    /// acquisitions would let two concurrent callers both observe "no
    /// commit in flight" and both install a future, defeating the
    /// single-writer guarantee.
    pub async fn commit(self: &Arc<Self>, topics: Option<Vec<String>>) -> bool {
        let (shared, is_leader) = {
            let mut guard = self.in_flight.lock().await;
            match guard.as_ref() {
                Some(fut) => (fut.clone(), false),
                None => {
                    let this = self.clone();
                    let fut: BoxFuture<'static, bool> =
                        async move { this.force_commit(topics).await }.boxed();
                    let shared = fut.shared();
                    *guard = Some(shared.clone());
                    (shared, true)
                }
            }
        };

        let result = shared.await;

        if is_leader {
            let mut guard = self.in_flight.lock().await;
            *guard = None;
        }

        is_leader && result
    }

    /// The actual commit procedure (spec §4.E). Never call directly from
    /// more than one place concurrently; go through [`Self::commit`].
    async fn force_commit(&self, topics: Option<Vec<String>>) -> bool {
        let commit_offsets = self
            .ledger
            .collect_commit_offsets(|tp| match &topics {
                None => true,
                Some(topics) => {
                    topics.iter().any(|t| t == &tp.topic) || topics.contains(&tp.topic)
                }
            })
            .await;

        if commit_offsets.is_empty() {
            return false;
        }
        metrics::counter!("consumer_commit_initiated").increment(1);

        for (tp, offset) in &commit_offsets {
            let futures = self.attachments.publish_for_tp_offset(tp, *offset).await;
            if futures.is_empty() {
                continue;
            }
            if let Err(e) = self.producer.wait_many(tp, *offset, futures).await {
                tracing::error!(error = %e, tp = %tp, offset, "producer flush failed before commit, crashing");
                panic!("producer flush failed before commit: {e}");
            }
        }

        // Checked against the driver's own assignment, not the flow
        // controller's active/paused sets: `RebalanceHandler` prunes those
        // the moment a revoke notification arrives, before the app's revoke
        // callback (and the final commit it is expected to trigger) has run.
        // The driver's assignment only drops a partition once that callback
        // returns, so a commit issued from inside it can still land.
        let assigned = match self.driver.assignment().await {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(error = %e, "failed to query assignment before commit; deferring all offsets");
                std::collections::HashSet::new()
            }
        };
        let (commitable, revoked): (HashMap<_, _>, HashMap<_, _>) = commit_offsets
            .into_iter()
            .partition(|(tp, _)| assigned.contains(tp));

        if !revoked.is_empty() {
            for (tp, offset) in &revoked {
                info!(tp = %tp, offset, "dropping commit for revoked partition");
            }
            self.ledger.release_reserved(revoked.into_keys()).await;
        }

        if commitable.is_empty() {
            return false;
        }

        let watchdog = tokio::time::sleep(COMMIT_WATCHDOG_TIMEOUT);
        tokio::pin!(watchdog);
        let to_commit = commitable.clone();
        let commit_call = self.driver.commit(&to_commit);
        tokio::pin!(commit_call);

        let result = tokio::select! {
            result = &mut commit_call => result,
            _ = &mut watchdog => {
                warn!(partitions = commitable.len(), "commit exceeding soft timeout");
                commit_call.as_mut().await
            }
        };

        match result {
            Ok(committed) => {
                if committed {
                    self.ledger.record_committed(&commitable).await;
                    self.clock.clear().await;
                    metrics::counter!("consumer_commits").increment(1);
                    for (tp, offset) in &commitable {
                        metrics::counter!("consumer_tp_commits", "tp" => tp.to_string())
                            .increment(1);
                        metrics::gauge!("consumer_tp_committed_offset", "tp" => tp.to_string())
                            .set(*offset as f64);
                    }
                } else {
                    self.ledger.release_reserved(commitable.into_keys()).await;
                }
                committed
            }
            Err(e) => {
                debug!(error = %e, "commit call failed");
                self.ledger.release_reserved(commitable.into_keys()).await;
                false
            }
        }
    }
}

/// Runs `coordinator.commit(None)` on a fixed interval until `stop` fires.
pub async fn run_commit_ticker<D: Driver + ?Sized + 'static>(
    coordinator: Arc<CommitCoordinator<D>>,
    interval: Duration,
    stop: Arc<std::sync::atomic::AtomicBool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        if stop.load(std::sync::atomic::Ordering::Acquire) {
            break;
        }
        coordinator.commit(None).await;
    }
}

/// Emits a warning if records are being received but the commit watermark
/// has not advanced for longer than `soft_timeout`. `time_since_last_batch`
/// is cleared by the fetcher on dispatch of the next batch and by a
/// successful commit.
pub async fn run_livelock_detector(
    time_since_last_batch: impl Fn() -> BoxFuture<'static, Option<Duration>>,
    check_interval: Duration,
    soft_timeout: Duration,
    stop: Arc<std::sync::atomic::AtomicBool>,
) {
    tokio::time::sleep(check_interval.mul_f32(2.5)).await;
    loop {
        if stop.load(std::sync::atomic::Ordering::Acquire) {
            break;
        }
        if let Some(elapsed) = time_since_last_batch().await {
            if elapsed >= soft_timeout {
                warn!(elapsed_secs = elapsed.as_secs(), "livelock: no commit progress");
            }
        }
        tokio::time::sleep(check_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::JoinAllProducer;
    use crate::message::Message;
    use crate::test_support::MockDriver;
    use crate::topic_partition::TopicPartition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    async fn setup() -> (Arc<CommitCoordinator<MockDriver>>, Arc<AckLedger>, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new());
        driver.set_assignment([tp()].into_iter().collect());
        let ledger = Arc::new(AckLedger::new());
        let attachments = Arc::new(AttachmentsRegistry::new());
        let coordinator = Arc::new(CommitCoordinator::new(
            driver.clone(),
            ledger.clone(),
            attachments,
            Arc::new(JoinAllProducer),
            Arc::new(LivelockClock::new()),
        ));
        (coordinator, ledger, driver)
    }

    #[tokio::test]
    async fn commit_with_no_acks_returns_false() {
        let (coordinator, _ledger, driver) = setup().await;
        assert!(!coordinator.commit(None).await);
        assert!(driver.commit_log().is_empty());
    }

    #[tokio::test]
    async fn commit_advances_offset_and_compacts_acked() {
        let (coordinator, ledger, driver) = setup().await;
        for offset in [1, 2, 3, 5] {
            ledger.ack(&Message::new(tp(), offset, None, None, None)).await;
        }
        assert!(coordinator.commit(None).await);
        assert_eq!(driver.commit_log(), vec![HashMap::from([(tp(), 3)])]);
        assert_eq!(ledger.committed_offset(&tp()).await, Some(3));

        ledger.ack(&Message::new(tp(), 4, None, None, None)).await;
        assert!(coordinator.commit(None).await);
        assert_eq!(ledger.committed_offset(&tp()).await, Some(5));
    }

    #[tokio::test]
    async fn concurrent_commits_coalesce_to_one_driver_call() {
        let (coordinator, ledger, driver) = setup().await;
        ledger.ack(&Message::new(tp(), 1, None, None, None)).await;

        let a = coordinator.clone();
        let b = coordinator.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let (r1, r2) = tokio::join!(a.commit(None), b.commit(None));

        assert!(r1 ^ r2, "exactly one caller performs the commit");
        let _ = calls.load(Ordering::SeqCst);
        assert_eq!(driver.commit_log().len(), 1);
    }
}
