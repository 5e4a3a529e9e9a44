use std::sync::Arc;
use std::time::Duration;

use crate::commit::CommitCoordinator;
use crate::driver::Driver;
use crate::ledger::AckLedger;

/// Hard ceiling applied to the per-iteration ack wait in [`wait_empty`].
///
/// Spec open question: the source arms a future with a caller-provided
/// timeout but then waits on it with a hard-coded 1s timeout. We resolve
/// the ambiguity as "wait at most `min(caller_timeout, 1s)`" (see
/// DESIGN.md), which this constant encodes.
const WAIT_EMPTY_ITERATION_CAP: Duration = Duration::from_secs(1);

/// Drains in-flight work before the consumer stops or yields partitions on
/// a rebalance.
pub struct ShutdownDrainer<D: Driver + ?Sized> {
    ledger: Arc<AckLedger>,
    coordinator: Arc<CommitCoordinator<D>>,
}

impl<D: Driver + ?Sized + 'static> ShutdownDrainer<D> {
    pub fn new(ledger: Arc<AckLedger>, coordinator: Arc<CommitCoordinator<D>>) -> Self {
        Self { ledger, coordinator }
    }

    /// Commits repeatedly, waiting for further acks between attempts, until
    /// `unacked` is empty or `stopping` reports the service is no longer
    /// live. `per_iteration_timeout` is clamped to at most 1 second.
    ///
    /// Commits at the top of every iteration, including the one that
    /// observes `unacked` has just become empty: otherwise the ack that
    /// drained it would never be reflected in a commit call.
    pub async fn wait_empty(&self, per_iteration_timeout: Duration, stopping: impl Fn() -> bool) {
        let wait = per_iteration_timeout.min(WAIT_EMPTY_ITERATION_CAP);

        loop {
            self.coordinator.commit(None).await;
            if stopping() || self.ledger.is_unacked_empty().await {
                break;
            }
            self.ledger.wait_for_ack(wait).await;
        }
    }

    /// Runs `wait_empty` if `stream_wait_empty` is enabled, else performs a
    /// single final commit. Either way, the caller is expected to clear the
    /// livelock clock afterward (the fetcher owns that timestamp).
    pub async fn shutdown(&self, stream_wait_empty: bool, stopping: impl Fn() -> bool) {
        if stream_wait_empty {
            self.wait_empty(WAIT_EMPTY_ITERATION_CAP, stopping).await;
        } else {
            self.coordinator.commit(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::{AttachmentsRegistry, JoinAllProducer};
    use crate::fetcher::LivelockClock;
    use crate::message::Message;
    use crate::test_support::MockDriver;
    use crate::topic_partition::TopicPartition;

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    #[tokio::test]
    async fn wait_empty_drains_after_ack_and_commit() {
        let driver = Arc::new(MockDriver::new());
        driver.set_assignment([tp()].into_iter().collect());
        let ledger = Arc::new(AckLedger::new());
        let coordinator = Arc::new(CommitCoordinator::new(
            driver,
            ledger.clone(),
            Arc::new(AttachmentsRegistry::new()),
            Arc::new(JoinAllProducer),
            Arc::new(LivelockClock::new()),
        ));
        let drainer = ShutdownDrainer::new(ledger.clone(), coordinator);

        let message = Arc::new(Message::new(tp(), 1, None, None, None));
        ledger.track(&message).await;
        assert!(!ledger.is_unacked_empty().await);

        let ack_ledger = ledger.clone();
        let ack_message = message.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ack_ledger.ack(&ack_message).await;
        });

        drainer.wait_empty(Duration::from_millis(50), || false).await;
        assert!(ledger.is_unacked_empty().await);
        assert_eq!(ledger.committed_offset(&tp()).await, Some(1));
    }
}
