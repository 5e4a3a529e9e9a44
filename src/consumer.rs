//! Top-level wiring of the offset-tracking and commit engine.
//!
//! Grounded in `cymbal::consumer::start_consumer`'s shape: one struct holds
//! every collaborator, `run` spawns the long-lived tasks, and shutdown is a
//! single explicit method rather than relying on drop order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::attachments::{AttachedProducer, AttachmentsRegistry, DeliveryFuture, JoinAllProducer};
use crate::commit::{run_commit_ticker, run_livelock_detector, CommitCoordinator};
use crate::config::EngineConfig;
use crate::driver::Driver;
use crate::error::ConsumerError;
use crate::fetcher::{CommitTrigger, Fetcher, LivelockClock, RecordCallback};
use crate::flow::FlowController;
use crate::ledger::AckLedger;
use crate::message::Message;
use crate::rebalance::{AssignedCallback, RebalanceHandler, RebalanceStartCallback, RevokedCallback};
use crate::topic_partition::TopicPartition;

/// Application hooks invoked by the consumer core. All are optional except
/// `on_message`.
pub struct ConsumerCallbacks {
    pub on_message: RecordCallback,
    pub on_rebalance_start: Option<RebalanceStartCallback>,
    pub on_partitions_revoked: Option<RevokedCallback>,
    pub on_partitions_assigned: Option<AssignedCallback>,
    pub producer: Option<Arc<dyn AttachedProducer>>,
}

/// Wires the ledger, flow controller, fetcher, commit coordinator, rebalance
/// handler, and shutdown drainer into a single runnable unit.
pub struct Consumer<D: Driver + ?Sized> {
    driver: Arc<D>,
    ledger: Arc<AckLedger>,
    flow: Arc<FlowController>,
    attachments: Arc<AttachmentsRegistry>,
    rebalance: Arc<RebalanceHandler>,
    coordinator: Arc<CommitCoordinator<D>>,
    fetcher: Arc<Fetcher<D>>,
    config: EngineConfig,
    stop: Arc<AtomicBool>,
}

impl<D: Driver + ?Sized + 'static> Consumer<D> {
    pub async fn new(
        driver: Arc<D>,
        topics: Vec<String>,
        config: EngineConfig,
        callbacks: ConsumerCallbacks,
    ) -> Result<Arc<Self>, ConsumerError> {
        driver.subscribe(&topics).await?;

        let ledger = Arc::new(AckLedger::new());
        let flow = Arc::new(FlowController::new());
        let attachments = Arc::new(AttachmentsRegistry::new());
        let clock = Arc::new(LivelockClock::new());
        let rebalance = Arc::new(
            RebalanceHandler::new(flow.clone(), ledger.clone(), clock.clone()).with_callbacks(
                callbacks.on_rebalance_start,
                callbacks.on_partitions_revoked,
                callbacks.on_partitions_assigned,
            ),
        );

        let producer = callbacks.producer.unwrap_or_else(|| Arc::new(JoinAllProducer));
        let coordinator = Arc::new(CommitCoordinator::new(
            driver.clone(),
            ledger.clone(),
            attachments.clone(),
            producer,
            clock.clone(),
        ));

        let stop = Arc::new(AtomicBool::new(false));
        let commit_trigger: CommitTrigger = {
            let coordinator = coordinator.clone();
            Arc::new(move || {
                let coordinator = coordinator.clone();
                Box::pin(async move { coordinator.commit(None).await })
            })
        };

        let fetcher = Arc::new(Fetcher::new(
            driver.clone(),
            flow.clone(),
            ledger.clone(),
            callbacks.on_message,
            config.broker_commit_every,
            commit_trigger,
            stop.clone(),
            clock,
        ));

        Ok(Arc::new(Self {
            driver,
            ledger,
            flow,
            attachments,
            rebalance,
            coordinator,
            fetcher,
            config,
            stop,
        }))
    }

    /// Acknowledges a message, allowing its offset to be committed once it
    /// and every lower unacked offset for its partition have also been acked.
    pub async fn ack(&self, message: &Message) -> bool {
        self.ledger.ack(message).await
    }

    /// Attaches a pending producer delivery to the offset that caused it, so
    /// it is flushed before that offset is next committed.
    pub async fn attach_delivery(&self, tp: TopicPartition, offset: i64, future: DeliveryFuture) {
        self.attachments.attach(tp, offset, future).await;
    }

    pub fn stop_flow(&self) {
        self.flow.stop_flow();
    }

    pub fn resume_flow(&self) {
        self.flow.resume_flow();
    }

    /// Removes `tps` from `active_partitions`, moving them to `paused`.
    pub async fn pause_partitions(&self, tps: &HashSet<TopicPartition>) {
        self.flow.pause_partitions(tps).await;
    }

    /// Moves `tps` from `paused` back into `active_partitions`.
    pub async fn resume_partitions(&self, tps: &HashSet<TopicPartition>) {
        self.flow.resume_partitions(tps).await;
    }

    /// Registers a message in `unacked` ahead of dispatch to streams, firing
    /// the `on_message_in` hook. The fetcher already does this internally for
    /// records it reads off the driver; this is exposed for a dispatch layer
    /// that re-delivers the same message to further downstream consumers.
    pub async fn track_message(&self, message: &Message) {
        metrics::counter!("consumer_message_in").increment(1);
        self.ledger.track(message).await;
    }

    /// Forces an on-demand commit, restricted to `topics` if given.
    pub async fn commit(self: &Arc<Self>, topics: Option<Vec<String>>) -> bool {
        self.coordinator.commit(topics).await
    }

    /// Commits repeatedly, waiting for further acks between attempts, until
    /// `unacked` is empty.
    pub async fn wait_empty(self: &Arc<Self>) {
        let drainer =
            crate::shutdown::ShutdownDrainer::new(self.ledger.clone(), self.coordinator.clone());
        drainer
            .wait_empty(self.config.commit_interval(), || {
                self.stop.load(Ordering::Acquire)
            })
            .await;
    }

    /// Resets `read_offset[tp]`, delegates to the driver, and clears the
    /// livelock clock so the next fetch is not mistaken for stalled progress.
    pub async fn seek(&self, tp: TopicPartition, offset: i64) -> Result<(), ConsumerError> {
        self.driver.seek(&tp, offset).await?;
        self.ledger.clear_read_offset(&tp).await;
        self.fetcher.clear_livelock_clock().await;
        Ok(())
    }

    /// Initializes `read_offset` and `committed_offset` from the driver's
    /// committed state. A committed offset of 0 is normalized to "unknown":
    /// the broker cannot distinguish "committed at 0" from "never committed"
    /// before the first record, so treating both as unknown avoids rejecting
    /// the first legitimate commit at offset 0 as non-advancing.
    pub async fn perform_seek(&self) -> Result<(), ConsumerError> {
        let committed = self.driver.seek_to_committed().await?;
        for (tp, offset) in committed {
            let normalized = offset.filter(|&o| o != 0);
            self.ledger.set_committed_offset(&tp, normalized).await;
            if let Some(o) = normalized {
                self.ledger.set_read_offset(&tp, o).await;
            }
        }
        Ok(())
    }

    /// Applies a rebalance revoke notification: must be called from
    /// whatever context observes the broker's rebalance callback.
    pub async fn on_partitions_revoked(&self, revoked: HashSet<TopicPartition>) {
        self.rebalance.on_partitions_revoked(revoked).await;
    }

    pub async fn on_partitions_assigned(&self, assigned: HashSet<TopicPartition>) {
        self.rebalance.on_partitions_assigned(assigned).await;
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalance.is_rebalancing()
    }

    /// Runs the fetcher loop, commit ticker, and livelock detector until
    /// [`Consumer::stop`] is called. Returns once all three have exited.
    pub async fn run(self: &Arc<Self>) {
        info!("consumer starting");
        let interval = self.config.commit_interval();
        let soft_timeout = self.config.livelock_soft_timeout();

        let ticker = tokio::spawn(run_commit_ticker(
            self.coordinator.clone(),
            interval,
            self.stop.clone(),
        ));

        let fetcher_for_watchdog = self.fetcher.clone();
        let watchdog = tokio::spawn(run_livelock_detector(
            move || {
                let fetcher = fetcher_for_watchdog.clone();
                Box::pin(async move { fetcher.time_since_last_batch().await })
            },
            interval,
            soft_timeout,
            self.stop.clone(),
        ));

        self.fetcher.run().await;

        self.stop.store(true, Ordering::Release);
        let _ = tokio::join!(ticker, watchdog);
        info!("consumer stopped");
    }

    /// Signals the fetcher and background tasks to stop, drains unacked
    /// work per `stream_wait_empty`, and performs a final commit. The drain
    /// itself is unconditional: `stop` always waits for the ledger to empty
    /// (or the configured iteration cap) rather than bailing out early on
    /// its own stop flag.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.flow.resume_flow();

        let drainer = crate::shutdown::ShutdownDrainer::new(
            self.ledger.clone(),
            self.coordinator.clone(),
        );
        drainer
            .shutdown(self.config.stream_wait_empty, || false)
            .await;
        self.fetcher.clear_livelock_clock().await;
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }
}
