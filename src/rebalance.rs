use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::fetcher::LivelockClock;
use crate::flow::FlowController;
use crate::ledger::AckLedger;
use crate::topic_partition::TopicPartition;

pub type RevokedCallback = Arc<dyn Fn(HashSet<TopicPartition>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type AssignedCallback = Arc<dyn Fn(HashSet<TopicPartition>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type RebalanceStartCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Applies broker rebalance notifications to local state before handing
/// control to the application's own revoke/assign callbacks.
///
/// The local-state-first ordering matters: if the external revoke callback
/// ran before `active_partitions` was pruned, the fetcher could race a new
/// fetch cycle against the broker's own reassignment of the revoked TPs.
pub struct RebalanceHandler {
    flow: Arc<FlowController>,
    ledger: Arc<AckLedger>,
    clock: Arc<LivelockClock>,
    on_rebalance_start: Option<RebalanceStartCallback>,
    on_revoked: Option<RevokedCallback>,
    on_assigned: Option<AssignedCallback>,
    rebalancing: AtomicBool,
}

impl RebalanceHandler {
    pub fn new(flow: Arc<FlowController>, ledger: Arc<AckLedger>, clock: Arc<LivelockClock>) -> Self {
        Self {
            flow,
            ledger,
            clock,
            on_rebalance_start: None,
            on_revoked: None,
            on_assigned: None,
            rebalancing: AtomicBool::new(false),
        }
    }

    pub fn with_callbacks(
        mut self,
        on_rebalance_start: Option<RebalanceStartCallback>,
        on_revoked: Option<RevokedCallback>,
        on_assigned: Option<AssignedCallback>,
    ) -> Self {
        self.on_rebalance_start = on_rebalance_start;
        self.on_revoked = on_revoked;
        self.on_assigned = on_assigned;
        self
    }

    /// True while a rebalance transition is being processed; surfaced for
    /// health/observability checks.
    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::Acquire)
    }

    pub async fn on_partitions_revoked(&self, revoked: HashSet<TopicPartition>) {
        self.rebalancing.store(true, Ordering::Release);
        if let Some(cb) = &self.on_rebalance_start {
            cb().await;
        }

        self.flow.on_revoked(&revoked).await;
        info!(count = revoked.len(), "partitions revoked");

        // Ledger entries for the revoked TPs stay alive through the
        // external callback: it is expected to drain streams and trigger a
        // final commit for them before the broker finishes reassigning, and
        // that commit needs `acked` to still hold their offsets. Only once
        // the callback returns do we drop them, so a leftover ack can't
        // wedge memory if the TP is never reassigned back to us.
        if let Some(cb) = &self.on_revoked {
            cb(revoked.clone()).await;
        }
        self.ledger.forget_partitions(&revoked).await;
        self.rebalancing.store(false, Ordering::Release);
    }

    pub async fn on_partitions_assigned(&self, assigned: HashSet<TopicPartition>) {
        self.rebalancing.store(true, Ordering::Release);
        self.flow.on_assigned(&assigned).await;
        self.clock.clear().await;
        info!(count = assigned.len(), "partitions assigned");

        if let Some(cb) = &self.on_assigned {
            cb(assigned).await;
        }
        self.rebalancing.store(false, Ordering::Release);
    }
}
