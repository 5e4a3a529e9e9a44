use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::topic_partition::TopicPartition;

/// Gates the fetcher loop and tracks which partitions it should currently
/// pull from.
///
/// `active_partitions` and `paused_partitions` are kept disjoint (invariant
/// 6): pausing moves TPs out of active into paused, resuming does the
/// reverse, and a rebalance filters both sets against the new assignment.
pub struct FlowController {
    sets: Mutex<PartitionSets>,
    flow_active: AtomicBool,
    latch: Notify,
}

#[derive(Default)]
struct PartitionSets {
    active: HashSet<TopicPartition>,
    paused: HashSet<TopicPartition>,
    /// Whether `active` has been initialized from the driver's assignment
    /// yet. Lazily derived on first use after a rebalance, per the spec.
    initialized: bool,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowController {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(PartitionSets::default()),
            flow_active: AtomicBool::new(true),
            latch: Notify::new(),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.sets.lock().await.initialized
    }

    /// Seeds `active_partitions` from the driver's current assignment, if it
    /// hasn't been seeded yet. The spec calls for this to happen lazily, on
    /// first use after a rebalance; callers check [`is_initialized`] first
    /// so the (async) call to the driver only happens when actually needed.
    pub async fn ensure_initialized(&self, assignment: HashSet<TopicPartition>) {
        let mut sets = self.sets.lock().await;
        if !sets.initialized {
            sets.active = assignment.difference(&sets.paused).cloned().collect();
            sets.initialized = true;
        }
    }

    pub async fn active_partitions(&self) -> HashSet<TopicPartition> {
        self.sets.lock().await.active.clone()
    }

    /// The union of active and paused partitions: everything currently
    /// assigned to this consumer, regardless of flow-control state. Used by
    /// the commit coordinator to filter out revoked TPs before committing.
    pub async fn assigned_partitions(&self) -> HashSet<TopicPartition> {
        let sets = self.sets.lock().await;
        sets.active.union(&sets.paused).cloned().collect()
    }

    pub async fn pause_partitions(&self, tps: &HashSet<TopicPartition>) {
        let mut sets = self.sets.lock().await;
        for tp in tps {
            sets.active.remove(tp);
            sets.paused.insert(tp.clone());
        }
    }

    pub async fn resume_partitions(&self, tps: &HashSet<TopicPartition>) {
        let mut sets = self.sets.lock().await;
        for tp in tps {
            sets.paused.remove(tp);
            sets.active.insert(tp.clone());
        }
    }

    pub async fn on_revoked(&self, revoked: &HashSet<TopicPartition>) {
        let mut sets = self.sets.lock().await;
        for tp in revoked {
            sets.active.remove(tp);
            sets.paused.remove(tp);
        }
    }

    pub async fn on_assigned(&self, assigned: &HashSet<TopicPartition>) {
        let mut sets = self.sets.lock().await;
        sets.paused = sets.paused.intersection(assigned).cloned().collect();
        sets.active = assigned.difference(&sets.paused).cloned().collect();
        sets.initialized = true;
    }

    pub fn is_flow_active(&self) -> bool {
        self.flow_active.load(Ordering::Acquire)
    }

    pub fn stop_flow(&self) {
        self.flow_active.store(false, Ordering::Release);
    }

    pub fn resume_flow(&self) {
        self.flow_active.store(true, Ordering::Release);
        self.latch.notify_waiters();
    }

    /// Awaits the flow latch until [`FlowController::resume_flow`] is called.
    pub async fn wait_until_active(&self) {
        if self.is_flow_active() {
            return;
        }
        self.latch.notified().await;
    }
}
