use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::message::Message;
use crate::topic_partition::TopicPartition;

/// Per-partition ack bookkeeping that turns out-of-order acknowledgements
/// into a safe, monotonically-advancing commit watermark.
///
/// All five state maps are mutated together behind a single lock so no
/// field can be observed out of sync with another; no lock is ever held
/// across an `.await`.
pub struct AckLedger {
    state: Mutex<LedgerState>,
    ack_notify: Notify,
}

#[derive(Default)]
struct LedgerState {
    acked: HashMap<TopicPartition, Vec<i64>>,
    acked_index: HashMap<TopicPartition, HashSet<i64>>,
    read_offset: HashMap<TopicPartition, i64>,
    committed_offset: HashMap<TopicPartition, i64>,
    unacked: HashMap<TopicPartition, HashSet<i64>>,
    n_acked: u64,
    /// Per-partition floor a freshly-collapsed run must start at, so a later
    /// batch of acks can't be mistaken for contiguous with an
    /// already-collapsed-and-discarded earlier run just because the two
    /// happen to be internally consecutive. `None` means no run has been
    /// collapsed for this partition yet, so the first one collapses freely.
    next_offset: HashMap<TopicPartition, i64>,
    /// Runs pulled out of `acked` by [`AckLedger::collect_commit_offsets`]
    /// but not yet confirmed committed. Held here so a failed driver commit
    /// can put them back via [`AckLedger::release_reserved`] instead of
    /// losing them outright.
    reserved: HashMap<TopicPartition, Vec<i64>>,
}

impl Default for AckLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AckLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            ack_notify: Notify::new(),
        }
    }

    /// Registers a message as dispatched-but-unacked. Called by the dispatch
    /// layer immediately before delivery to streams.
    pub async fn track(&self, message: &Message) {
        let mut state = self.state.lock().await;
        state
            .unacked
            .entry(message.tp.clone())
            .or_default()
            .insert(message.offset);
    }

    /// Idempotent acknowledgement. Returns true iff this call transitioned
    /// the message from unacked to acked, the offset was not already
    /// recorded, and the offset is still above the committed watermark.
    pub async fn ack(&self, message: &Message) -> bool {
        let tp = message.tp.clone();
        let offset = message.offset;

        let mut state = self.state.lock().await;

        let already_committed = state
            .committed_offset
            .get(&tp)
            .is_some_and(|&committed| offset <= committed);
        if already_committed {
            return false;
        }

        let already_acked = state
            .acked_index
            .get(&tp)
            .is_some_and(|set| set.contains(&offset));
        if already_acked {
            return false;
        }

        if !message.mark_acked() {
            // Another caller raced us and already flipped the flag.
            return false;
        }

        state.acked.entry(tp.clone()).or_default().push(offset);
        state.acked_index.entry(tp.clone()).or_default().insert(offset);
        if let Some(unacked) = state.unacked.get_mut(&tp) {
            unacked.remove(&offset);
        }
        state.n_acked += 1;

        self.ack_notify.notify_waiters();
        true
    }

    /// Sorts `acked[tp]`, extracts the leading maximal run of consecutive
    /// integers, removes it from both `acked[tp]` and `acked_index[tp]`, and
    /// returns its last element (the new candidate commit offset). The run
    /// must start at the partition's `next_offset` floor (see
    /// [`LedgerState::next_offset`]); if it doesn't, no offset is returned
    /// even though a shorter internally-consecutive run may exist further
    /// into the buffer.
    pub async fn new_offset(&self, tp: &TopicPartition) -> Option<i64> {
        let mut state = self.state.lock().await;
        let anchor = state.next_offset.get(tp).copied();
        let offsets = state.acked.get_mut(tp)?;
        let (last, run) = Self::collapse_run(offsets, anchor)?;
        Self::drop_from_index(&mut state, tp, &run);
        state.next_offset.insert(tp.clone(), last + 1);
        Some(last)
    }

    /// Extracts the leading maximal consecutive run from a sorted-in-place
    /// offset buffer, honoring `anchor` as the required starting point.
    fn collapse_run(offsets: &mut Vec<i64>, anchor: Option<i64>) -> Option<(i64, Vec<i64>)> {
        if offsets.is_empty() {
            return None;
        }
        offsets.sort_unstable();
        if let Some(anchor) = anchor {
            if offsets[0] != anchor {
                return None;
            }
        }

        let mut run_end = 0;
        for window in offsets.windows(2) {
            if window[1] == window[0] + 1 {
                run_end += 1;
            } else {
                break;
            }
        }
        let run: Vec<i64> = offsets.drain(..=run_end).collect();
        let last = *run.last().expect("run is non-empty by construction");
        Some((last, run))
    }

    fn drop_from_index(state: &mut LedgerState, tp: &TopicPartition, run: &[i64]) {
        if let Some(index) = state.acked_index.get_mut(tp) {
            for offset in run {
                index.remove(offset);
            }
        }
    }

    /// True iff `committed_offset[tp]` is unknown or `offset` exceeds it.
    pub async fn should_commit(&self, tp: &TopicPartition, offset: i64) -> bool {
        let state = self.state.lock().await;
        Self::should_commit_locked(&state, tp, offset)
    }

    fn should_commit_locked(state: &LedgerState, tp: &TopicPartition, offset: i64) -> bool {
        match state.committed_offset.get(tp) {
            Some(&committed) => offset > committed,
            None => true,
        }
    }

    /// Computes a commit candidate for every tracked TP passing `filter`,
    /// keeping only offsets that are still commitable. The underlying run is
    /// pulled out of `acked` into `reserved` rather than discarded: callers
    /// must follow up with either [`AckLedger::record_committed`] (on a
    /// successful driver commit) or [`AckLedger::release_reserved`]
    /// (otherwise), so a failed commit doesn't silently drop offsets it
    /// will never get another chance to commit.
    pub async fn collect_commit_offsets(
        &self,
        filter: impl Fn(&TopicPartition) -> bool,
    ) -> HashMap<TopicPartition, i64> {
        let mut state = self.state.lock().await;
        let tps: Vec<TopicPartition> = state
            .acked
            .keys()
            .filter(|tp| filter(tp))
            .cloned()
            .collect();

        let mut out = HashMap::new();
        for tp in tps {
            let anchor = state.next_offset.get(&tp).copied();
            let Some(offsets) = state.acked.get_mut(&tp) else {
                continue;
            };
            let Some((last, run)) = Self::collapse_run(offsets, anchor) else {
                continue;
            };

            if Self::should_commit_locked(&state, &tp, last) {
                Self::drop_from_index(&mut state, &tp, &run);
                state.reserved.insert(tp.clone(), run);
                out.insert(tp, last);
            } else {
                // Not actually ahead of the watermark (can happen if this tp
                // was committed through another path since the run
                // collapsed); put it back untouched.
                state.acked.get_mut(&tp).unwrap().extend(run);
            }
        }
        out
    }

    /// Confirms offsets returned by [`AckLedger::collect_commit_offsets`]
    /// were durably committed: drops their reservation and advances the
    /// commit watermark and run anchor.
    pub async fn record_committed(&self, offsets: &HashMap<TopicPartition, i64>) {
        let mut state = self.state.lock().await;
        for (tp, offset) in offsets {
            state.reserved.remove(tp);
            state.committed_offset.insert(tp.clone(), *offset);
            state.next_offset.insert(tp.clone(), offset + 1);
        }
    }

    /// Undoes a reservation made by [`AckLedger::collect_commit_offsets`]
    /// when the driver commit did not go through, restoring the run to
    /// `acked` (and its index) so it can be retried on the next attempt.
    pub async fn release_reserved(&self, tps: impl IntoIterator<Item = TopicPartition>) {
        let mut state = self.state.lock().await;
        for tp in tps {
            let Some(run) = state.reserved.remove(&tp) else {
                continue;
            };
            state
                .acked_index
                .entry(tp.clone())
                .or_default()
                .extend(run.iter().copied());
            state.acked.entry(tp).or_default().extend(run);
        }
    }

    pub async fn read_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().await.read_offset.get(tp).copied()
    }

    pub async fn set_read_offset(&self, tp: &TopicPartition, offset: i64) {
        self.state.lock().await.read_offset.insert(tp.clone(), offset);
    }

    pub async fn clear_read_offset(&self, tp: &TopicPartition) {
        self.state.lock().await.read_offset.remove(tp);
    }

    pub async fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().await.committed_offset.get(tp).copied()
    }

    pub async fn set_committed_offset(&self, tp: &TopicPartition, offset: Option<i64>) {
        let mut state = self.state.lock().await;
        match offset {
            Some(offset) => {
                state.committed_offset.insert(tp.clone(), offset);
            }
            None => {
                state.committed_offset.remove(tp);
            }
        }
    }

    pub async fn n_acked(&self) -> u64 {
        self.state.lock().await.n_acked
    }

    pub async fn reset_n_acked(&self) {
        self.state.lock().await.n_acked = 0;
    }

    pub async fn is_unacked_empty(&self) -> bool {
        self.state.lock().await.unacked.values().all(HashSet::is_empty)
    }

    pub async fn forget_partitions(&self, tps: &HashSet<TopicPartition>) {
        let mut state = self.state.lock().await;
        for tp in tps {
            state.acked.remove(tp);
            state.acked_index.remove(tp);
            state.unacked.remove(tp);
            state.next_offset.remove(tp);
            state.reserved.remove(tp);
        }
    }

    /// Awaits either the next ack notification or `timeout`, whichever
    /// comes first. Used by the shutdown drainer's wait loop.
    pub async fn wait_for_ack(&self, timeout: std::time::Duration) {
        let notified = self.ack_notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

pub type SharedLedger = Arc<AckLedger>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic_partition::TopicPartition;

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    fn msg(tp: TopicPartition, offset: i64) -> Message {
        Message::new(tp, offset, None, None, None)
    }

    #[tokio::test]
    async fn ack_then_ack_again_returns_false() {
        let ledger = AckLedger::new();
        let m = msg(tp(), 1);
        assert!(ledger.ack(&m).await);
        assert!(!ledger.ack(&m).await);
    }

    #[tokio::test]
    async fn new_offset_on_singleton_returns_it_and_empties() {
        let ledger = AckLedger::new();
        let m = msg(tp(), 7);
        ledger.ack(&m).await;
        assert_eq!(ledger.new_offset(&tp()).await, Some(7));
        assert_eq!(ledger.new_offset(&tp()).await, None);
    }

    #[tokio::test]
    async fn new_offset_stops_at_gap() {
        let ledger = AckLedger::new();
        for offset in [34, 35, 36, 40, 41] {
            ledger.ack(&msg(tp(), offset)).await;
        }
        assert_eq!(ledger.new_offset(&tp()).await, Some(36));
        // 40 and 41 remain, with no run back to them yet.
        assert_eq!(ledger.new_offset(&tp()).await, None);
        ledger.ack(&msg(tp(), 37)).await;
        ledger.ack(&msg(tp(), 38)).await;
        ledger.ack(&msg(tp(), 39)).await;
        assert_eq!(ledger.new_offset(&tp()).await, Some(41));
    }

    #[tokio::test]
    async fn commit_of_empty_ledger_returns_none() {
        let ledger = AckLedger::new();
        assert_eq!(ledger.new_offset(&tp()).await, None);
    }

    #[tokio::test]
    async fn already_committed_offset_cannot_be_reacked() {
        let ledger = AckLedger::new();
        ledger.set_committed_offset(&tp(), Some(10)).await;
        let m = msg(tp(), 10);
        assert!(!ledger.ack(&m).await);
        let m2 = msg(tp(), 11);
        assert!(ledger.ack(&m2).await);
    }

    #[tokio::test]
    async fn should_commit_respects_watermark() {
        let ledger = AckLedger::new();
        assert!(ledger.should_commit(&tp(), 0).await);
        ledger.set_committed_offset(&tp(), Some(5)).await;
        assert!(!ledger.should_commit(&tp(), 5).await);
        assert!(ledger.should_commit(&tp(), 6).await);
    }
}
