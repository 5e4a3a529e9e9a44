use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::topic_partition::TopicPartition;

/// A single broker record handed to the application callback.
///
/// `acked` flips false -> true exactly once, via [`Message::mark_acked`].
/// `refcount` is decremented by downstream stream consumers as they finish
/// processing; when it reaches zero the caller is expected to ack the
/// message (see `Consumer::track_message`/`Consumer::ack`).
#[derive(Debug)]
pub struct Message {
    pub tp: TopicPartition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    acked: AtomicBool,
    refcount: AtomicI64,
}

impl Message {
    pub fn new(
        tp: TopicPartition,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            tp,
            offset,
            key,
            value,
            timestamp,
            acked: AtomicBool::new(false),
            refcount: AtomicI64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.tp.topic
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Attempts the acked=false -> true transition. Returns true iff this
    /// call performed the transition.
    pub(crate) fn mark_acked(&self) -> bool {
        self.acked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Registers one more interested subscriber; called by `track_message`.
    pub fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one subscriber's interest. Returns true iff this was the
    /// last outstanding reference, i.e. the message is now ripe for ack.
    pub fn release_ref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
}
