//! Bounded record of message ids the host has already applied
//!
//! Compaction is batched: once the ledger grows past its cap, the oldest half
//! is dropped in one go. Forgetting an id early can at worst let a stale
//! pending slot be applied a second time; it never loses a message.

use shared::MessageId;
use std::collections::{HashSet, VecDeque};

/// Default number of ids retained before compaction
pub const DEFAULT_LEDGER_CAP: usize = 100;

#[derive(Debug)]
pub struct DedupLedger {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
    cap: usize,
}

impl DedupLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap + 1),
            members: HashSet::with_capacity(cap + 1),
            cap,
        }
    }

    pub fn seen(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    /// Records `id` as applied, compacting if the cap is exceeded
    pub fn mark(&mut self, id: MessageId) {
        if !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);

        if self.order.len() > self.cap {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.members.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAP)
    }
}
