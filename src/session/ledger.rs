use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use tokio::time::Instant;

use crate::protocol::body::AckEntry;


/// Delivered but not yet acknowledged messages of a session, in delivery order. Only the
///  (consumer, message) pair is kept, not the message itself.
#[derive(Debug, Default)]
pub struct UnackedLedger {
    /// each entry with the time it was added, for time based flushing
    entries: VecDeque<(AckEntry, Instant)>,
    index: FxHashSet<AckEntry>,
}

impl UnackedLedger {
    pub fn new() -> UnackedLedger {
        Default::default()
    }

    /// Appends an entry, returning `false` if it is in the ledger already (e.g. a message that
    ///  was acknowledged in a transaction before and is delivered again)
    pub fn push(&mut self, entry: AckEntry) -> bool {
        if !self.index.insert(entry) {
            return false;
        }
        self.entries.push_back((entry, Instant::now()));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, entry: &AckEntry) -> bool {
        self.index.contains(entry)
    }

    /// when the oldest entry still in the ledger was added
    pub fn first_added_at(&self) -> Option<Instant> {
        self.entries.front().map(|(_, added_at)| *added_at)
    }

    pub fn entries(&self) -> impl Iterator<Item = &AckEntry> {
        self.entries.iter().map(|(e, _)| e)
    }

    pub fn take_all(&mut self) -> Vec<AckEntry> {
        self.index.clear();
        self.entries.drain(..).map(|(e, _)| e).collect()
    }

    /// Removes and returns exactly the given entry, if present
    pub fn take_matching(&mut self, entry: &AckEntry) -> Option<AckEntry> {
        if !self.index.remove(entry) {
            return None;
        }
        let idx = self.entries.iter().position(|(e, _)| e == entry)?;
        self.entries.remove(idx).map(|(e, _)| e)
    }

    /// Removes and returns all entries up to and including `entry`, in delivery order. If the
    ///  entry is not in the ledger, nothing is removed.
    pub fn take_through(&mut self, entry: &AckEntry) -> Vec<AckEntry> {
        if !self.index.contains(entry) {
            return Vec::new();
        }
        let Some(idx) = self.entries.iter().position(|(e, _)| e == entry) else {
            return Vec::new();
        };
        let result = self.entries.drain(..=idx).map(|(e, _)| e).collect::<Vec<_>>();
        for e in &result {
            self.index.remove(e);
        }
        result
    }

    /// Drops all entries of a consumer without acknowledging them
    pub fn remove_consumer(&mut self, consumer_id: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(e, _)| e.consumer_id != consumer_id);
        self.index.retain(|e| e.consumer_id != consumer_id);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
