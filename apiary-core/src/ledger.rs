//! Append-only ordered log with time- and count-based retention.
//!
//! Architecture:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Ledger<E>                      │
//! │                                               │
//! │  oldest [ e1 | e2 | e3 | ... | eN ] newest    │
//! │          seq 1   2    3         N             │
//! │                                               │
//! │  append     → stamp next_sequence, push back  │
//! │  recent(k)  → eN, eN-1, ... (no mutation)     │
//! │  prune_*    → drop entries, survivors keep    │
//! │               their relative order            │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The sequence counter is the only ordering authority; entry timestamps
//! are used for retention only.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use thiserror::Error;

use crate::clock::{duration_ms, Millis};

/// Record kept by a [`Ledger`].
pub trait LedgerEntry {
    /// Sequence assigned at append time, if any.
    fn sequence(&self) -> Option<u64>;
    /// Record the assigned sequence.
    fn stamp(&mut self, sequence: u64);
    /// Wall-clock time used for age-based retention.
    fn timestamp(&self) -> Millis;
    /// Owner used for per-actor caps.
    fn actor(&self) -> &str;
}

/// Ledger invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The entry already carries a sequence number; appending it again
    /// would duplicate a position in the log.
    #[error("entry already sequenced at {0}")]
    AlreadySequenced(u64),
}

/// What a pruning pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub by_age: usize,
    pub by_count: usize,
}

impl PruneStats {
    pub fn total(&self) -> usize {
        self.by_age + self.by_count
    }
}

#[derive(Debug)]
pub struct Ledger<E> {
    entries: VecDeque<E>,
    next_sequence: u64,
    total_appended: u64,
}

impl<E> Default for Ledger<E> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            next_sequence: 1,
            total_appended: 0,
        }
    }
}

impl<E: LedgerEntry> Ledger<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `entry` with the next sequence and append it.
    ///
    /// Returns the assigned sequence. An already-stamped entry is rejected
    /// and the ledger is left unchanged.
    pub fn append(&mut self, mut entry: E) -> Result<u64, LedgerError> {
        if let Some(existing) = entry.sequence() {
            return Err(LedgerError::AlreadySequenced(existing));
        }
        let seq = self.next_sequence;
        self.next_sequence += 1;
        entry.stamp(seq);
        self.entries.push_back(entry);
        self.total_appended += 1;
        log::trace!("Ledger append seq={seq}");
        Ok(seq)
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<&E> {
        self.entries.iter().rev().take(limit).collect()
    }

    /// Newest-first iterator over entries matching `pred`.
    pub fn recent_matching<'a, P>(&'a self, pred: P) -> impl Iterator<Item = &'a E> + 'a
    where
        P: Fn(&E) -> bool + 'a,
        E: 'a,
    {
        self.entries.iter().rev().filter(move |e| pred(*e))
    }

    /// Oldest-first iterator.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter()
    }

    pub fn find<P>(&self, pred: P) -> Option<&E>
    where
        P: Fn(&E) -> bool,
    {
        self.entries.iter().find(|e| pred(*e))
    }

    /// Keep only entries younger than `max_age` at `now`.
    pub fn prune_older_than(&mut self, max_age: Duration, now: Millis) -> usize {
        let max_age = duration_ms(max_age);
        let before = self.entries.len();
        self.entries.retain(|e| now.saturating_sub(e.timestamp()) < max_age);
        before - self.entries.len()
    }

    /// Keep at most `max_count` of each actor's most recent entries.
    pub fn prune_to_count_per_actor(&mut self, max_count: usize) -> usize {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut keep = vec![false; self.entries.len()];
        for (i, entry) in self.entries.iter().enumerate().rev() {
            let count = seen.entry(entry.actor().to_string()).or_insert(0);
            if *count < max_count {
                *count += 1;
                keep[i] = true;
            }
        }

        let before = self.entries.len();
        let mut flags = keep.into_iter();
        self.entries.retain(|_| flags.next().unwrap_or(false));
        before - self.entries.len()
    }

    /// Keep only the `max_len` most recent entries overall.
    pub fn truncate_to(&mut self, max_len: usize) -> usize {
        let excess = self.entries.len().saturating_sub(max_len);
        self.entries.drain(..excess);
        excess
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence of the most recently appended entry, if any was ever appended.
    pub fn last_sequence(&self) -> Option<u64> {
        (self.next_sequence > 1).then(|| self.next_sequence - 1)
    }

    /// Entries appended since creation, pruned ones included.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}
