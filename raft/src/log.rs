//! In-memory storage for the Raft log.
//!
//! Per SPEC_FULL.md's resolution of the "Raft persistence" open question, this rewrite keeps
//! `currentTerm`, `votedFor`, and the log itself in memory only, matching the source. The
//! [`RaftLog`] type is the sole owner of log entries for a node; it is never accessed except
//! through the node's single mutex (§5).

use std::collections::VecDeque;

use crate::types::{LogEntry, LogIndex, Term};

/// An append-only, truncatable sequence of [`LogEntry`] values, indexed from 1.
///
/// Entry 0 is a sentinel: `prev_log_index = 0, prev_log_term = Term(0)` represents "nothing has
/// been appended yet", matching `commitIndex`/`lastApplied` starting at zero in spec.md.
pub struct RaftLog<C> {
    entries: VecDeque<LogEntry<C>>,
}

impl<C> Default for RaftLog<C> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<C: Clone> RaftLog<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry, or `LogIndex(0)` if the log is empty.
    pub fn last_index(&self) -> LogIndex {
        LogIndex::after(self.entries.len())
    }

    /// Term of the entry at `last_index`, or `Term(0)` if the log is empty.
    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or_default()
    }

    /// Term of the entry at `index`, or `None` if out of range (including index 0).
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index.0 == 0 {
            return None;
        }
        self.entries.get(index.as_usize() - 1).map(|e| e.term)
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry<C>> {
        if index.0 == 0 {
            return None;
        }
        self.entries.get(index.as_usize() - 1)
    }

    pub fn append(&mut self, entry: LogEntry<C>) {
        self.entries.push_back(entry);
    }

    /// Truncates any entries at or after `from_index`, dropping them. Used by the
    /// `AppendEntries` handler when a conflicting suffix must be discarded.
    pub fn truncate_from(&mut self, from_index: LogIndex) {
        if from_index.0 == 0 {
            self.entries.clear();
            return;
        }
        let keep = (from_index.as_usize() - 1).min(self.entries.len());
        self.entries.truncate(keep);
    }

    pub fn entries_from(&self, from_index: LogIndex) -> Vec<LogEntry<C>> {
        if from_index.0 == 0 {
            return self.entries.iter().cloned().collect();
        }
        let start = from_index.as_usize() - 1;
        self.entries.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
