//! Core identifiers for the Raft log: terms, indices, and entries.
//!
//! These are thin newtypes rather than bare `u64`s so that a term can never be compared to an
//! index by accident. They serialize as plain integers (`#[serde(transparent)]`) so the wire
//! envelope in [`crate::rpc`] stays flat JSON rather than nested objects.

use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// The unique, monotonically-increasing ID for a term of Raft group leadership.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(pub u64);

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl AddAssign<u64> for Term {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.checked_add(rhs).expect("term overflow");
    }
}

/// A zero-based index into the Raft log. The same `(term, index)` pair uniquely identifies an
/// entry across the cluster (log matching property).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex(pub u64);

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for LogIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for LogIndex {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0.checked_add(rhs).expect("log index overflow"))
    }
}

impl Sub<u64> for LogIndex {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl LogIndex {
    pub fn checked_sub(self, rhs: u64) -> Option<Self> {
        self.0.checked_sub(rhs).map(Self)
    }

    /// Index one past the end for a log holding `len` entries.
    pub fn after(len: usize) -> Self {
        Self(len as u64)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// An entry in the Raft log, generic over the opaque command type `C` a particular service
/// replicates (§9: commands are a tagged-union/sum-type, JSON round-tripped per variant).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub index: LogIndex,
    pub command: C,
    pub timestamp: i64,
}
