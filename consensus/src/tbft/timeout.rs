//! Multiplex step timeouts onto a single deadline.
//!
//! Timeouts are never cancelled. When a height or round changes, any pending timeout for an
//! earlier `(height, round)` becomes stale and is ignored by consensus when it fires (or
//! pruned before it does).

use super::types::{Height, Round, Step, TimeoutInfo};
use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};
use tokio::time::Instant;

/// Duration that grows linearly with the round (`base + delta * round`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Escalation {
    pub base: Duration,
    pub delta: Duration,
}

impl Escalation {
    pub const fn new(base: Duration, delta: Duration) -> Self {
        Self { base, delta }
    }

    /// Duration of the timeout at `round`.
    pub fn at(&self, round: Round) -> Duration {
        self.base.saturating_add(self.delta.saturating_mul(round))
    }
}

/// Timeout configuration for each step that waits on the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Amount of time to wait for a proposal before prevoting nil.
    pub propose: Escalation,

    /// Amount of time to wait for a prevote quorum before precommitting nil.
    pub prevote: Escalation,

    /// Amount of time to wait for a precommit quorum before moving to the next round.
    pub precommit: Escalation,
}

impl Timeouts {
    /// Timeout to schedule when entering `step` at `round` (if the step has one).
    pub fn duration(&self, step: Step, round: Round) -> Option<Duration> {
        match step {
            Step::Propose => Some(self.propose.at(round)),
            Step::Prevote => Some(self.prevote.at(round)),
            Step::Precommit => Some(self.precommit.at(round)),
            Step::NewHeight | Step::NewRound | Step::Commit => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    info: TimeoutInfo,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of pending timeouts.
#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `info` to fire `duration` after `now`.
    ///
    /// Timeouts with equal deadlines fire in the order they were added.
    pub fn add_timeout(&mut self, now: Instant, duration: Duration, info: TimeoutInfo) {
        let deadline = now.checked_add(duration).unwrap_or(now);
        self.heap.push(Entry {
            deadline,
            seq: self.seq,
            info,
        });
        self.seq += 1;
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pop the earliest timeout if its deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimeoutInfo> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|entry| entry.info)
    }

    /// Drop every timeout for a `(height, round)` before the one provided.
    pub fn prune(&mut self, height: Height, round: Round) {
        self.heap
            .retain(|entry| (entry.info.height, entry.info.round) >= (height, round));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
