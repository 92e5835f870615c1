use super::timeout::Timeouts;
use crate::{
    AccessControl, Automaton, Committer, FaultInjectionPolicy, Ledger, Reporter, Store,
    Supervisor,
};
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Configuration for the consensus engine.
pub struct Config<
    C: AccessControl,
    A: Automaton,
    F: Committer,
    S: Supervisor,
    L: Ledger,
    D: Store,
    R: Reporter,
    P: FaultInjectionPolicy,
> {
    /// Signing and authentication of messages.
    pub crypto: C,

    /// Automaton for the consensus engine.
    pub automaton: A,

    /// Committer for the consensus engine.
    pub committer: F,

    /// Supervisor for the consensus engine.
    pub supervisor: S,

    /// Ledger used to determine the height to resume from.
    pub ledger: L,

    /// Durable storage for consensus state.
    pub store: D,

    /// Reporter for the consensus engine.
    pub reporter: R,

    /// Deviations from the protocol (use [crate::Honest] outside of tests).
    pub faults: P,

    /// Registry for metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Prefix for all signed messages to prevent replay attacks.
    pub namespace: Vec<u8>,

    /// Maximum number of messages to buffer on channels inside the consensus
    /// engine before blocking.
    pub mailbox_size: usize,

    /// Step timeouts.
    pub timeouts: Timeouts,

    /// Interval at which state is gossiped to peers.
    pub gossip_interval: Duration,

    /// Number of peers to gossip state to on each interval.
    pub gossip_fanout: usize,

    /// Maximum number of votes for future rounds (at the current height) to
    /// retain until the round is entered.
    ///
    /// If `None`, such votes are dropped.
    pub future_round_buffer: Option<usize>,

    /// Whether precommits and proposals from earlier rounds of the current height may still
    /// complete a commit.
    ///
    /// If `false`, messages for rounds behind the current round are dropped. Enable this when
    /// validators rely on gossip (which re-sends the last commit to lagging peers) instead of
    /// an external sync to recover from falling behind.
    pub earlier_round_commits: bool,
}

impl<
        C: AccessControl,
        A: Automaton,
        F: Committer,
        S: Supervisor,
        L: Ledger,
        D: Store,
        R: Reporter,
        P: FaultInjectionPolicy,
    > Config<C, A, F, S, L, D, R, P>
{
    /// Assert enforces that all configuration values are valid.
    pub fn assert(&self) {
        assert!(
            self.mailbox_size > 0,
            "mailbox size must be greater than zero"
        );
        assert!(
            self.timeouts.propose.base > Duration::default(),
            "propose timeout must be greater than zero"
        );
        assert!(
            self.timeouts.prevote.base > Duration::default(),
            "prevote timeout must be greater than zero"
        );
        assert!(
            self.timeouts.precommit.base > Duration::default(),
            "precommit timeout must be greater than zero"
        );
        assert!(
            self.gossip_interval > Duration::default(),
            "gossip interval must be greater than zero"
        );
        assert!(
            self.gossip_fanout > 0,
            "it must be possible to gossip to at least one peer"
        );
        if let Some(limit) = self.future_round_buffer {
            assert!(
                limit > 0,
                "future round buffer must be greater than zero (or disabled)"
            );
        }
    }
}
