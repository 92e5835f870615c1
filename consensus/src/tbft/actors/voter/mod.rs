mod actor;
mod ingress;
mod state;

use crate::{
    tbft::{metrics::Metrics, timeout::Timeouts},
    AccessControl, Automaton, Committer, FaultInjectionPolicy, Ledger, Reporter, Store,
    Supervisor,
};
pub use actor::Actor;
pub use ingress::{Mailbox, Reader};

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
    pub crypto: C,
    pub automaton: A,
    pub committer: F,
    pub supervisor: S,
    pub ledger: L,
    pub store: D,
    pub reporter: R,
    pub faults: P,
    pub metrics: Metrics,

    pub namespace: Vec<u8>,
    pub mailbox_size: usize,
    pub timeouts: Timeouts,
    pub future_round_buffer: Option<usize>,
    pub earlier_round_commits: bool,
}
