use super::{
    actors::{gossip, voter},
    config::Config,
    metrics::Metrics,
    types::ValidatorId,
    FatalConsensusError,
};
use crate::{
    AccessControl, Automaton, Committer, FaultInjectionPolicy, Ledger, Reporter, Store,
    Supervisor,
};
use tbft_p2p::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::debug;

/// Instance of `tbft` consensus engine.
pub struct Engine<
    C: AccessControl,
    A: Automaton,
    F: Committer,
    S: Supervisor,
    L: Ledger,
    D: Store,
    R: Reporter,
    P: FaultInjectionPolicy,
> {
    voter: voter::Actor<C, A, F, S, L, D, R, P>,
    gossip: gossip::Actor,
    gossip_mailbox: gossip::Mailbox,
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
    > Engine<C, A, F, S, L, D, R, P>
{
    /// Create a new `tbft` consensus engine.
    ///
    /// The returned mailbox can be used to inspect consensus state or to skip ahead after
    /// blocks are committed outside of consensus. Dropping it (and every clone) stops the
    /// engine.
    pub fn new(cfg: Config<C, A, F, S, L, D, R, P>) -> (Self, voter::Mailbox) {
        // Ensure configuration is valid
        cfg.assert();
        let metrics = Metrics::init(&cfg.registry);
        let me = cfg.crypto.me();

        // Create voter
        let (voter, voter_mailbox, voter_reader) = voter::Actor::new(voter::Config {
            crypto: cfg.crypto,
            automaton: cfg.automaton,
            committer: cfg.committer,
            supervisor: cfg.supervisor,
            ledger: cfg.ledger,
            store: cfg.store,
            reporter: cfg.reporter,
            faults: cfg.faults,
            metrics: metrics.clone(),
            namespace: cfg.namespace,
            mailbox_size: cfg.mailbox_size,
            timeouts: cfg.timeouts,
            future_round_buffer: cfg.future_round_buffer,
            earlier_round_commits: cfg.earlier_round_commits,
        });

        // Create gossip
        let (gossip, gossip_mailbox) = gossip::Actor::new(gossip::Config {
            me,
            voter: voter_reader,
            metrics,
            mailbox_size: cfg.mailbox_size,
            interval: cfg.gossip_interval,
            fanout: cfg.gossip_fanout,
        });

        (
            Self {
                voter,
                gossip,
                gossip_mailbox,
            },
            voter_mailbox,
        )
    }

    /// Start the `tbft` consensus engine.
    ///
    /// Resumes from the ledger's last committed block and any consensus state persisted in the
    /// store. The returned handle resolves once the network or every mailbox closes (or with
    /// the invariant that was violated).
    pub fn start(
        self,
        sender: impl Sender<PublicKey = ValidatorId>,
        receiver: impl Receiver<PublicKey = ValidatorId>,
    ) -> JoinHandle<Result<(), FatalConsensusError>> {
        tokio::spawn(self.run(sender, receiver))
    }

    async fn run(
        self,
        sender: impl Sender<PublicKey = ValidatorId>,
        receiver: impl Receiver<PublicKey = ValidatorId>,
    ) -> Result<(), FatalConsensusError> {
        // Start gossip
        let gossip = tokio::spawn(self.gossip.run(sender.clone()));

        // Run the voter until it stops
        let result = self
            .voter
            .run(self.gossip_mailbox, sender, receiver)
            .await;
        debug!(?result, "voter finished");
        gossip.abort();
        result
    }
}
