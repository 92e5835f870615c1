use super::{
    ingress::{Mailbox, Message, Reader},
    state::{self, Action, State},
    Config,
};
use crate::{
    tbft::{
        actors::gossip,
        metrics::Metrics,
        timeout::TimeoutScheduler,
        types::{Block, ConsensusMessage, ConsensusState, Context, Hash, ValidatorId, VerifyResult},
        wire::encode_state,
        FatalConsensusError, STATE_KEY,
    },
    AccessControl, Automaton, Committer, FaultInjectionPolicy, Ledger, Reporter, Store,
    Supervisor,
};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture, Either},
    FutureExt, StreamExt,
};
use tbft_p2p::{Receiver, Recipients, Sender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

type PendingPropose = (Context, BoxFuture<'static, Result<Block, oneshot::Canceled>>);
type PendingVerify = (Context, Hash, oneshot::Receiver<bool>);

/// Drives [State] with input from the network, the automaton, and timers.
pub struct Actor<
    C: AccessControl,
    A: Automaton,
    F: Committer,
    S: Supervisor,
    L: Ledger,
    D: Store,
    R: Reporter,
    P: FaultInjectionPolicy,
> {
    state: State<C, S, P>,
    automaton: A,
    committer: F,
    ledger: L,
    store: D,
    reporter: R,
    metrics: Metrics,

    timeouts: TimeoutScheduler,
    pending_propose: Option<PendingPropose>,
    pending_verify: Option<PendingVerify>,

    mailbox_receiver: mpsc::Receiver<Message>,
    reader_receiver: mpsc::Receiver<oneshot::Sender<ConsensusState>>,
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
    > Actor<C, A, F, S, L, D, R, P>
{
    pub fn new(cfg: Config<C, A, F, S, L, D, R, P>) -> (Self, Mailbox, Reader) {
        let state = State::new(state::Config {
            crypto: cfg.crypto,
            supervisor: cfg.supervisor,
            faults: cfg.faults,
            namespace: cfg.namespace,
            timeouts: cfg.timeouts,
            future_round_buffer: cfg.future_round_buffer,
            earlier_round_commits: cfg.earlier_round_commits,
            metrics: cfg.metrics.clone(),
        });
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        let (reader_sender, reader_receiver) = mpsc::channel(cfg.mailbox_size);
        (
            Self {
                state,
                automaton: cfg.automaton,
                committer: cfg.committer,
                ledger: cfg.ledger,
                store: cfg.store,
                reporter: cfg.reporter,
                metrics: cfg.metrics,
                timeouts: TimeoutScheduler::new(),
                pending_propose: None,
                pending_verify: None,
                mailbox_receiver: receiver,
                reader_receiver,
            },
            Mailbox::new(sender),
            Reader::new(reader_sender),
        )
    }

    /// Run until the network or mailbox closes (or an invariant is violated).
    pub async fn run(
        mut self,
        mut gossip: gossip::Mailbox,
        mut sender: impl Sender<PublicKey = ValidatorId>,
        mut receiver: impl Receiver<PublicKey = ValidatorId>,
    ) -> Result<(), FatalConsensusError> {
        // Resume from the last committed block (and any state persisted for the next height)
        let height = self.ledger.current_height().saturating_add(1);
        let parent = self
            .ledger
            .last_committed_block()
            .map(|block| block.hash())
            .unwrap_or_default();
        let persisted = match self.store.get(STATE_KEY).await {
            Ok(persisted) => persisted,
            Err(err) => {
                error!(?err, "failed to read consensus state");
                self.metrics.persist_failures.inc();
                None
            }
        };
        self.state.start(height, parent, persisted.as_deref())?;
        self.execute(&mut gossip, &mut sender).await?;

        loop {
            let timeout = match self.timeouts.next_deadline() {
                Some(deadline) => Either::Left(sleep_until(deadline)),
                None => Either::Right(future::pending::<()>()),
            };
            let built = match self.pending_propose.as_mut() {
                Some((_, built)) => Either::Left(built),
                None => Either::Right(future::pending::<Result<Block, oneshot::Canceled>>()),
            };
            let verified = match self.pending_verify.as_mut() {
                Some((_, _, verified)) => Either::Left(verified),
                None => Either::Right(future::pending::<Result<bool, oneshot::Canceled>>()),
            };
            tokio::select! {
                biased;

                message = self.mailbox_receiver.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed");
                        break;
                    };
                    match message {
                        Message::Snapshot { response } => {
                            let _ = response.send(self.state.snapshot());
                        }
                        Message::Committed { height, parent } => {
                            self.state.fast_forward(height, parent)?;
                        }
                    }
                },
                Some(response) = self.reader_receiver.next() => {
                    let _ = response.send(self.state.snapshot());
                },
                _ = timeout => {
                    let now = Instant::now();
                    while let Some(info) = self.timeouts.pop_expired(now) {
                        self.state.handle_timeout(info)?;
                    }
                },
                built = built => {
                    let Some((context, _)) = self.pending_propose.take() else {
                        continue;
                    };
                    match built {
                        Ok(block) => {
                            self.state.proposed(context, block)?;
                        }
                        Err(_) => {
                            warn!(
                                height = context.height,
                                round = context.round,
                                "automaton dropped proposal"
                            );
                        }
                    }
                },
                verified = verified => {
                    let Some((context, block_hash, _)) = self.pending_verify.take() else {
                        continue;
                    };
                    match verified {
                        Ok(success) => {
                            self.state.verified(VerifyResult {
                                height: context.height,
                                round: context.round,
                                block_hash,
                                success,
                            })?;
                        }
                        Err(_) => {
                            debug!(
                                height = context.height,
                                round = context.round,
                                "automaton dropped verification"
                            );
                        }
                    }
                },
                message = receiver.recv() => {
                    let (peer, message) = match message {
                        Ok(message) => message,
                        Err(err) => {
                            debug!(?err, "network closed");
                            break;
                        }
                    };
                    let message = match ConsensusMessage::decode(&message) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(%peer, ?err, "failed to decode message");
                            self.metrics.invalid_messages.inc();
                            continue;
                        }
                    };
                    self.metrics.inbound(&message);
                    match message {
                        ConsensusMessage::Propose(proposal) => {
                            self.state.handle_proposal(proposal)?;
                        }
                        ConsensusMessage::Prevote(vote) | ConsensusMessage::Precommit(vote) => {
                            self.state.handle_vote(vote)?;
                        }
                        ConsensusMessage::GossipState(state) => {
                            if state.id != peer {
                                warn!(%peer, id = %state.id, "gossip state from wrong peer");
                                self.metrics.invalid_messages.inc();
                                continue;
                            }
                            gossip.peer_state(peer, state);
                        }
                    }
                },
            }
            self.execute(&mut gossip, &mut sender).await?;
        }

        // Make sure the latest state survives a restart
        self.persist().await;
        Ok(())
    }

    /// Perform all actions queued by [State] (including any queued while doing so).
    async fn execute(
        &mut self,
        gossip: &mut gossip::Mailbox,
        sender: &mut impl Sender<PublicKey = ValidatorId>,
    ) -> Result<(), FatalConsensusError> {
        loop {
            let actions = self.state.take_actions();
            if actions.is_empty() {
                break;
            }

            // Persist before anything leaves this node, so a restart can never contradict
            // a message already sent
            if actions.iter().any(|action| matches!(action, Action::Persist)) {
                self.persist().await;
            }
            for action in actions {
                match action {
                    Action::Broadcast(message) => {
                        self.send(sender, Recipients::All, message).await;
                    }
                    Action::Send(recipients, message) => {
                        if !recipients.is_empty() {
                            self.send(sender, Recipients::Some(recipients), message)
                                .await;
                        }
                    }
                    Action::Propose(context) => {
                        let receiver = self.automaton.propose(context.clone()).await;
                        let delay = self.state.propose_delay(context.height, context.round);
                        let built = async move {
                            if let Some(delay) = delay {
                                tokio::time::sleep(delay).await;
                            }
                            receiver.await
                        }
                        .boxed();
                        self.pending_propose = Some((context, built));
                    }
                    Action::Verify(context, block) => {
                        let block_hash = block.hash();
                        let receiver = self.automaton.verify(context.clone(), block).await;
                        self.pending_verify = Some((context, block_hash, receiver));
                    }
                    Action::Commit(block) => {
                        self.committer.commit(block).await;
                        self.state.committed()?;
                    }
                    Action::Timeout(duration, info) => {
                        self.timeouts.add_timeout(Instant::now(), duration, info);
                    }
                    Action::Report(activity) => {
                        self.reporter.report(activity).await;
                    }
                    Action::PeersChanged { added, removed } => {
                        gossip.peers(added, removed);
                    }
                    Action::Persist => {}
                }
            }
        }
        self.timeouts
            .prune(self.state.height(), self.state.round());
        Ok(())
    }

    async fn send(
        &mut self,
        sender: &mut impl Sender<PublicKey = ValidatorId>,
        recipients: Recipients<ValidatorId>,
        message: ConsensusMessage,
    ) {
        self.metrics.outbound(&message);
        if let Err(err) = sender.send(recipients, message.encode(), true).await {
            warn!(?err, "failed to send message");
        }
    }

    async fn persist(&mut self) {
        let encoded = encode_state(self.state.consensus());
        if let Err(err) = self.store.put(STATE_KEY, encoded).await {
            error!(?err, "failed to persist consensus state");
            self.metrics.persist_failures.inc();
        }
    }
}
