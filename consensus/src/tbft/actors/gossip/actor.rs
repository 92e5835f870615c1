use super::{
    ingress::{Mailbox, Message},
    reconcile, Config,
};
use crate::tbft::{
    actors::voter,
    metrics::Metrics,
    types::{ConsensusMessage, GossipState, ValidatorId},
};
use futures::{channel::mpsc, StreamExt};
use rand::{rngs::StdRng, seq::IteratorRandom, SeedableRng};
use std::{collections::BTreeSet, time::Duration};
use tbft_p2p::{Recipients, Sender};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

pub struct Actor {
    me: ValidatorId,
    voter: voter::Reader,
    metrics: Metrics,
    interval: Duration,
    fanout: usize,
    rng: StdRng,

    peers: BTreeSet<ValidatorId>,
    mailbox_receiver: mpsc::Receiver<Message>,
    peers_receiver: mpsc::UnboundedReceiver<Message>,
}

impl Actor {
    pub fn new(cfg: Config) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        let (peers_sender, peers_receiver) = mpsc::unbounded();
        (
            Self {
                me: cfg.me,
                voter: cfg.voter,
                metrics: cfg.metrics,
                interval: cfg.interval,
                fanout: cfg.fanout,
                rng: StdRng::from_entropy(),
                peers: BTreeSet::new(),
                mailbox_receiver: receiver,
                peers_receiver,
            },
            Mailbox::new(sender, peers_sender),
        )
    }

    /// Run until the voter or the mailbox closes.
    pub async fn run(mut self, mut sender: impl Sender<PublicKey = ValidatorId>) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(state) = self.voter.snapshot().await else {
                        debug!("voter closed");
                        return;
                    };
                    let recipients = self
                        .peers
                        .iter()
                        .filter(|peer| **peer != self.me)
                        .cloned()
                        .choose_multiple(&mut self.rng, self.fanout);
                    if recipients.is_empty() {
                        continue;
                    }
                    let message = ConsensusMessage::GossipState(GossipState::new(self.me.clone(), &state));
                    self.metrics.outbound(&message);
                    if let Err(err) = sender.send(Recipients::Some(recipients), message.encode(), false).await {
                        warn!(?err, "failed to send gossip state");
                    }
                },
                message = self.peers_receiver.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed");
                        return;
                    };
                    if !self.handle(&mut sender, message).await {
                        return;
                    }
                },
                message = self.mailbox_receiver.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed");
                        return;
                    };
                    if !self.handle(&mut sender, message).await {
                        return;
                    }
                },
            }
        }
    }

    /// Returns whether the voter is still running.
    async fn handle(
        &mut self,
        sender: &mut impl Sender<PublicKey = ValidatorId>,
        message: Message,
    ) -> bool {
        match message {
            Message::Peers { added, removed } => {
                debug!(added = added.len(), removed = removed.len(), "updating peers");
                for peer in &removed {
                    self.peers.remove(peer);
                }
                self.peers.extend(added);
            }
            Message::PeerState { peer, state } => {
                let Some(current) = self.voter.snapshot().await else {
                    debug!("voter closed");
                    return false;
                };
                let missing = reconcile(&current, &state);
                if !missing.is_empty() {
                    trace!(%peer, height = state.height, round = state.round, count = missing.len(), "sending missing messages");
                }
                for message in missing {
                    self.metrics.gossip_sent.inc();
                    self.metrics.outbound(&message);
                    if let Err(err) = sender
                        .send(Recipients::One(peer.clone()), message.encode(), false)
                        .await
                    {
                        warn!(?err, "failed to send gossip");
                    }
                }
            }
        }
        true
    }
}
