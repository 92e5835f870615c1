use crate::tbft::types::{GossipState, ValidatorId};
use futures::channel::mpsc;
use tracing::{debug, warn};

pub enum Message {
    /// The validator set changed.
    Peers {
        added: Vec<ValidatorId>,
        removed: Vec<ValidatorId>,
    },
    /// A peer reported its progress.
    PeerState { peer: ValidatorId, state: GossipState },
}

/// Non-blocking handle to the gossip actor (the voter must never wait on gossip).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,

    // Peer changes are rare and gossip is useless without them, so they are never dropped
    peers: mpsc::UnboundedSender<Message>,
}

impl Mailbox {
    pub(super) fn new(
        sender: mpsc::Sender<Message>,
        peers: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self { sender, peers }
    }

    pub fn peers(&mut self, added: Vec<ValidatorId>, removed: Vec<ValidatorId>) {
        if self
            .peers
            .unbounded_send(Message::Peers { added, removed })
            .is_err()
        {
            debug!("gossip stopped");
        }
    }

    pub fn peer_state(&mut self, peer: ValidatorId, state: GossipState) {
        if let Err(err) = self.sender.try_send(Message::PeerState { peer, state }) {
            warn!(?err, "dropping peer state");
        }
    }
}
