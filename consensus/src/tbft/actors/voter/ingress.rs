use crate::tbft::types::{ConsensusState, Hash, Height};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use tracing::{debug, error};

pub enum Message {
    /// Request a copy of the current consensus state.
    Snapshot {
        response: oneshot::Sender<ConsensusState>,
    },
    /// Blocks up to `height` were committed outside of consensus.
    Committed { height: Height, parent: Hash },
}

/// Handle to the voter.
///
/// The voter stops (after persisting its state) once every clone has been dropped.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Copy of the voter's consensus state (or `None` if the voter has stopped).
    pub async fn snapshot(&mut self) -> Option<ConsensusState> {
        let (response, receiver) = oneshot::channel();
        if let Err(err) = self.sender.send(Message::Snapshot { response }).await {
            error!(?err, "failed to send message to voter");
            return None;
        }
        receiver.await.ok()
    }

    /// Skip to the height after `height`, building on `parent`.
    pub async fn committed(&mut self, height: Height, parent: Hash) {
        if let Err(err) = self
            .sender
            .send(Message::Committed { height, parent })
            .await
        {
            error!(?err, "failed to send message to voter");
        }
    }
}

/// Read-only handle to the voter that does not keep it running.
#[derive(Clone)]
pub struct Reader {
    sender: mpsc::Sender<oneshot::Sender<ConsensusState>>,
}

impl Reader {
    pub(super) fn new(sender: mpsc::Sender<oneshot::Sender<ConsensusState>>) -> Self {
        Self { sender }
    }

    /// Copy of the voter's consensus state (or `None` if the voter has stopped).
    pub async fn snapshot(&mut self) -> Option<ConsensusState> {
        let (response, receiver) = oneshot::channel();
        if self.sender.send(response).await.is_err() {
            debug!("voter stopped");
            return None;
        }
        receiver.await.ok()
    }
}
