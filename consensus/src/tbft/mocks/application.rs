use crate::{
    tbft::types::{Block, Context, Height, ValidatorId},
    Automaton as Au, Committer as Co, Ledger as Le,
};
use bytes::Bytes;
use futures::channel::oneshot;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Builds, verifies, and commits blocks for one validator.
///
/// Clones share the committed chain, so a restarted engine sees everything committed before.
#[derive(Clone)]
pub struct Application {
    me: ValidatorId,
    start: Height,
    reject: Arc<AtomicBool>,
    committed: Arc<Mutex<BTreeMap<Height, Block>>>,
}

impl Application {
    /// Pretend blocks up to `height` were committed before consensus started.
    pub fn starting_at(me: ValidatorId, height: Height) -> Self {
        Self {
            me,
            start: height,
            reject: Arc::new(AtomicBool::new(false)),
            committed: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Fail verification of every block.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    pub fn committed(&self) -> BTreeMap<Height, Block> {
        self.committed.lock().unwrap().clone()
    }
}

impl Au for Application {
    async fn propose(&mut self, context: Context) -> oneshot::Receiver<Block> {
        let (sender, receiver) = oneshot::channel();
        let payload = Bytes::from(format!(
            "{}:{}:{}",
            self.me, context.height, context.round
        ));
        let _ = sender.send(Block::new(context.height, context.parent, payload));
        receiver
    }

    async fn verify(&mut self, context: Context, block: Block) -> oneshot::Receiver<bool> {
        let (sender, receiver) = oneshot::channel();
        let valid = !self.reject.load(Ordering::Relaxed)
            && block.height == context.height
            && block.parent == context.parent;
        let _ = sender.send(valid);
        receiver
    }
}

impl Co for Application {
    async fn commit(&mut self, block: Block) {
        let mut committed = self.committed.lock().unwrap();
        if let Some(existing) = committed.get(&block.height) {
            assert_eq!(existing.hash(), block.hash(), "conflicting commit");
            return;
        }
        committed.insert(block.height, block);
    }
}

impl Le for Application {
    fn current_height(&self) -> Height {
        self.committed
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.start)
    }

    fn last_committed_block(&self) -> Option<Block> {
        self.committed
            .lock()
            .unwrap()
            .values()
            .next_back()
            .cloned()
    }
}
