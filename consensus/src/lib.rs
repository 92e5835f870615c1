//! Agree on a sequence of blocks among a known validator set.
//!
//! # Status
//!
//! `tbft-consensus` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! # Collaborators
//!
//! The consensus engine does not build, execute, store, or sign anything itself. It drives the protocol
//! and calls out to the collaborators defined in this module, each of which is supplied by the embedding
//! node.

use bytes::Bytes;
use futures::channel::oneshot;
use std::{error::Error as StdError, future::Future, time::Duration};
use tbft::types::{Activity, Block, Context, Endorsement, Height, Round, ValidatorId};

pub mod tbft;

/// Automaton is the interface responsible for driving the consensus forward by proposing new blocks
/// and verifying blocks proposed by other participants.
pub trait Automaton: Clone + Send + 'static {
    /// Build a new block for the given context.
    ///
    /// This is only called when this validator is the elected proposer (it is the "may propose" signal).
    /// If it is possible to build a block, it should be returned over the provided channel. If it is not
    /// possible, the channel can be dropped. If construction takes too long, the consensus engine may
    /// drop the block.
    fn propose(&mut self, context: Context) -> impl Future<Output = oneshot::Receiver<Block>> + Send;

    /// Verify the block is valid.
    ///
    /// If it is possible to verify the block, a boolean should be returned indicating whether
    /// the block is valid. If it is not possible to verify the block, the channel can be dropped.
    fn verify(
        &mut self,
        context: Context,
        block: Block,
    ) -> impl Future<Output = oneshot::Receiver<bool>> + Send;
}

/// Committer is the interface responsible for handling committed blocks.
pub trait Committer: Clone + Send + 'static {
    /// Event indicating the block has been committed.
    ///
    /// The block carries its quorum certificate in `additional_data` (keyed by
    /// [tbft::QUORUM_CERTIFICATE_KEY]). Consensus does not move to the next height until this returns.
    fn commit(&mut self, block: Block) -> impl Future<Output = ()> + Send;
}

/// Supervisor is the interface responsible for managing which participants are active at a given height.
///
/// ## Synchronization
///
/// It is up to the user to ensure the list returned for a height is identical (including order) across
/// all nodes. Proposer election is derived from this list and any divergence will halt consensus.
pub trait Supervisor: Clone + Send + 'static {
    /// Ordered list of validators active at `height` (or `None` if unknown).
    fn validators(&self, height: Height) -> Option<Vec<ValidatorId>>;

    /// Number of consecutive heights each validator proposes before rotation advances.
    fn blocks_per_proposer(&self, height: Height) -> u64;
}

/// Ledger provides the committed chain that consensus extends.
pub trait Ledger: Clone + Send + 'static {
    /// Height of the last committed block (zero if only genesis exists).
    fn current_height(&self) -> Height;

    /// Last committed block, if any.
    fn last_committed_block(&self) -> Option<Block>;
}

/// AccessControl signs outbound messages and authenticates inbound ones.
pub trait AccessControl: Clone + Send + 'static {
    /// Identifier of this validator.
    fn me(&self) -> ValidatorId;

    /// Sign a message.
    fn sign(&mut self, message: &[u8]) -> Endorsement;

    /// Check that `endorsement` is a valid signature over `message`.
    fn verify(&self, endorsement: &Endorsement, message: &[u8]) -> bool;

    /// Map the signer of an endorsement to the validator it belongs to.
    fn resolve(&self, signer: &Bytes) -> Option<ValidatorId>;
}

/// Store is a durable key-value store used to persist consensus state.
pub trait Store: Clone + Send + 'static {
    /// Error that can occur when reading or writing.
    type Error: StdError + Send + Sync + 'static;

    /// Read the value stored at `key`.
    fn get(&mut self, key: &[u8]) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send;

    /// Write `value` at `key` (replacing any previous value).
    fn put(&mut self, key: &[u8], value: Bytes)
        -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Reporter is the interface responsible for reporting activity to some external actor.
pub trait Reporter: Clone + Send + 'static {
    /// Report some activity observed by the consensus implementation.
    fn report(&mut self, activity: Activity) -> impl Future<Output = ()> + Send;
}

/// FaultInjectionPolicy allows a validator to deviate from the protocol in controlled ways.
///
/// Every method defaults to honest behavior. Faulty implementations are useful for testing that
/// honest validators remain safe (and live) in the presence of misbehaving peers.
pub trait FaultInjectionPolicy: Clone + Send + 'static {
    /// Delay to add before a built block is proposed.
    fn propose_delay(&mut self, _height: Height, _round: Round) -> Option<Duration> {
        None
    }

    /// Send a different block to each half of the peers.
    fn equivocate_proposal(&mut self, _height: Height, _round: Round) -> bool {
        false
    }

    /// Prevote for a block that does not exist.
    fn invalid_prevote(&mut self, _height: Height, _round: Round) -> bool {
        false
    }

    /// Precommit a block that does not exist.
    fn invalid_precommit(&mut self, _height: Height, _round: Round) -> bool {
        false
    }

    /// Withhold our proposal from all peers.
    fn drop_proposal(&mut self, _height: Height, _round: Round) -> bool {
        false
    }

    /// Withhold our prevote from all peers.
    fn drop_prevote(&mut self, _height: Height, _round: Round) -> bool {
        false
    }

    /// Withhold our precommit from all peers.
    fn drop_precommit(&mut self, _height: Height, _round: Round) -> bool {
        false
    }
}

/// Follow the protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct Honest;

impl FaultInjectionPolicy for Honest {}
