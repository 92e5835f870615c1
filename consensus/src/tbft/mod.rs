//! Tendermint-style BFT agreement on a sequence of blocks.
//!
//! `tbft` drives a fixed (per height) set of validators through a sequence of rounds at each
//! height until a block is committed by more than two-thirds of the validators. Safety holds
//! as long as fewer than one-third of validators are Byzantine. Liveness holds once the network
//! is synchronous for long enough (step timeouts escalate with each round).
//!
//! # Features
//!
//! * Locking on proof-of-lock (POL) to prevent conflicting commits across rounds
//! * Re-proposal of the most recent block with a prevote quorum
//! * Quorum certificates attached to committed blocks
//! * Crash recovery from durable consensus state
//! * Gossip reconciliation of missing proposals and votes
//! * Pluggable fault injection for testing
//!
//! # Design
//!
//! ## Architecture
//!
//! All logic is split into two components: the `Voter` and `Gossip` (and the user of `tbft`
//! provides the collaborators defined at the crate root). The `Voter` owns all consensus state
//! and is the only component that mutates it. `Gossip` periodically shares a summary of that
//! state with peers and, upon receiving a peer's summary, sends the peer whatever it is missing.
//!
//! ```txt
//! +---------------+           +---------+            +++++++++++++++
//! |               |<----------+         +----------->+             +
//! |  Application  |           |  Voter  |            +    Peers    +
//! |               +---------->|         |<-----------+             +
//! +---------------+           +--+------+            +++++++++++++++
//!                                |   ^
//!                                |   |
//!                                v   |
//!                            +-------+----+          +++++++++++++++
//!                            |            +--------->+             +
//!                            |   Gossip   |          +    Peers    +
//!                            |            |<---------+             +
//!                            +------------+          +++++++++++++++
//! ```
//!
//! The `Voter` never blocks on `Gossip` (peer changes and peer summaries are dropped if
//! `Gossip` falls behind). `Gossip` only reads copies of consensus state.
//!
//! ## Persistence
//!
//! The `Voter` persists its consensus state (including all votes observed at the current
//! height) to the provided [crate::Store] whenever it changes. Persisted state is always written
//! before any message is sent, so a validator that restarts (even after an unclean shutdown)
//! can never contradict a vote it already cast.
//!
//! ## Protocol Description
//!
//! ### Round `r` at height `h`
//!
//! Upon entering round `r`:
//! * Determine the proposer `p` (rotating every `blocks_per_proposer` heights and every round)
//! * Set the propose timeout
//! * If `p`, propose the valid block (if any, with its POL round) or a new block
//!
//! Upon receiving the proposal from `p`:
//! * Verify the block
//! * Prevote the block unless locked on a different block (and the proposal does not carry a
//!   newer POL for itself)
//!
//! Upon receiving `2f+1` prevotes:
//! * If for a block we hold, lock on it and precommit it
//! * If for nil, unlock and precommit nil
//! * Otherwise (no quorum for anything), precommit nil
//!
//! Upon receiving `2f+1` precommits:
//! * If for a block we hold, commit it (from any round of the height)
//! * If for nil (or split), enter round `r+1`
//!
//! Upon a timeout expiring:
//! * Propose: prevote nil
//! * Prevote: precommit nil
//! * Precommit: enter round `r+1`

mod actors;
mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
pub mod metrics;
#[cfg(test)]
mod mocks;
pub mod timeout;
pub mod types;
pub mod validators;
pub mod votes;
pub mod wire;

pub use actors::voter::Mailbox;

use thiserror::Error;
use types::{Hash, Height, Round};

/// Key consensus state is persisted under in the [crate::Store].
pub const STATE_KEY: &[u8] = b"tbft_state";

/// Key of the encoded [types::QuorumCertificate] in a committed block's `additional_data`.
pub const QUORUM_CERTIFICATE_KEY: &str = "quorum_certificate";

/// Errors that can occur when decoding untrusted input.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid hash length: {0}")]
    InvalidHash(usize),
    #[error("Unknown enum value: {0}")]
    UnknownEnum(i32),
    #[error("Invalid round: {0}")]
    InvalidRound(i64),
    #[error("Invalid bitmap: {0}")]
    InvalidBitMap(#[from] tbft_utils::bitmap::Error),
    #[error("Invalid vote: {0}")]
    InvalidVote(#[from] votes::Error),
    #[error("Unexpected vote type")]
    UnexpectedVoteType,
}

/// Violation of an invariant that must hold for any honest validator.
///
/// Continuing after one of these could cause the validator to equivocate, so the engine stops
/// and leaves it to the caller to decide what to do.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FatalConsensusError {
    #[error("commit at height {height} round {round} without a precommit quorum")]
    CommitWithoutQuorum { height: Height, round: Round },
    #[error("precommit for {hash} at height {height} round {round} does not match lock")]
    PrecommitLockMismatch {
        height: Height,
        round: Round,
        hash: Hash,
    },
    #[error("commit at height {height} round {round} without the committed proposal")]
    ProposalMissingAtCommit { height: Height, round: Round },
}
