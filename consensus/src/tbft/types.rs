//! Types used in [crate::tbft].

use super::votes::HeightRoundVoteSet;
use bytes::{BufMut, Bytes};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tbft_utils::{hex, union, BitMap};

/// Sequential index of a block in the chain.
pub type Height = u64;

/// Sub-attempt within a height.
pub type Round = u32;

const PROPOSAL_SUFFIX: &[u8] = b"_PROPOSAL";
const PREVOTE_SUFFIX: &[u8] = b"_PREVOTE";
const PRECOMMIT_SUFFIX: &[u8] = b"_PRECOMMIT";

/// Phase within a round.
///
/// Steps are ordered: within a `(height, round)` the step only advances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    #[default]
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    Precommit,
    Commit,
}

/// Kind of vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VoteType {
    Prevote,
    Precommit,
}

/// SHA-256 digest identifying a block.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; Hash::LEN]);

impl Hash {
    /// Length of a hash in bytes.
    pub const LEN: usize = 32;

    /// Hash an arbitrary message.
    pub fn digest(message: &[u8]) -> Self {
        Self(Sha256::digest(message).into())
    }

    /// Parse a hash from a slice of exactly [Hash::LEN] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

/// Identifier of a validator.
///
/// The identifier doubles as the network identity of the validator (votes are routed to
/// validators by this value).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValidatorId(Bytes);

impl ValidatorId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl From<&str> for ValidatorId {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for ValidatorId {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic()) => {
                write!(f, "{s}")
            }
            _ => write!(f, "{}", hex(&self.0)),
        }
    }
}

impl fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Signature over some message and the identity of the signer (as understood by the
/// access-control provider).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Endorsement {
    pub signer: Bytes,
    pub signature: Bytes,
}

/// Candidate block agreed upon by consensus.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub height: Height,
    pub parent: Hash,
    pub payload: Bytes,

    /// Data attached to the block that is not covered by its hash (the quorum
    /// certificate is stored here once committed).
    pub additional_data: BTreeMap<String, Bytes>,
}

impl Block {
    pub fn new(height: Height, parent: Hash, payload: Bytes) -> Self {
        Self {
            height,
            parent,
            payload,
            additional_data: BTreeMap::new(),
        }
    }

    /// Hash of `height || parent || payload`.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.parent.as_bytes());
        hasher.update(&self.payload);
        Hash(hasher.finalize().into())
    }
}

/// Context is a collection of metadata from consensus about a given payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    /// Height of the payload.
    pub height: Height,

    /// Round in which the payload was proposed.
    pub round: Round,

    /// Validator elected to propose in this round.
    pub proposer: ValidatorId,

    /// Hash of the last committed block.
    pub parent: Hash,
}

fn encode_round(round: Option<Round>) -> i64 {
    round.map(i64::from).unwrap_or(-1)
}

/// Message signed by the proposer of a block.
pub fn proposal_message(
    namespace: &[u8],
    height: Height,
    round: Round,
    pol_round: Option<Round>,
    hash: &Hash,
) -> Vec<u8> {
    let mut message = union(namespace, PROPOSAL_SUFFIX);
    message.reserve(8 + 4 + 8 + Hash::LEN);
    message.put_u64(height);
    message.put_u32(round);
    message.put_i64(encode_round(pol_round));
    message.put_slice(hash.as_bytes());
    message
}

/// Message signed by a voter.
pub fn vote_message(
    namespace: &[u8],
    vote_type: VoteType,
    height: Height,
    round: Round,
    hash: Option<&Hash>,
) -> Vec<u8> {
    let suffix = match vote_type {
        VoteType::Prevote => PREVOTE_SUFFIX,
        VoteType::Precommit => PRECOMMIT_SUFFIX,
    };
    let mut message = union(namespace, suffix);
    message.reserve(8 + 4 + 1 + Hash::LEN);
    message.put_u64(height);
    message.put_u32(round);
    match hash {
        Some(hash) => {
            message.put_u8(1);
            message.put_slice(hash.as_bytes());
        }
        None => message.put_u8(0),
    }
    message
}

/// Signed proposal of a block for some `(height, round)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub voter: ValidatorId,
    pub height: Height,
    pub round: Round,

    /// Round of the prevote quorum that justifies re-proposing `block` (if any).
    pub pol_round: Option<Round>,
    pub block: Block,
    pub endorsement: Endorsement,
}

impl Proposal {
    pub fn hash(&self) -> Hash {
        self.block.hash()
    }

    /// Message covered by the proposal's endorsement.
    pub fn message(&self, namespace: &[u8]) -> Vec<u8> {
        proposal_message(
            namespace,
            self.height,
            self.round,
            self.pol_round,
            &self.block.hash(),
        )
    }
}

/// Signed prevote or precommit.
///
/// A `hash` of `None` is a vote for no block (nil).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub voter: ValidatorId,
    pub height: Height,
    pub round: Round,
    pub hash: Option<Hash>,
    pub endorsement: Endorsement,
}

impl Vote {
    /// Message covered by the vote's endorsement.
    pub fn message(&self, namespace: &[u8]) -> Vec<u8> {
        vote_message(
            namespace,
            self.vote_type,
            self.height,
            self.round,
            self.hash.as_ref(),
        )
    }
}

/// Timeout event for some step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeoutInfo {
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

/// Outcome of verifying the block of a proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyResult {
    pub height: Height,
    pub round: Round,
    pub block_hash: Hash,
    pub success: bool,
}

/// Summary of a validator's progress exchanged with peers.
///
/// Never authoritative: it is only used to decide which messages a peer is missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipState {
    pub id: ValidatorId,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub proposal: Option<Hash>,
    pub verifying_proposal: Option<Hash>,

    /// Validators (by index) whose prevote for `round` has been seen.
    pub prevotes: BitMap,

    /// Validators (by index) whose precommit for `round` has been seen.
    pub precommits: BitMap,
}

impl GossipState {
    /// Summarize `state` as seen by validator `id`.
    pub fn new(id: ValidatorId, state: &ConsensusState) -> Self {
        let votes = &state.votes;
        Self {
            id,
            height: state.height,
            round: state.round,
            step: state.step,
            proposal: state.proposal.as_ref().map(Proposal::hash),
            verifying_proposal: state.verifying_proposal.as_ref().map(Proposal::hash),
            prevotes: votes.bitmap(state.round, VoteType::Prevote),
            precommits: votes.bitmap(state.round, VoteType::Precommit),
        }
    }
}

/// Messages exchanged between validators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMessage {
    Propose(Proposal),
    Prevote(Vote),
    Precommit(Vote),
    GossipState(GossipState),
}

impl ConsensusMessage {
    /// Wrap a vote in the message matching its type.
    pub fn vote(vote: Vote) -> Self {
        match vote.vote_type {
            VoteType::Prevote => Self::Prevote(vote),
            VoteType::Precommit => Self::Precommit(vote),
        }
    }
}

/// Precommits that justify a committed block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuorumCertificate {
    pub votes: Vec<Vote>,
}

/// Observable protocol activity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Activity {
    /// Whether this validator may propose in `(height, round)`.
    ProposeStatus {
        height: Height,
        round: Round,
        allowed: bool,
    },
    Proposed(Proposal),
    Prevoted(Vote),
    Precommitted(Vote),
    Committed {
        height: Height,
        round: Round,
        hash: Hash,
    },
    RoundAdvanced {
        height: Height,
        round: Round,
    },
    ConflictingProposal {
        first: Proposal,
        second: Proposal,
    },
    ConflictingVote {
        first: Vote,
        second: Vote,
    },
}

/// Mutable state of consensus for the active height.
///
/// Cloning yields an independent snapshot (vote sets share only the immutable
/// [super::validators::ValidatorSet]).
#[derive(Clone, Debug)]
pub struct ConsensusState {
    pub height: Height,
    pub round: Round,
    pub step: Step,

    /// Proposal accepted for the current `(height, round)`.
    pub proposal: Option<Proposal>,

    /// Proposal awaiting block verification.
    pub verifying_proposal: Option<Proposal>,

    pub locked_round: Option<Round>,
    pub locked_proposal: Option<Proposal>,

    /// Highest round with a prevote quorum for a known proposal.
    pub valid_round: Option<Round>,
    pub valid_proposal: Option<Proposal>,

    pub votes: HeightRoundVoteSet,
}

impl ConsensusState {
    pub fn new(height: Height, validators: Arc<super::validators::ValidatorSet>) -> Self {
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            proposal: None,
            verifying_proposal: None,
            locked_round: None,
            locked_proposal: None,
            valid_round: None,
            valid_proposal: None,
            votes: HeightRoundVoteSet::new(height, validators),
        }
    }

    /// Find a proposal held for the current height with the given block hash.
    pub fn known_proposal(&self, hash: &Hash) -> Option<&Proposal> {
        [
            &self.proposal,
            &self.locked_proposal,
            &self.valid_proposal,
        ]
        .into_iter()
        .flatten()
        .find(|p| &p.hash() == hash)
    }
}
