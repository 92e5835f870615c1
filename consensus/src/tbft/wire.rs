//! Protocol buffer encoding of consensus messages and persisted state.
//!
//! Untrusted input is decoded into the `wire` types first and then converted into the types
//! consensus operates on. Conversion rejects missing fields, malformed hashes, and unknown enum
//! values with an [Error] (it never panics).

use super::{
    types::{self, Hash, Round},
    validators::ValidatorSet,
    votes::HeightRoundVoteSet,
    Error,
};
use bytes::Bytes;
use prost::Message as _;
use std::{collections::BTreeMap, sync::Arc};
use tbft_utils::BitMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Endorsement {
    #[prost(bytes = "bytes", tag = "1")]
    pub signer: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub signature: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Block {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(bytes = "bytes", tag = "2")]
    pub parent: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    #[prost(btree_map = "string, bytes", tag = "4")]
    pub additional_data: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Proposal {
    #[prost(bytes = "bytes", tag = "1")]
    pub voter: Bytes,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    /// `-1` if there is no proof-of-lock round.
    #[prost(int64, tag = "4")]
    pub pol_round: i64,
    #[prost(message, optional, tag = "5")]
    pub block: Option<Block>,
    #[prost(message, optional, tag = "6")]
    pub endorsement: Option<Endorsement>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VoteType {
    Unspecified = 0,
    Prevote = 1,
    Precommit = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Vote {
    #[prost(enumeration = "VoteType", tag = "1")]
    pub vote_type: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub voter: Bytes,
    #[prost(uint64, tag = "3")]
    pub height: u64,
    #[prost(uint32, tag = "4")]
    pub round: u32,
    /// Empty for nil.
    #[prost(bytes = "bytes", tag = "5")]
    pub hash: Bytes,
    #[prost(message, optional, tag = "6")]
    pub endorsement: Option<Endorsement>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Step {
    NewHeight = 0,
    NewRound = 1,
    Propose = 2,
    Prevote = 3,
    Precommit = 4,
    Commit = 5,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GossipState {
    #[prost(bytes = "bytes", tag = "1")]
    pub id: Bytes,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(uint32, tag = "3")]
    pub round: u32,
    #[prost(enumeration = "Step", tag = "4")]
    pub step: i32,
    #[prost(bytes = "bytes", tag = "5")]
    pub proposal: Bytes,
    #[prost(bytes = "bytes", tag = "6")]
    pub verifying_proposal: Bytes,
    #[prost(bytes = "bytes", tag = "7")]
    pub prevotes: Bytes,
    #[prost(bytes = "bytes", tag = "8")]
    pub precommits: Bytes,
    /// Number of bits tracked by each bitmap.
    #[prost(uint32, tag = "9")]
    pub validators: u32,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "1")]
    Propose(Proposal),
    #[prost(message, tag = "2")]
    Prevote(Vote),
    #[prost(message, tag = "3")]
    Precommit(Vote),
    #[prost(message, tag = "4")]
    GossipState(GossipState),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConsensusMessage {
    #[prost(oneof = "Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QuorumCertificate {
    #[prost(message, repeated, tag = "1")]
    pub votes: Vec<Vote>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConsensusState {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(uint32, tag = "2")]
    pub round: u32,
    #[prost(enumeration = "Step", tag = "3")]
    pub step: i32,
    #[prost(message, optional, tag = "4")]
    pub proposal: Option<Proposal>,
    #[prost(message, optional, tag = "5")]
    pub verifying_proposal: Option<Proposal>,
    #[prost(int64, tag = "6")]
    pub locked_round: i64,
    #[prost(message, optional, tag = "7")]
    pub locked_proposal: Option<Proposal>,
    #[prost(int64, tag = "8")]
    pub valid_round: i64,
    #[prost(message, optional, tag = "9")]
    pub valid_proposal: Option<Proposal>,
    #[prost(message, repeated, tag = "10")]
    pub votes: Vec<Vote>,
}

fn encode_round(round: Option<Round>) -> i64 {
    round.map(i64::from).unwrap_or(-1)
}

fn decode_round(round: i64) -> Result<Option<Round>, Error> {
    match round {
        -1 => Ok(None),
        round => Round::try_from(round)
            .map(Some)
            .map_err(|_| Error::InvalidRound(round)),
    }
}

fn encode_hash(hash: Option<&Hash>) -> Bytes {
    hash.map(|h| Bytes::copy_from_slice(h.as_bytes()))
        .unwrap_or_default()
}

fn decode_hash(bytes: &[u8]) -> Result<Option<Hash>, Error> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Hash::from_slice(bytes)
        .map(Some)
        .ok_or(Error::InvalidHash(bytes.len()))
}

impl From<&types::Endorsement> for Endorsement {
    fn from(value: &types::Endorsement) -> Self {
        Self {
            signer: value.signer.clone(),
            signature: value.signature.clone(),
        }
    }
}

impl From<Endorsement> for types::Endorsement {
    fn from(value: Endorsement) -> Self {
        Self {
            signer: value.signer,
            signature: value.signature,
        }
    }
}

impl From<&types::Block> for Block {
    fn from(value: &types::Block) -> Self {
        Self {
            height: value.height,
            parent: Bytes::copy_from_slice(value.parent.as_bytes()),
            payload: value.payload.clone(),
            additional_data: value
                .additional_data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
        }
    }
}

impl TryFrom<Block> for types::Block {
    type Error = Error;

    fn try_from(value: Block) -> Result<Self, Error> {
        let parent = Hash::from_slice(&value.parent).ok_or(Error::InvalidHash(value.parent.len()))?;
        Ok(Self {
            height: value.height,
            parent,
            payload: value.payload,
            additional_data: value
                .additional_data
                .into_iter()
                .map(|(k, v)| (k, Bytes::from(v)))
                .collect(),
        })
    }
}

impl From<&types::Proposal> for Proposal {
    fn from(value: &types::Proposal) -> Self {
        Self {
            voter: value.voter.as_bytes().clone(),
            height: value.height,
            round: value.round,
            pol_round: encode_round(value.pol_round),
            block: Some((&value.block).into()),
            endorsement: Some((&value.endorsement).into()),
        }
    }
}

impl TryFrom<Proposal> for types::Proposal {
    type Error = Error;

    fn try_from(value: Proposal) -> Result<Self, Error> {
        let block = value.block.ok_or(Error::MissingField("block"))?;
        let endorsement = value
            .endorsement
            .ok_or(Error::MissingField("endorsement"))?;
        Ok(Self {
            voter: types::ValidatorId::new(value.voter),
            height: value.height,
            round: value.round,
            pol_round: decode_round(value.pol_round)?,
            block: block.try_into()?,
            endorsement: endorsement.into(),
        })
    }
}

impl From<types::VoteType> for VoteType {
    fn from(value: types::VoteType) -> Self {
        match value {
            types::VoteType::Prevote => Self::Prevote,
            types::VoteType::Precommit => Self::Precommit,
        }
    }
}

impl From<&types::Vote> for Vote {
    fn from(value: &types::Vote) -> Self {
        Self {
            vote_type: VoteType::from(value.vote_type) as i32,
            voter: value.voter.as_bytes().clone(),
            height: value.height,
            round: value.round,
            hash: encode_hash(value.hash.as_ref()),
            endorsement: Some((&value.endorsement).into()),
        }
    }
}

impl TryFrom<Vote> for types::Vote {
    type Error = Error;

    fn try_from(value: Vote) -> Result<Self, Error> {
        let vote_type = match VoteType::try_from(value.vote_type) {
            Ok(VoteType::Prevote) => types::VoteType::Prevote,
            Ok(VoteType::Precommit) => types::VoteType::Precommit,
            Ok(VoteType::Unspecified) | Err(_) => {
                return Err(Error::UnknownEnum(value.vote_type))
            }
        };
        let endorsement = value
            .endorsement
            .ok_or(Error::MissingField("endorsement"))?;
        Ok(Self {
            vote_type,
            voter: types::ValidatorId::new(value.voter),
            height: value.height,
            round: value.round,
            hash: decode_hash(&value.hash)?,
            endorsement: endorsement.into(),
        })
    }
}

impl From<types::Step> for Step {
    fn from(value: types::Step) -> Self {
        match value {
            types::Step::NewHeight => Self::NewHeight,
            types::Step::NewRound => Self::NewRound,
            types::Step::Propose => Self::Propose,
            types::Step::Prevote => Self::Prevote,
            types::Step::Precommit => Self::Precommit,
            types::Step::Commit => Self::Commit,
        }
    }
}

fn decode_step(value: i32) -> Result<types::Step, Error> {
    let step = Step::try_from(value).map_err(|_| Error::UnknownEnum(value))?;
    Ok(match step {
        Step::NewHeight => types::Step::NewHeight,
        Step::NewRound => types::Step::NewRound,
        Step::Propose => types::Step::Propose,
        Step::Prevote => types::Step::Prevote,
        Step::Precommit => types::Step::Precommit,
        Step::Commit => types::Step::Commit,
    })
}

impl From<&types::GossipState> for GossipState {
    fn from(value: &types::GossipState) -> Self {
        Self {
            id: value.id.as_bytes().clone(),
            height: value.height,
            round: value.round,
            step: Step::from(value.step) as i32,
            proposal: encode_hash(value.proposal.as_ref()),
            verifying_proposal: encode_hash(value.verifying_proposal.as_ref()),
            prevotes: value.prevotes.to_bytes(),
            precommits: value.precommits.to_bytes(),
            validators: value.prevotes.len() as u32,
        }
    }
}

impl TryFrom<GossipState> for types::GossipState {
    type Error = Error;

    fn try_from(value: GossipState) -> Result<Self, Error> {
        let len = value.validators as usize;
        Ok(Self {
            id: types::ValidatorId::new(value.id),
            height: value.height,
            round: value.round,
            step: decode_step(value.step)?,
            proposal: decode_hash(&value.proposal)?,
            verifying_proposal: decode_hash(&value.verifying_proposal)?,
            prevotes: BitMap::from_bytes(&value.prevotes, len)?,
            precommits: BitMap::from_bytes(&value.precommits, len)?,
        })
    }
}

impl From<&types::ConsensusMessage> for ConsensusMessage {
    fn from(value: &types::ConsensusMessage) -> Self {
        let payload = match value {
            types::ConsensusMessage::Propose(proposal) => Payload::Propose(proposal.into()),
            types::ConsensusMessage::Prevote(vote) => Payload::Prevote(vote.into()),
            types::ConsensusMessage::Precommit(vote) => Payload::Precommit(vote.into()),
            types::ConsensusMessage::GossipState(state) => Payload::GossipState(state.into()),
        };
        Self {
            payload: Some(payload),
        }
    }
}

impl TryFrom<ConsensusMessage> for types::ConsensusMessage {
    type Error = Error;

    fn try_from(value: ConsensusMessage) -> Result<Self, Error> {
        match value.payload.ok_or(Error::MissingField("payload"))? {
            Payload::Propose(proposal) => Ok(Self::Propose(proposal.try_into()?)),
            Payload::Prevote(vote) => {
                let vote: types::Vote = vote.try_into()?;
                if vote.vote_type != types::VoteType::Prevote {
                    return Err(Error::UnexpectedVoteType);
                }
                Ok(Self::Prevote(vote))
            }
            Payload::Precommit(vote) => {
                let vote: types::Vote = vote.try_into()?;
                if vote.vote_type != types::VoteType::Precommit {
                    return Err(Error::UnexpectedVoteType);
                }
                Ok(Self::Precommit(vote))
            }
            Payload::GossipState(state) => Ok(Self::GossipState(state.try_into()?)),
        }
    }
}

impl types::ConsensusMessage {
    /// Serialize the message.
    pub fn encode(&self) -> Bytes {
        Bytes::from(ConsensusMessage::from(self).encode_to_vec())
    }

    /// Deserialize an untrusted message.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        ConsensusMessage::decode(bytes)?.try_into()
    }
}

impl types::QuorumCertificate {
    /// Serialize the certificate.
    pub fn encode(&self) -> Bytes {
        let certificate = QuorumCertificate {
            votes: self.votes.iter().map(Vote::from).collect(),
        };
        Bytes::from(certificate.encode_to_vec())
    }

    /// Deserialize a certificate.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let certificate = QuorumCertificate::decode(bytes)?;
        let votes = certificate
            .votes
            .into_iter()
            .map(types::Vote::try_from)
            .collect::<Result<_, _>>()?;
        Ok(Self { votes })
    }
}

/// Serialize consensus state for persistence.
pub fn encode_state(state: &types::ConsensusState) -> Bytes {
    let encoded = ConsensusState {
        height: state.height,
        round: state.round,
        step: Step::from(state.step) as i32,
        proposal: state.proposal.as_ref().map(Proposal::from),
        verifying_proposal: state.verifying_proposal.as_ref().map(Proposal::from),
        locked_round: encode_round(state.locked_round),
        locked_proposal: state.locked_proposal.as_ref().map(Proposal::from),
        valid_round: encode_round(state.valid_round),
        valid_proposal: state.valid_proposal.as_ref().map(Proposal::from),
        votes: state.votes.all_votes().iter().map(Vote::from).collect(),
    };
    Bytes::from(encoded.encode_to_vec())
}

/// Deserialize persisted consensus state, replaying its votes against `validators`.
pub fn decode_state(
    bytes: &[u8],
    validators: Arc<ValidatorSet>,
) -> Result<types::ConsensusState, Error> {
    let decoded = ConsensusState::decode(bytes)?;
    let proposal = |p: Option<Proposal>| p.map(types::Proposal::try_from).transpose();
    let mut votes = HeightRoundVoteSet::new(decoded.height, validators);
    for vote in decoded.votes {
        votes.add_vote(vote.try_into()?)?;
    }
    Ok(types::ConsensusState {
        height: decoded.height,
        round: decoded.round,
        step: decode_step(decoded.step)?,
        proposal: proposal(decoded.proposal)?,
        verifying_proposal: proposal(decoded.verifying_proposal)?,
        locked_round: decode_round(decoded.locked_round)?,
        locked_proposal: proposal(decoded.locked_proposal)?,
        valid_round: decode_round(decoded.valid_round)?,
        valid_proposal: proposal(decoded.valid_proposal)?,
        votes,
    })
}
