//! Tally signed votes and detect quorums.
//!
//! Quorum is computed over validator count (each validator carries a weight of one), using
//! the [ValidatorSet] that applies to the whole height.

use super::{
    types::{Hash, Height, Proposal, Round, ValidatorId, Vote, VoteType},
    validators::ValidatorSet,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tbft_utils::BitMap;
use thiserror::Error;

/// Reasons a vote is rejected by a [VoteSet].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown validator: {0}")]
    UnknownValidator(ValidatorId),
    #[error("conflicting vote from {0}")]
    Equivocation(ValidatorId),
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: Height, got: Height },
    #[error("wrong round: expected {expected}, got {got}")]
    WrongRound { expected: Round, got: Round },
    #[error("wrong vote type: expected {expected:?}, got {got:?}")]
    WrongType { expected: VoteType, got: VoteType },
}

/// Votes of a single type for one `(height, round)`.
#[derive(Clone, Debug)]
pub struct VoteSet {
    vote_type: VoteType,
    height: Height,
    round: Round,
    validators: Arc<ValidatorSet>,

    votes: HashMap<ValidatorId, Vote>,
    tally: HashMap<Option<Hash>, usize>,
}

impl VoteSet {
    pub fn new(
        vote_type: VoteType,
        height: Height,
        round: Round,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            validators,
            votes: HashMap::new(),
            tally: HashMap::new(),
        }
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// Add a vote to the tally.
    ///
    /// Returns `Ok(false)` if the exact vote was already counted. A second vote from the same
    /// validator for a different hash is rejected with [Error::Equivocation] and the first vote
    /// is retained.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, Error> {
        if vote.vote_type != self.vote_type {
            return Err(Error::WrongType {
                expected: self.vote_type,
                got: vote.vote_type,
            });
        }
        if vote.height != self.height {
            return Err(Error::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return Err(Error::WrongRound {
                expected: self.round,
                got: vote.round,
            });
        }
        if !self.validators.contains(&vote.voter) {
            return Err(Error::UnknownValidator(vote.voter));
        }
        if let Some(existing) = self.votes.get(&vote.voter) {
            if existing.hash == vote.hash {
                return Ok(false);
            }
            return Err(Error::Equivocation(vote.voter));
        }
        *self.tally.entry(vote.hash).or_default() += 1;
        self.votes.insert(vote.voter.clone(), vote);
        Ok(true)
    }

    /// Vote cast by `voter`, if any.
    pub fn get(&self, voter: &ValidatorId) -> Option<&Vote> {
        self.votes.get(voter)
    }

    /// Number of votes counted.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Number of votes for `hash` (`None` counts nil votes).
    pub fn count(&self, hash: Option<&Hash>) -> usize {
        self.tally.get(&hash.copied()).copied().unwrap_or(0)
    }

    /// Returns the value (a hash or nil) supported by strictly more than two-thirds of the
    /// validator set, if any.
    ///
    /// At most one value can reach quorum because each validator is counted once.
    pub fn two_thirds_majority(&self) -> Option<Option<Hash>> {
        let quorum = self.validators.quorum();
        if quorum == 0 {
            return None;
        }
        self.tally
            .iter()
            .find(|(_, count)| **count >= quorum)
            .map(|(hash, _)| *hash)
    }

    /// Returns true if strictly more than two-thirds of the validator set voted (for any
    /// combination of values).
    pub fn has_two_thirds_any(&self) -> bool {
        let quorum = self.validators.quorum();
        quorum > 0 && self.votes.len() >= quorum
    }

    /// Iterate over all counted votes.
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    /// Votes for `hash`, ordered by validator index.
    pub fn votes_for(&self, hash: Option<&Hash>) -> Vec<Vote> {
        let mut votes: Vec<_> = self
            .votes
            .values()
            .filter(|v| v.hash.as_ref() == hash)
            .cloned()
            .collect();
        votes.sort_by_key(|v| self.validators.index_of(&v.voter));
        votes
    }

    /// Bitmap of validators (by index) that have voted.
    pub fn bitmap(&self) -> BitMap {
        let mut bitmap = BitMap::zeroes(self.validators.len());
        for voter in self.votes.keys() {
            if let Some(index) = self.validators.index_of(voter) {
                bitmap.set(index as usize);
            }
        }
        bitmap
    }
}

/// Prevotes and precommits of a single round.
#[derive(Clone, Debug)]
pub struct RoundVoteSet {
    pub prevotes: VoteSet,
    pub precommits: VoteSet,
}

/// Precommits (and the proposal) that committed the previous height.
#[derive(Clone, Debug)]
pub struct LastCommit {
    pub proposal: Proposal,
    pub precommits: VoteSet,
}

/// Votes for every round of the active height.
#[derive(Clone, Debug)]
pub struct HeightRoundVoteSet {
    height: Height,
    validators: Arc<ValidatorSet>,
    rounds: HashMap<Round, RoundVoteSet>,
    last_commit: Option<LastCommit>,
}

impl HeightRoundVoteSet {
    pub fn new(height: Height, validators: Arc<ValidatorSet>) -> Self {
        Self {
            height,
            validators,
            rounds: HashMap::new(),
            last_commit: None,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    /// Add a vote to the set for its round (created on first use).
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, Error> {
        if vote.height != self.height {
            return Err(Error::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        let round = self.rounds.entry(vote.round).or_insert_with(|| RoundVoteSet {
            prevotes: VoteSet::new(
                VoteType::Prevote,
                self.height,
                vote.round,
                self.validators.clone(),
            ),
            precommits: VoteSet::new(
                VoteType::Precommit,
                self.height,
                vote.round,
                self.validators.clone(),
            ),
        });
        match vote.vote_type {
            VoteType::Prevote => round.prevotes.add_vote(vote),
            VoteType::Precommit => round.precommits.add_vote(vote),
        }
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    /// Votes of `vote_type` for `round`.
    pub fn get(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        match vote_type {
            VoteType::Prevote => self.prevotes(round),
            VoteType::Precommit => self.precommits(round),
        }
    }

    /// Value with a prevote quorum at `round`, if any.
    pub fn prevote_majority(&self, round: Round) -> Option<Option<Hash>> {
        self.prevotes(round)?.two_thirds_majority()
    }

    /// Value with a precommit quorum at `round`, if any.
    pub fn precommit_majority(&self, round: Round) -> Option<Option<Hash>> {
        self.precommits(round)?.two_thirds_majority()
    }

    /// Highest round with a precommit quorum for a block.
    pub fn commit_round(&self) -> Option<Round> {
        self.rounds
            .iter()
            .filter(|(_, set)| matches!(set.precommits.two_thirds_majority(), Some(Some(_))))
            .map(|(round, _)| *round)
            .max()
    }

    /// Bitmap of validators that cast a vote of `vote_type` at `round`.
    pub fn bitmap(&self, round: Round, vote_type: VoteType) -> BitMap {
        self.get(round, vote_type)
            .map(VoteSet::bitmap)
            .unwrap_or_else(|| BitMap::zeroes(self.validators.len()))
    }

    /// All votes for the height, ordered by `(round, type, validator index)`.
    pub fn all_votes(&self) -> Vec<Vote> {
        let mut rounds: Vec<_> = self.rounds.keys().copied().collect();
        rounds.sort_unstable();
        let mut votes = Vec::new();
        for round in rounds {
            let Some(set) = self.rounds.get(&round) else {
                continue;
            };
            for set in [&set.prevotes, &set.precommits] {
                let mut round_votes: Vec<_> = set.votes().cloned().collect();
                round_votes.sort_by_key(|v| self.validators.index_of(&v.voter));
                votes.extend(round_votes);
            }
        }
        votes
    }

    pub fn last_commit(&self) -> Option<&LastCommit> {
        self.last_commit.as_ref()
    }

    pub fn set_last_commit(&mut self, last_commit: LastCommit) {
        self.last_commit = Some(last_commit);
    }

    /// Remove the precommits of `round` (leaving an empty set in place).
    pub fn take_precommits(&mut self, round: Round) -> Option<VoteSet> {
        let set = self.rounds.get_mut(&round)?;
        let empty = VoteSet::new(
            VoteType::Precommit,
            self.height,
            round,
            self.validators.clone(),
        );
        Some(std::mem::replace(&mut set.precommits, empty))
    }
}

/// Bounded buffer of verified votes for rounds ahead of the current round.
#[derive(Clone, Debug)]
pub struct FutureVotes {
    limit: usize,
    votes: VecDeque<Vote>,
}

impl FutureVotes {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            votes: VecDeque::new(),
        }
    }

    /// Retain `vote`, returning false if the buffer is full.
    pub fn push(&mut self, vote: Vote) -> bool {
        if self.votes.len() >= self.limit {
            return false;
        }
        self.votes.push_back(vote);
        true
    }

    /// Remove and return all buffered votes for `(height, round)`, discarding votes that can
    /// no longer be used (older height or older round).
    pub fn drain(&mut self, height: Height, round: Round) -> Vec<Vote> {
        let mut ready = Vec::new();
        self.votes.retain(|vote| {
            if vote.height < height || (vote.height == height && vote.round < round) {
                return false;
            }
            if vote.height == height && vote.round == round {
                ready.push(vote.clone());
                return false;
            }
            true
        });
        ready
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}
