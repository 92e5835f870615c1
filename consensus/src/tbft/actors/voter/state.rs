use crate::{
    tbft::{
        metrics::Metrics,
        timeout::Timeouts,
        types::{
            proposal_message, vote_message, Activity, Block, ConsensusMessage, ConsensusState,
            Context, Endorsement, Hash, Height, Proposal, QuorumCertificate, Round, Step,
            TimeoutInfo, ValidatorId, VerifyResult, Vote, VoteType,
        },
        validators::ValidatorSet,
        votes::{self, FutureVotes, LastCommit},
        wire::decode_state,
        FatalConsensusError, QUORUM_CERTIFICATE_KEY,
    },
    AccessControl, FaultInjectionPolicy, Supervisor,
};
use std::{collections::HashMap, mem::take, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Configuration for initializing [State].
pub struct Config<C: AccessControl, S: Supervisor, P: FaultInjectionPolicy> {
    pub crypto: C,
    pub supervisor: S,
    pub faults: P,
    pub namespace: Vec<u8>,
    pub timeouts: Timeouts,
    pub future_round_buffer: Option<usize>,
    pub earlier_round_commits: bool,
    pub metrics: Metrics,
}

/// Side effect requested by [State] (performed by the actor driving it).
#[derive(Debug)]
pub enum Action {
    /// Send a message to every peer.
    Broadcast(ConsensusMessage),
    /// Send a message to some peers.
    Send(Vec<ValidatorId>, ConsensusMessage),
    /// Ask the automaton to build a block.
    Propose(Context),
    /// Ask the automaton to verify a block.
    Verify(Context, Block),
    /// Hand a committed block (with its quorum certificate) to the committer.
    Commit(Block),
    /// Schedule a timeout.
    Timeout(Duration, TimeoutInfo),
    Report(Activity),
    /// The validator set changed at a new height.
    PeersChanged {
        added: Vec<ValidatorId>,
        removed: Vec<ValidatorId>,
    },
    /// Consensus state changed and should be persisted.
    Persist,
}

/// Height/round/step state machine.
///
/// All transitions are synchronous and free of IO: each handler mutates consensus state and
/// queues [Action]s that the caller drains with [State::take_actions]. Handlers check the
/// `(height, round, step)` they were triggered for against the current state and ignore stale
/// triggers, so events may be delivered in any order.
pub struct State<C: AccessControl, S: Supervisor, P: FaultInjectionPolicy> {
    crypto: C,
    supervisor: S,
    faults: P,
    namespace: Vec<u8>,
    timeouts: Timeouts,
    me: ValidatorId,

    parent: Hash,
    consensus: ConsensusState,

    // Proposals from earlier rounds of this height, kept in case a precommit quorum
    // for one of them arrives late (only with `earlier_round_commits`).
    earlier_round_commits: bool,
    previous: HashMap<Round, Proposal>,
    commit: Option<(Round, Proposal)>,
    future: Option<FutureVotes>,

    actions: Vec<Action>,
    metrics: Metrics,
}

impl<C: AccessControl, S: Supervisor, P: FaultInjectionPolicy> State<C, S, P> {
    pub fn new(cfg: Config<C, S, P>) -> Self {
        let me = cfg.crypto.me();
        let validators = Arc::new(ValidatorSet::new(Vec::new(), 1));
        Self {
            crypto: cfg.crypto,
            supervisor: cfg.supervisor,
            faults: cfg.faults,
            namespace: cfg.namespace,
            timeouts: cfg.timeouts,
            me,
            parent: Hash::default(),
            consensus: ConsensusState::new(0, validators),
            earlier_round_commits: cfg.earlier_round_commits,
            previous: HashMap::new(),
            commit: None,
            future: cfg.future_round_buffer.map(FutureVotes::new),
            actions: Vec::new(),
            metrics: cfg.metrics,
        }
    }

    pub fn height(&self) -> Height {
        self.consensus.height
    }

    pub fn round(&self) -> Round {
        self.consensus.round
    }

    pub fn step(&self) -> Step {
        self.consensus.step
    }

    pub fn consensus(&self) -> &ConsensusState {
        &self.consensus
    }

    /// Deep copy of the consensus state.
    pub fn snapshot(&self) -> ConsensusState {
        self.consensus.clone()
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        self.consensus.votes.validators()
    }

    /// Drain all queued actions.
    pub fn take_actions(&mut self) -> Vec<Action> {
        take(&mut self.actions)
    }

    /// Delay to apply before proposing a built block.
    pub fn propose_delay(&mut self, height: Height, round: Round) -> Option<Duration> {
        self.faults.propose_delay(height, round)
    }

    /// Begin consensus at `height` (building on `parent`).
    ///
    /// If `persisted` holds state for `height`, consensus resumes from it. State for any other
    /// height is discarded.
    pub fn start(
        &mut self,
        height: Height,
        parent: Hash,
        persisted: Option<&[u8]>,
    ) -> Result<(), FatalConsensusError> {
        self.parent = parent;
        let validators = self.update_validators(height);
        if let Some(bytes) = persisted {
            match decode_state(bytes, validators.clone()) {
                Ok(state) if state.height == height => return self.restore(state),
                Ok(state) => {
                    debug!(
                        height,
                        persisted = state.height,
                        reason = "different height",
                        "discarding persisted state"
                    );
                }
                Err(err) => {
                    warn!(?err, "failed to decode persisted state");
                }
            }
        }
        self.reset(height, validators);
        self.enter_new_round(height, 0)
    }

    /// Jump to the height after `committed` (learned outside of consensus, e.g. from sync),
    /// discarding in-flight round state.
    pub fn fast_forward(
        &mut self,
        committed: Height,
        parent: Hash,
    ) -> Result<(), FatalConsensusError> {
        let height = committed.saturating_add(1);
        if height <= self.consensus.height {
            debug!(
                height,
                current = self.consensus.height,
                reason = "not ahead",
                "ignoring committed height"
            );
            return Ok(());
        }
        info!(from = self.consensus.height, to = height, "fast-forwarding");
        self.commit = None;
        self.enter_new_height(height, parent)
    }

    /// Handle a block built by the automaton for `context`.
    ///
    /// Returns whether the block was proposed.
    pub fn proposed(
        &mut self,
        context: Context,
        block: Block,
    ) -> Result<bool, FatalConsensusError> {
        if !self.at(context.height, context.round)
            || self.consensus.step != Step::Propose
            || self.consensus.proposal.is_some()
        {
            debug!(
                height = context.height,
                round = context.round,
                reason = "no longer in propose step",
                "dropping built block"
            );
            return Ok(false);
        }
        if block.height != context.height || block.parent != self.parent {
            warn!(
                height = context.height,
                round = context.round,
                "built block does not extend last committed block"
            );
            return Ok(false);
        }
        self.broadcast_proposal(block, None)?;
        Ok(true)
    }

    /// Handle a proposal received from the network.
    pub fn handle_proposal(&mut self, proposal: Proposal) -> Result<(), FatalConsensusError> {
        let (height, round) = (self.consensus.height, self.consensus.round);
        let stale = proposal.round < round && !self.earlier_round_commits;
        if proposal.height != height || proposal.round > round || stale {
            debug!(
                height,
                round,
                proposal_height = proposal.height,
                proposal_round = proposal.round,
                reason = "not at height or round",
                "dropping proposal"
            );
            self.metrics.stale_messages.inc();
            return Ok(());
        }
        let message = proposal.message(&self.namespace);
        if !self.authenticate(&proposal.voter, &proposal.endorsement, &message) {
            return Ok(());
        }
        let expected = self.validators().get_proposer(height, proposal.round);
        if expected != Some(&proposal.voter) {
            warn!(
                height,
                round = proposal.round,
                voter = %proposal.voter,
                expected = ?expected,
                reason = "not elected proposer",
                "dropping proposal"
            );
            self.metrics.invalid_messages.inc();
            return Ok(());
        }
        if proposal.block.height != height || proposal.block.parent != self.parent {
            warn!(
                height,
                round = proposal.round,
                voter = %proposal.voter,
                reason = "block does not extend last committed block",
                "dropping proposal"
            );
            self.metrics.invalid_messages.inc();
            return Ok(());
        }
        if proposal.pol_round.is_some_and(|pol| pol >= proposal.round) {
            warn!(
                height,
                round = proposal.round,
                pol_round = ?proposal.pol_round,
                reason = "invalid proof-of-lock round",
                "dropping proposal"
            );
            self.metrics.invalid_messages.inc();
            return Ok(());
        }
        if proposal.round < round {
            return self.handle_previous_proposal(proposal);
        }

        // Only one block may be considered per round
        let hash = proposal.hash();
        let existing = self
            .consensus
            .proposal
            .as_ref()
            .or(self.consensus.verifying_proposal.as_ref());
        if let Some(existing) = existing {
            if existing.hash() == hash {
                debug!(height, round, %hash, "duplicate proposal");
                return Ok(());
            }
            warn!(
                height,
                round,
                voter = %proposal.voter,
                first = %existing.hash(),
                second = %hash,
                "conflicting proposal"
            );
            self.metrics.equivocations.inc();
            let first = existing.clone();
            self.report(Activity::ConflictingProposal {
                first,
                second: proposal.clone(),
            });

            // The other block may still be the one the network committed
            if self.consensus.votes.precommit_majority(round) == Some(Some(hash)) {
                self.previous.insert(round, proposal);
                self.try_commit(round)?;
            }
            return Ok(());
        }

        debug!(height, round, voter = %proposal.voter, %hash, "verifying proposal");
        let context = Context {
            height,
            round,
            proposer: proposal.voter.clone(),
            parent: self.parent,
        };
        self.actions
            .push(Action::Verify(context, proposal.block.clone()));
        self.consensus.verifying_proposal = Some(proposal);
        self.persist();
        Ok(())
    }

    fn handle_previous_proposal(&mut self, proposal: Proposal) -> Result<(), FatalConsensusError> {
        let hash = proposal.hash();
        if let Some(existing) = self.previous.get(&proposal.round) {
            if existing.hash() != hash {
                warn!(
                    height = proposal.height,
                    round = proposal.round,
                    voter = %proposal.voter,
                    "conflicting proposal"
                );
                self.metrics.equivocations.inc();
                let first = existing.clone();
                self.report(Activity::ConflictingProposal {
                    first,
                    second: proposal.clone(),
                });
                if self.consensus.votes.precommit_majority(proposal.round) == Some(Some(hash)) {
                    let round = proposal.round;
                    self.previous.insert(round, proposal);
                    return self.try_commit(round).map(|_| ());
                }
            }
            return Ok(());
        }
        debug!(
            height = proposal.height,
            round = proposal.round,
            %hash,
            "retaining proposal from earlier round"
        );
        let round = proposal.round;
        self.previous.insert(round, proposal);
        self.try_commit(round).map(|_| ())
    }

    /// Handle the outcome of verifying `verifying_proposal`.
    pub fn verified(&mut self, result: VerifyResult) -> Result<(), FatalConsensusError> {
        let (height, round) = (self.consensus.height, self.consensus.round);
        let matches = self.consensus.verifying_proposal.as_ref().is_some_and(|p| {
            p.height == result.height && p.round == result.round && p.hash() == result.block_hash
        });
        if !matches || result.height != height || result.round != round {
            debug!(
                height = result.height,
                round = result.round,
                hash = %result.block_hash,
                reason = "no matching proposal",
                "dropping verification"
            );
            return Ok(());
        }
        let Some(proposal) = self.consensus.verifying_proposal.take() else {
            return Ok(());
        };
        self.persist();
        if !result.success {
            warn!(height, round, hash = %result.block_hash, "proposal failed verification");
            self.metrics.invalid_messages.inc();
            if self.consensus.step == Step::Propose {
                return self.enter_prevote(height, round);
            }
            return Ok(());
        }

        debug!(height, round, hash = %result.block_hash, "accepted proposal");
        self.consensus.proposal = Some(proposal.clone());
        self.report(Activity::Proposed(proposal));
        if self.consensus.step == Step::Propose {
            return self.enter_prevote(height, round);
        }

        // A late proposal may complete quorums that were waiting on it
        self.check_prevotes()?;
        self.try_commit(round).map(|_| ())
    }

    /// Handle a prevote or precommit received from the network.
    pub fn handle_vote(&mut self, vote: Vote) -> Result<(), FatalConsensusError> {
        let (height, round) = (self.consensus.height, self.consensus.round);
        if vote.height != height {
            debug!(
                height,
                vote_height = vote.height,
                voter = %vote.voter,
                reason = "wrong height",
                "dropping vote"
            );
            self.metrics.stale_messages.inc();
            return Ok(());
        }
        if vote.round > round && self.future.is_none() {
            debug!(
                height,
                round,
                vote_round = vote.round,
                voter = %vote.voter,
                reason = "future round",
                "dropping vote"
            );
            self.metrics.stale_messages.inc();
            return Ok(());
        }
        if vote.round < round
            && (vote.vote_type == VoteType::Prevote || !self.earlier_round_commits)
        {
            debug!(
                height,
                round,
                vote_round = vote.round,
                voter = %vote.voter,
                reason = "stale round",
                "dropping vote"
            );
            self.metrics.stale_messages.inc();
            return Ok(());
        }
        let message = vote.message(&self.namespace);
        if !self.authenticate(&vote.voter, &vote.endorsement, &message) {
            return Ok(());
        }
        if vote.round > round {
            if let Some(future) = &mut self.future {
                if !future.push(vote) {
                    debug!(height, round, reason = "buffer full", "dropping future vote");
                    self.metrics.stale_messages.inc();
                }
            }
            return Ok(());
        }
        self.apply_vote(vote)
    }

    /// Handle an expired timeout.
    pub fn handle_timeout(&mut self, info: TimeoutInfo) -> Result<(), FatalConsensusError> {
        let consensus = &self.consensus;
        if info.height != consensus.height
            || info.round != consensus.round
            || info.step != consensus.step
        {
            debug!(
                height = info.height,
                round = info.round,
                step = ?info.step,
                "ignoring stale timeout"
            );
            return Ok(());
        }
        debug!(
            height = info.height,
            round = info.round,
            step = ?info.step,
            "timeout fired"
        );
        match info.step {
            Step::Propose => self.enter_prevote(info.height, info.round),
            Step::Prevote => self.enter_precommit(info.height, info.round),
            Step::Precommit => self.enter_new_round(info.height, info.round.saturating_add(1)),
            Step::NewHeight | Step::NewRound | Step::Commit => Ok(()),
        }
    }

    /// Handle the committer returning for the block committed at the current height.
    pub fn committed(&mut self) -> Result<(), FatalConsensusError> {
        if self.consensus.step != Step::Commit {
            return Ok(());
        }
        let Some((_, proposal)) = &self.commit else {
            return Ok(());
        };
        let parent = proposal.hash();
        self.enter_new_height(self.consensus.height.saturating_add(1), parent)
    }

    fn at(&self, height: Height, round: Round) -> bool {
        self.consensus.height == height && self.consensus.round == round
    }

    fn persist(&mut self) {
        self.actions.push(Action::Persist);
    }

    fn report(&mut self, activity: Activity) {
        self.actions.push(Action::Report(activity));
    }

    fn schedule(&mut self, step: Step) {
        let (height, round) = (self.consensus.height, self.consensus.round);
        if let Some(duration) = self.timeouts.duration(step, round) {
            self.actions.push(Action::Timeout(
                duration,
                TimeoutInfo {
                    height,
                    round,
                    step,
                },
            ));
        }
    }

    /// Check that `endorsement` was produced by `voter` over `message`.
    fn authenticate(
        &mut self,
        voter: &ValidatorId,
        endorsement: &Endorsement,
        message: &[u8],
    ) -> bool {
        let reason = match self.crypto.resolve(&endorsement.signer) {
            None => "unknown signer",
            Some(signer) if &signer != voter => "signer is not voter",
            Some(_) if !self.validators().contains(voter) => "not a validator",
            Some(_) if !self.crypto.verify(endorsement, message) => "invalid signature",
            Some(_) => return true,
        };
        warn!(voter = %voter, reason, "dropping message");
        self.metrics.invalid_messages.inc();
        false
    }

    fn update_validators(&mut self, height: Height) -> Arc<ValidatorSet> {
        let current = self.consensus.votes.validators();
        let list = match self.supervisor.validators(height) {
            Some(list) => list,
            None => {
                warn!(height, "no validators for height, keeping previous set");
                current.iter().cloned().collect()
            }
        };
        let mut validators = ValidatorSet::clone(current);
        let (added, removed) = validators.update_validators(list);
        validators.update_blocks_per_proposer(self.supervisor.blocks_per_proposer(height));
        if !added.is_empty() || !removed.is_empty() {
            info!(
                height,
                added = added.len(),
                removed = removed.len(),
                "validator set changed"
            );
            self.actions.push(Action::PeersChanged { added, removed });
        }
        Arc::new(validators)
    }

    fn reset(&mut self, height: Height, validators: Arc<ValidatorSet>) {
        self.consensus = ConsensusState::new(height, validators);
        self.previous.clear();
        self.metrics.current_height.set(height as i64);
        self.metrics.current_round.set(0);
        self.persist();
    }

    fn restore(&mut self, state: ConsensusState) -> Result<(), FatalConsensusError> {
        let (height, round, step) = (state.height, state.round, state.step);
        info!(height, round, ?step, "restored consensus state");
        self.consensus = state;
        self.previous.clear();
        self.commit = None;
        self.metrics.current_height.set(height as i64);
        self.metrics.current_round.set(round as i64);
        match step {
            Step::NewHeight | Step::NewRound => {
                self.consensus.step = Step::NewHeight;
                self.enter_new_round(height, round)?;
            }
            Step::Propose => {
                self.consensus.step = Step::NewRound;
                self.enter_propose(height, round)?;
            }
            Step::Prevote => {
                self.schedule(Step::Prevote);
                self.rebroadcast(VoteType::Prevote);
                self.check_prevotes()?;
            }
            Step::Precommit => {
                self.schedule(Step::Precommit);
                self.rebroadcast(VoteType::Precommit);
                self.check_precommits()?;
            }
            Step::Commit => {
                let commit_round = self.consensus.votes.commit_round().unwrap_or(round);
                self.consensus.step = Step::Precommit;
                return self.enter_commit(commit_round);
            }
        }

        // The automaton's answer (if any) was lost with the previous process
        if self.consensus.step < Step::Commit {
            if let Some(proposal) = &self.consensus.verifying_proposal {
                debug!(height, round, hash = %proposal.hash(), "resuming verification");
                let context = Context {
                    height: proposal.height,
                    round: proposal.round,
                    proposer: proposal.voter.clone(),
                    parent: self.parent,
                };
                self.actions
                    .push(Action::Verify(context, proposal.block.clone()));
            }
        }
        Ok(())
    }

    fn rebroadcast(&mut self, vote_type: VoteType) {
        let round = self.consensus.round;
        let own = self
            .consensus
            .votes
            .get(round, vote_type)
            .and_then(|set| set.get(&self.me))
            .cloned();
        if let Some(vote) = own {
            self.actions
                .push(Action::Broadcast(ConsensusMessage::vote(vote)));
        }
    }

    fn enter_new_height(&mut self, height: Height, parent: Hash) -> Result<(), FatalConsensusError> {
        let last_commit = self.commit.take().and_then(|(round, proposal)| {
            let precommits = self.consensus.votes.take_precommits(round)?;
            Some(LastCommit {
                proposal,
                precommits,
            })
        });
        self.parent = parent;
        let validators = self.update_validators(height);
        self.reset(height, validators);
        if let Some(last_commit) = last_commit {
            self.consensus.votes.set_last_commit(last_commit);
        }
        debug!(height, %parent, "entered new height");
        self.enter_new_round(height, 0)
    }

    fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), FatalConsensusError> {
        let consensus = &self.consensus;
        if consensus.height != height
            || round < consensus.round
            || (round == consensus.round && consensus.step != Step::NewHeight)
        {
            debug!(
                height,
                round,
                current_round = consensus.round,
                step = ?consensus.step,
                "ignoring stale round transition"
            );
            return Ok(());
        }
        if round > consensus.round {
            self.metrics.round_advances.inc();
            self.report(Activity::RoundAdvanced { height, round });
        }
        if let Some(proposal) = self.consensus.proposal.take() {
            self.previous.insert(proposal.round, proposal);
        }
        self.consensus.round = round;
        self.consensus.step = Step::NewRound;
        self.consensus.verifying_proposal = None;
        self.metrics.current_round.set(round as i64);
        self.persist();
        debug!(height, round, "entered new round");
        self.enter_propose(height, round)?;

        // Replay any votes that arrived before we entered the round
        let buffered = match &mut self.future {
            Some(future) => future.drain(height, round),
            None => Vec::new(),
        };
        for vote in buffered {
            self.apply_vote(vote)?;
        }
        Ok(())
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), FatalConsensusError> {
        if !self.at(height, round) || self.consensus.step >= Step::Propose {
            debug!(height, round, step = ?self.consensus.step, "ignoring stale propose");
            return Ok(());
        }
        self.consensus.step = Step::Propose;
        self.schedule(Step::Propose);
        let proposer = self.validators().get_proposer(height, round).cloned();
        let allowed = proposer.as_ref() == Some(&self.me);
        debug!(height, round, proposer = ?proposer, "entered propose step");
        self.report(Activity::ProposeStatus {
            height,
            round,
            allowed,
        });
        if !allowed || self.consensus.proposal.is_some() {
            return Ok(());
        }

        // Re-propose the most recent block with a prevote quorum
        if let Some(valid) = self.consensus.valid_proposal.clone() {
            let pol_round = self.consensus.valid_round;
            debug!(height, round, ?pol_round, hash = %valid.hash(), "re-proposing valid block");
            return self.broadcast_proposal(valid.block, pol_round);
        }
        self.actions.push(Action::Propose(Context {
            height,
            round,
            proposer: self.me.clone(),
            parent: self.parent,
        }));
        Ok(())
    }

    fn sign_proposal(&mut self, block: Block, pol_round: Option<Round>) -> Proposal {
        let (height, round) = (self.consensus.height, self.consensus.round);
        let message = proposal_message(&self.namespace, height, round, pol_round, &block.hash());
        let endorsement = self.crypto.sign(&message);
        Proposal {
            voter: self.me.clone(),
            height,
            round,
            pol_round,
            block,
            endorsement,
        }
    }

    fn broadcast_proposal(
        &mut self,
        block: Block,
        pol_round: Option<Round>,
    ) -> Result<(), FatalConsensusError> {
        let (height, round) = (self.consensus.height, self.consensus.round);
        let proposal = self.sign_proposal(block, pol_round);
        if self.faults.equivocate_proposal(height, round) {
            let mut conflicting = proposal.block.clone();
            let mut payload = conflicting.payload.to_vec();
            payload.extend_from_slice(b"equivocation");
            conflicting.payload = payload.into();
            let second = self.sign_proposal(conflicting, pol_round);
            let peers: Vec<_> = self
                .validators()
                .iter()
                .filter(|v| **v != self.me)
                .cloned()
                .collect();
            let (left, right) = peers.split_at(peers.len() / 2);
            warn!(height, round, "sending conflicting proposals");
            self.actions.push(Action::Send(
                left.to_vec(),
                ConsensusMessage::Propose(proposal.clone()),
            ));
            self.actions
                .push(Action::Send(right.to_vec(), ConsensusMessage::Propose(second)));
        } else if self.faults.drop_proposal(height, round) {
            // Behave as if no block was built
            debug!(height, round, "withholding proposal");
            return self.enter_prevote(height, round);
        } else {
            self.actions
                .push(Action::Broadcast(ConsensusMessage::Propose(proposal.clone())));
        }
        debug!(height, round, hash = %proposal.hash(), "proposed block");
        self.consensus.proposal = Some(proposal.clone());
        self.report(Activity::Proposed(proposal));
        self.persist();
        self.enter_prevote(height, round)
    }

    fn prevote_target(&self) -> Option<Hash> {
        let consensus = &self.consensus;
        let proposal = consensus.proposal.as_ref();
        let Some(locked) = &consensus.locked_proposal else {
            return proposal.map(Proposal::hash);
        };
        let locked_hash = locked.hash();
        let Some(proposal) = proposal else {
            return Some(locked_hash);
        };
        let hash = proposal.hash();
        if hash == locked_hash {
            return Some(hash);
        }

        // A prevote quorum newer than our lock releases it
        if let Some(pol_round) = proposal.pol_round {
            let newer = consensus.locked_round.map_or(true, |locked| pol_round > locked);
            if newer && consensus.votes.prevote_majority(pol_round) == Some(Some(hash)) {
                return Some(hash);
            }
        }
        Some(locked_hash)
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), FatalConsensusError> {
        if !self.at(height, round) || self.consensus.step >= Step::Prevote {
            debug!(height, round, step = ?self.consensus.step, "ignoring stale prevote");
            return Ok(());
        }
        self.consensus.step = Step::Prevote;
        self.schedule(Step::Prevote);
        let target = self.prevote_target();
        debug!(height, round, hash = ?target, "entered prevote step");
        self.cast_vote(VoteType::Prevote, target);
        self.check_prevotes()
    }

    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), FatalConsensusError> {
        if !self.at(height, round) || self.consensus.step >= Step::Precommit {
            debug!(height, round, step = ?self.consensus.step, "ignoring stale precommit");
            return Ok(());
        }
        self.consensus.step = Step::Precommit;
        self.schedule(Step::Precommit);
        let consensus = &mut self.consensus;
        let target = match consensus.votes.prevote_majority(round) {
            Some(Some(hash)) => {
                if consensus.proposal.as_ref().is_some_and(|p| p.hash() == hash) {
                    consensus.locked_round = Some(round);
                    consensus.locked_proposal = consensus.proposal.clone();
                    Some(hash)
                } else if consensus
                    .locked_proposal
                    .as_ref()
                    .is_some_and(|p| p.hash() == hash)
                {
                    consensus.locked_round = Some(round);
                    Some(hash)
                } else {
                    warn!(height, round, %hash, "prevote quorum for unknown proposal");
                    None
                }
            }
            Some(None) => {
                if consensus.locked_proposal.is_some() {
                    debug!(height, round, "unlocking after nil prevote quorum");
                }
                consensus.locked_round = None;
                consensus.locked_proposal = None;
                None
            }
            None => None,
        };
        if let Some(hash) = target {
            let locked = self.consensus.locked_proposal.as_ref().map(Proposal::hash);
            if locked != Some(hash) {
                error!(height, round, %hash, "precommit does not match locked proposal");
                return Err(FatalConsensusError::PrecommitLockMismatch {
                    height,
                    round,
                    hash,
                });
            }
        }
        debug!(height, round, hash = ?target, "entered precommit step");
        self.cast_vote(VoteType::Precommit, target);
        self.check_precommits()
    }

    fn cast_vote(&mut self, vote_type: VoteType, hash: Option<Hash>) {
        let (height, round) = (self.consensus.height, self.consensus.round);
        if !self.validators().contains(&self.me) {
            debug!(height, round, ?vote_type, "not a validator, skipping vote");
            return;
        }
        let (invalid, withheld) = match vote_type {
            VoteType::Prevote => (
                self.faults.invalid_prevote(height, round),
                self.faults.drop_prevote(height, round),
            ),
            VoteType::Precommit => (
                self.faults.invalid_precommit(height, round),
                self.faults.drop_precommit(height, round),
            ),
        };
        if withheld {
            debug!(height, round, ?vote_type, "withholding vote");
            return;
        }
        let hash = if invalid {
            warn!(height, round, ?vote_type, "casting invalid vote");
            let forged = vote_message(b"invalid", vote_type, height, round, hash.as_ref());
            Some(Hash::digest(&forged))
        } else {
            hash
        };
        let message = vote_message(&self.namespace, vote_type, height, round, hash.as_ref());
        let vote = Vote {
            vote_type,
            voter: self.me.clone(),
            height,
            round,
            hash,
            endorsement: self.crypto.sign(&message),
        };
        if let Err(err) = self.consensus.votes.add_vote(vote.clone()) {
            warn!(?err, height, round, ?vote_type, "failed to count own vote");
        }
        let activity = match vote_type {
            VoteType::Prevote => Activity::Prevoted(vote.clone()),
            VoteType::Precommit => Activity::Precommitted(vote.clone()),
        };
        self.report(activity);
        self.actions
            .push(Action::Broadcast(ConsensusMessage::vote(vote)));
        self.persist();
    }

    fn apply_vote(&mut self, vote: Vote) -> Result<(), FatalConsensusError> {
        let (height, round) = (self.consensus.height, self.consensus.round);
        if vote.height != height || vote.round > round {
            return Ok(());
        }
        let (vote_type, vote_round) = (vote.vote_type, vote.round);
        match self.consensus.votes.add_vote(vote.clone()) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(());
            }
            Err(votes::Error::Equivocation(voter)) => {
                warn!(height, round = vote_round, %voter, ?vote_type, "conflicting vote");
                self.metrics.equivocations.inc();
                let first = self
                    .consensus
                    .votes
                    .get(vote_round, vote_type)
                    .and_then(|set| set.get(&voter))
                    .cloned();
                if let Some(first) = first {
                    self.report(Activity::ConflictingVote {
                        first,
                        second: vote,
                    });
                }
                return Ok(());
            }
            Err(err) => {
                warn!(?err, height, round = vote_round, "dropping vote");
                self.metrics.invalid_messages.inc();
                return Ok(());
            }
        }
        let activity = match vote_type {
            VoteType::Prevote => Activity::Prevoted(vote),
            VoteType::Precommit => Activity::Precommitted(vote),
        };
        self.report(activity);
        self.persist();

        // Precommits from earlier rounds can only complete a commit
        if vote_round < round {
            return self.try_commit(vote_round).map(|_| ());
        }
        match vote_type {
            VoteType::Prevote => self.check_prevotes(),
            VoteType::Precommit => self.check_precommits(),
        }
    }

    fn check_prevotes(&mut self) -> Result<(), FatalConsensusError> {
        let (height, round, step) = (
            self.consensus.height,
            self.consensus.round,
            self.consensus.step,
        );
        let Some(prevotes) = self.consensus.votes.prevotes(round) else {
            return Ok(());
        };
        let majority = prevotes.two_thirds_majority();
        let any = prevotes.has_two_thirds_any();

        // Track the most recent prevote quorum for a block we hold
        if let Some(Some(hash)) = majority {
            let consensus = &mut self.consensus;
            let newer = consensus.valid_round.map_or(true, |valid| valid < round);
            if let Some(proposal) = consensus.proposal.as_ref().filter(|p| p.hash() == hash) {
                if newer {
                    debug!(height, round, %hash, "updated valid proposal");
                    consensus.valid_round = Some(round);
                    consensus.valid_proposal = Some(proposal.clone());
                    self.persist();
                }
            }
        }
        if step != Step::Prevote {
            return Ok(());
        }
        if majority.is_some() || any {
            return self.enter_precommit(height, round);
        }
        Ok(())
    }

    fn check_precommits(&mut self) -> Result<(), FatalConsensusError> {
        let (height, round, step) = (
            self.consensus.height,
            self.consensus.round,
            self.consensus.step,
        );
        let Some(precommits) = self.consensus.votes.precommits(round) else {
            return Ok(());
        };
        let any = precommits.has_two_thirds_any();
        match precommits.two_thirds_majority() {
            Some(Some(_)) => self.try_commit(round).map(|_| ()),
            Some(None) => {
                debug!(height, round, "nil precommit quorum");
                self.enter_new_round(height, round.saturating_add(1))
            }
            None if any && step == Step::Precommit => {
                debug!(height, round, "precommits split without quorum");
                self.enter_new_round(height, round.saturating_add(1))
            }
            None => Ok(()),
        }
    }

    fn find_proposal(&self, round: Round, hash: &Hash) -> Option<&Proposal> {
        self.consensus.known_proposal(hash).or_else(|| {
            self.previous
                .get(&round)
                .filter(|proposal| &proposal.hash() == hash)
        })
    }

    /// Commit if `round` has a precommit quorum for a block we hold.
    fn try_commit(&mut self, round: Round) -> Result<bool, FatalConsensusError> {
        if self.consensus.step >= Step::Commit {
            return Ok(false);
        }
        let Some(Some(hash)) = self.consensus.votes.precommit_majority(round) else {
            return Ok(false);
        };
        if self.find_proposal(round, &hash).is_none() {
            debug!(
                height = self.consensus.height,
                round,
                %hash,
                "precommit quorum for unknown proposal"
            );
            return Ok(false);
        }
        self.enter_commit(round)?;
        Ok(true)
    }

    fn enter_commit(&mut self, round: Round) -> Result<(), FatalConsensusError> {
        let height = self.consensus.height;
        if self.consensus.step >= Step::Commit {
            return Ok(());
        }
        let Some(Some(hash)) = self.consensus.votes.precommit_majority(round) else {
            error!(height, round, "commit without precommit quorum");
            return Err(FatalConsensusError::CommitWithoutQuorum { height, round });
        };
        let Some(proposal) = self.find_proposal(round, &hash).cloned() else {
            error!(height, round, %hash, "commit without proposal");
            return Err(FatalConsensusError::ProposalMissingAtCommit { height, round });
        };
        let certificate = QuorumCertificate {
            votes: self
                .consensus
                .votes
                .precommits(round)
                .map(|set| set.votes_for(Some(&hash)))
                .unwrap_or_default(),
        };
        let mut block = proposal.block.clone();
        block
            .additional_data
            .insert(QUORUM_CERTIFICATE_KEY.to_string(), certificate.encode());

        self.consensus.step = Step::Commit;
        self.consensus.proposal = Some(proposal.clone());
        self.commit = Some((round, proposal));
        info!(
            height,
            round,
            %hash,
            signatures = certificate.votes.len(),
            "committed block"
        );
        self.metrics.commits.inc();
        self.report(Activity::Committed {
            height,
            round,
            hash,
        });
        self.persist();
        self.actions.push(Action::Commit(block));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tbft::{
            mocks::{
                access::Access,
                faults::{Equivocator, InvalidVoter, Silent},
                supervisor::Supervisor,
            },
            timeout::Escalation,
            types::QuorumCertificate,
            wire::encode_state,
        },
        Honest,
    };
    use bytes::Bytes;
    use std::collections::BTreeMap;

    const NAMESPACE: &[u8] = b"_TBFT_TEST";
    const VALIDATORS: [&str; 4] = ["A", "B", "C", "D"];

    fn timeouts() -> Timeouts {
        Timeouts {
            propose: Escalation::new(Duration::from_secs(3), Duration::from_millis(500)),
            prevote: Escalation::new(Duration::from_secs(1), Duration::from_millis(500)),
            precommit: Escalation::new(Duration::from_secs(1), Duration::from_millis(500)),
        }
    }

    fn setup_with<P: FaultInjectionPolicy>(
        faults: P,
        supervisor: Supervisor,
        future_round_buffer: Option<usize>,
    ) -> (State<Access, Supervisor, P>, Vec<Access>) {
        let keys = Access::generate(&VALIDATORS);
        let state = State::new(Config {
            crypto: keys[0].clone(),
            supervisor,
            faults,
            namespace: NAMESPACE.to_vec(),
            timeouts: timeouts(),
            future_round_buffer,
            earlier_round_commits: false,
            metrics: Metrics::default(),
        });
        (state, keys)
    }

    fn setup(blocks_per_proposer: u64) -> (State<Access, Supervisor, Honest>, Vec<Access>) {
        setup_with(
            Honest,
            Supervisor::new(&VALIDATORS, blocks_per_proposer),
            None,
        )
    }

    fn block(height: Height, payload: &'static str) -> Block {
        Block::new(height, Hash::default(), Bytes::from_static(payload.as_bytes()))
    }

    fn proposal(
        signer: &mut Access,
        height: Height,
        round: Round,
        pol_round: Option<Round>,
        block: Block,
    ) -> Proposal {
        let message = proposal_message(NAMESPACE, height, round, pol_round, &block.hash());
        Proposal {
            voter: signer.me(),
            height,
            round,
            pol_round,
            block,
            endorsement: signer.sign(&message),
        }
    }

    fn vote(
        signer: &mut Access,
        vote_type: VoteType,
        height: Height,
        round: Round,
        hash: Option<Hash>,
    ) -> Vote {
        let message = vote_message(NAMESPACE, vote_type, height, round, hash.as_ref());
        Vote {
            vote_type,
            voter: signer.me(),
            height,
            round,
            hash,
            endorsement: signer.sign(&message),
        }
    }

    fn broadcasts(actions: &[Action]) -> Vec<&ConsensusMessage> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Broadcast(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn own_vote(actions: &[Action], vote_type: VoteType) -> Option<Vote> {
        broadcasts(actions).into_iter().find_map(|message| match message {
            ConsensusMessage::Prevote(vote) | ConsensusMessage::Precommit(vote)
                if vote.vote_type == vote_type =>
            {
                Some(vote.clone())
            }
            _ => None,
        })
    }

    /// Accept `block` from the proposer of `(height, round)` and return the actions taken.
    fn accept<P: FaultInjectionPolicy>(
        state: &mut State<Access, Supervisor, P>,
        proposer: &mut Access,
        round: Round,
        block: Block,
    ) -> Vec<Action> {
        let height = state.height();
        let hash = block.hash();
        state
            .handle_proposal(proposal(proposer, height, round, None, block))
            .unwrap();
        state
            .verified(VerifyResult {
                height,
                round,
                block_hash: hash,
                success: true,
            })
            .unwrap();
        state.take_actions()
    }

    /// Start at height 10 as its elected proposer and drive consensus to a precommit for `X`.
    fn precommitted_as_proposer() -> (State<Access, Supervisor, Honest>, Vec<Access>, Hash) {
        let (mut state, mut keys) = setup(16);
        state.start(10, Hash::default(), None).unwrap();
        let context = state
            .take_actions()
            .into_iter()
            .find_map(|action| match action {
                Action::Propose(context) => Some(context),
                _ => None,
            })
            .expect("proposer should be asked to build");
        assert_eq!(context.proposer, ValidatorId::from("A"));
        let block = Block::new(10, context.parent, Bytes::from_static(b"X"));
        let hash = block.hash();
        assert!(state.proposed(context, block).unwrap());
        assert_eq!(state.step(), Step::Prevote);

        let actions = state.take_actions();
        let sent = broadcasts(&actions);
        assert!(matches!(sent[0], ConsensusMessage::Propose(p) if p.hash() == hash));
        assert!(matches!(sent[1], ConsensusMessage::Prevote(v) if v.hash == Some(hash)));

        for key in &mut keys[1..3] {
            state
                .handle_vote(vote(key, VoteType::Prevote, 10, 0, Some(hash)))
                .unwrap();
        }
        assert_eq!(state.step(), Step::Precommit);
        (state, keys, hash)
    }

    #[test]
    fn test_start_schedules_propose_timeout() {
        let (mut state, _) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        assert_eq!(
            (state.height(), state.round(), state.step()),
            (1, 0, Step::Propose)
        );

        let actions = state.take_actions();
        assert!(matches!(
            &actions[0],
            Action::PeersChanged { added, removed } if added.len() == 4 && removed.is_empty()
        ));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Timeout(duration, info)
                if *duration == Duration::from_secs(3) && info.step == Step::Propose
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Activity::ProposeStatus { allowed: false, .. })
        )));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, Action::Propose(_))));
    }

    #[test]
    fn test_proposer_commits_with_quorum() {
        let (mut state, mut keys, hash) = precommitted_as_proposer();
        assert_eq!(state.consensus().locked_round, Some(0));
        assert_eq!(state.consensus().valid_round, Some(0));
        let actions = state.take_actions();
        assert_eq!(
            own_vote(&actions, VoteType::Precommit).and_then(|v| v.hash),
            Some(hash)
        );

        for key in &mut keys[1..3] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 10, 0, Some(hash)))
                .unwrap();
        }
        assert_eq!(state.step(), Step::Commit);
        let actions = state.take_actions();
        let block = actions
            .iter()
            .find_map(|action| match action {
                Action::Commit(block) => Some(block.clone()),
                _ => None,
            })
            .expect("block should be committed");
        assert_eq!(block.hash(), hash);
        let certificate =
            QuorumCertificate::decode(&block.additional_data[QUORUM_CERTIFICATE_KEY]).unwrap();
        assert_eq!(certificate.votes.len(), 3);
        assert!(certificate
            .votes
            .iter()
            .all(|v| v.vote_type == VoteType::Precommit && v.hash == Some(hash)));
        assert_eq!(state.metrics.commits.get(), 1);

        // Move on, building on the committed block
        state.committed().unwrap();
        assert_eq!((state.height(), state.round()), (11, 0));
        let last_commit = state.consensus().votes.last_commit().unwrap();
        assert_eq!(last_commit.proposal.hash(), hash);
        assert_eq!(last_commit.precommits.len(), 3);
        let context = state
            .take_actions()
            .into_iter()
            .find_map(|action| match action {
                Action::Propose(context) => Some(context),
                _ => None,
            })
            .unwrap();
        assert_eq!(context.parent, hash);
    }

    #[test]
    fn test_follower_verifies_before_prevoting() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state.take_actions();

        let block = block(1, "X");
        let hash = block.hash();
        state
            .handle_proposal(proposal(&mut keys[1], 1, 0, None, block))
            .unwrap();
        assert_eq!(state.step(), Step::Propose);
        assert!(state.consensus().verifying_proposal.is_some());
        let actions = state.take_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::Verify(context, b) if context.proposer == ValidatorId::from("B") && b.hash() == hash)));

        // Stale results are ignored
        state
            .verified(VerifyResult {
                height: 1,
                round: 0,
                block_hash: Hash::digest(b"other"),
                success: true,
            })
            .unwrap();
        assert_eq!(state.step(), Step::Propose);

        state
            .verified(VerifyResult {
                height: 1,
                round: 0,
                block_hash: hash,
                success: true,
            })
            .unwrap();
        assert_eq!(state.step(), Step::Prevote);
        assert!(state.consensus().verifying_proposal.is_none());
        let actions = state.take_actions();
        assert_eq!(
            own_vote(&actions, VoteType::Prevote).and_then(|v| v.hash),
            Some(hash)
        );
    }

    #[test]
    fn test_failed_verification_prevotes_nil() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let block = block(1, "X");
        let hash = block.hash();
        state
            .handle_proposal(proposal(&mut keys[1], 1, 0, None, block))
            .unwrap();
        state
            .verified(VerifyResult {
                height: 1,
                round: 0,
                block_hash: hash,
                success: false,
            })
            .unwrap();
        assert_eq!(state.step(), Step::Prevote);
        assert!(state.consensus().proposal.is_none());
        let actions = state.take_actions();
        let prevote = own_vote(&actions, VoteType::Prevote).unwrap();
        assert_eq!(prevote.hash, None);
    }

    #[test]
    fn test_untrusted_proposals_dropped() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state.take_actions();

        // Not the elected proposer
        state
            .handle_proposal(proposal(&mut keys[2], 1, 0, None, block(1, "X")))
            .unwrap();

        // Tampered after signing
        let mut tampered = proposal(&mut keys[1], 1, 0, None, block(1, "X"));
        tampered.block.payload = Bytes::from_static(b"Y");
        state.handle_proposal(tampered).unwrap();

        // Signed by someone else
        let mut forged = proposal(&mut keys[2], 1, 0, None, block(1, "X"));
        forged.voter = ValidatorId::from("B");
        state.handle_proposal(forged).unwrap();

        // Proof-of-lock round not before the proposal round
        state
            .handle_proposal(proposal(&mut keys[1], 1, 0, Some(0), block(1, "X")))
            .unwrap();

        assert_eq!(state.metrics.invalid_messages.get(), 4);
        assert!(state.consensus().verifying_proposal.is_none());
        assert!(!state
            .take_actions()
            .iter()
            .any(|action| matches!(action, Action::Verify(..))));
    }

    #[test]
    fn test_conflicting_proposal_reported() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let first = proposal(&mut keys[1], 1, 0, None, block(1, "X"));
        let second = proposal(&mut keys[1], 1, 0, None, block(1, "Y"));
        state.handle_proposal(first.clone()).unwrap();
        state.take_actions();

        // Duplicates are not conflicts
        state.handle_proposal(first.clone()).unwrap();
        assert!(state.take_actions().is_empty());

        state.handle_proposal(second.clone()).unwrap();
        let actions = state.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Activity::ConflictingProposal { first: f, second: s })
                if *f == first && *s == second
        )));
        assert_eq!(state.metrics.equivocations.get(), 1);
        assert_eq!(
            state.consensus().verifying_proposal.as_ref().map(Proposal::hash),
            Some(first.hash())
        );
    }

    #[test]
    fn test_conflicting_proposal_committed_by_quorum() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let first = proposal(&mut keys[1], 1, 0, None, block(1, "X"));
        let second = proposal(&mut keys[1], 1, 0, None, block(1, "Y"));
        state.handle_proposal(first).unwrap();

        // Everyone else committed the other block
        for key in &mut keys[1..] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, Some(second.hash())))
                .unwrap();
        }
        assert_ne!(state.step(), Step::Commit);
        state.take_actions();

        state.handle_proposal(second.clone()).unwrap();
        assert_eq!(state.step(), Step::Commit);
        let actions = state.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Activity::ConflictingProposal { .. })
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Commit(block) if block.hash() == second.hash()
        )));
    }

    #[test]
    fn test_conflicting_vote_reported() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state.take_actions();
        let (x, y) = (Hash::digest(b"X"), Hash::digest(b"Y"));
        let first = vote(&mut keys[1], VoteType::Prevote, 1, 0, Some(x));
        let second = vote(&mut keys[1], VoteType::Prevote, 1, 0, Some(y));
        state.handle_vote(first.clone()).unwrap();
        state.handle_vote(second.clone()).unwrap();

        let actions = state.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Activity::ConflictingVote { first: f, second: s })
                if *f == first && *s == second
        )));
        let prevotes = state.consensus().votes.prevotes(0).unwrap();
        assert_eq!(prevotes.count(Some(&x)), 1);
        assert_eq!(prevotes.count(Some(&y)), 0);
        assert_eq!(state.metrics.equivocations.get(), 1);
    }

    #[test]
    fn test_timeouts_advance_steps() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state.take_actions();

        // Timeouts for other steps are stale
        let stale = TimeoutInfo {
            height: 1,
            round: 0,
            step: Step::Prevote,
        };
        state.handle_timeout(stale).unwrap();
        assert_eq!(state.step(), Step::Propose);

        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Propose,
            })
            .unwrap();
        assert_eq!(state.step(), Step::Prevote);
        let actions = state.take_actions();
        assert_eq!(own_vote(&actions, VoteType::Prevote).unwrap().hash, None);

        state.handle_timeout(stale).unwrap();
        assert_eq!(state.step(), Step::Precommit);
        let actions = state.take_actions();
        assert_eq!(own_vote(&actions, VoteType::Precommit).unwrap().hash, None);

        // A nil precommit quorum moves to the next round
        for key in &mut keys[1..3] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, None))
                .unwrap();
        }
        assert_eq!((state.round(), state.step()), (1, Step::Propose));
        let actions = state.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Activity::RoundAdvanced { height: 1, round: 1 })
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Timeout(duration, info)
                if *duration == Duration::from_millis(3500) && info.round == 1
        )));
        assert_eq!(state.metrics.round_advances.get(), 1);
    }

    #[test]
    fn test_precommit_timeout_advances_round() {
        let (mut state, _) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        for step in [Step::Propose, Step::Prevote, Step::Precommit] {
            state
                .handle_timeout(TimeoutInfo {
                    height: 1,
                    round: 0,
                    step,
                })
                .unwrap();
        }
        assert_eq!((state.round(), state.step()), (1, Step::Propose));
    }

    #[test]
    fn test_split_prevotes_precommit_nil() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Propose,
            })
            .unwrap();
        state
            .handle_vote(vote(&mut keys[1], VoteType::Prevote, 1, 0, Some(Hash::digest(b"X"))))
            .unwrap();
        assert_eq!(state.step(), Step::Prevote);
        state
            .handle_vote(vote(&mut keys[2], VoteType::Prevote, 1, 0, Some(Hash::digest(b"Y"))))
            .unwrap();
        assert_eq!(state.step(), Step::Precommit);
        let actions = state.take_actions();
        assert_eq!(own_vote(&actions, VoteType::Precommit).unwrap().hash, None);
    }

    #[test]
    fn test_locked_validator_prevotes_lock() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let x = block(1, "X");
        let x_hash = x.hash();
        accept(&mut state, &mut keys[1], 0, x);
        for key in &mut keys[1..3] {
            state
                .handle_vote(vote(key, VoteType::Prevote, 1, 0, Some(x_hash)))
                .unwrap();
        }
        assert_eq!(state.consensus().locked_round, Some(0));

        // Precommits split, so the round ends without a commit
        for key in &mut keys[1..3] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, None))
                .unwrap();
        }
        assert_eq!(state.round(), 1);
        state.take_actions();

        // The round 1 proposer offers something else without a proof-of-lock
        let y = block(1, "Y");
        let actions = accept(&mut state, &mut keys[2], 1, y);
        assert_eq!(
            own_vote(&actions, VoteType::Prevote).and_then(|v| v.hash),
            Some(x_hash)
        );
    }

    #[test]
    fn test_newer_prevote_quorum_releases_lock() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let x = block(1, "X");
        let x_hash = x.hash();
        accept(&mut state, &mut keys[1], 0, x);
        for key in &mut keys[1..3] {
            state
                .handle_vote(vote(key, VoteType::Prevote, 1, 0, Some(x_hash)))
                .unwrap();
        }
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Precommit,
            })
            .unwrap();
        assert_eq!(state.round(), 1);

        // Everyone else prevotes Y in round 1 while we stay locked on X
        let y = block(1, "Y");
        let y_hash = y.hash();
        accept(&mut state, &mut keys[2], 1, y.clone());
        for key in &mut keys[1..4] {
            state
                .handle_vote(vote(key, VoteType::Prevote, 1, 1, Some(y_hash)))
                .unwrap();
        }
        let consensus = state.consensus();
        assert_eq!(consensus.locked_round, Some(0));
        assert_eq!(consensus.valid_round, Some(1));
        assert_eq!(
            consensus.valid_proposal.as_ref().map(Proposal::hash),
            Some(y_hash)
        );
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 1,
                step: Step::Precommit,
            })
            .unwrap();
        assert_eq!(state.round(), 2);
        state.take_actions();

        // Y is re-proposed with the round 1 quorum as its proof-of-lock
        state
            .handle_proposal(proposal(&mut keys[3], 1, 2, Some(1), y))
            .unwrap();
        state
            .verified(VerifyResult {
                height: 1,
                round: 2,
                block_hash: y_hash,
                success: true,
            })
            .unwrap();
        let actions = state.take_actions();
        assert_eq!(
            own_vote(&actions, VoteType::Prevote).and_then(|v| v.hash),
            Some(y_hash)
        );
    }

    #[test]
    fn test_future_votes_dropped_without_buffer() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state
            .handle_vote(vote(&mut keys[1], VoteType::Prevote, 1, 2, None))
            .unwrap();
        state
            .handle_vote(vote(&mut keys[1], VoteType::Prevote, 2, 0, None))
            .unwrap();
        assert_eq!(state.metrics.stale_messages.get(), 2);
        assert!(state.consensus().votes.prevotes(2).is_none());
    }

    #[test]
    fn test_future_votes_replayed_on_round_entry() {
        let (mut state, mut keys) = setup_with(Honest, Supervisor::new(&VALIDATORS, 1), Some(16));
        state.start(1, Hash::default(), None).unwrap();
        for key in &mut keys[1..4] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 1, None))
                .unwrap();
        }
        assert_eq!(state.round(), 0);
        for step in [Step::Propose, Step::Prevote, Step::Precommit] {
            state
                .handle_timeout(TimeoutInfo {
                    height: 1,
                    round: 0,
                    step,
                })
                .unwrap();
        }

        // The buffered nil precommits end round 1 as soon as it starts
        assert_eq!((state.round(), state.step()), (2, Step::Propose));
    }

    /// Accept `X` from B in round 0 and then time out into round 1.
    fn missed_round(state: &mut State<Access, Supervisor, Honest>, keys: &mut [Access]) -> Block {
        state.start(1, Hash::default(), None).unwrap();
        let x = block(1, "X");
        accept(state, &mut keys[1], 0, x.clone());
        for step in [Step::Prevote, Step::Precommit] {
            state
                .handle_timeout(TimeoutInfo {
                    height: 1,
                    round: 0,
                    step,
                })
                .unwrap();
        }
        assert_eq!(state.round(), 1);
        state.take_actions();
        x
    }

    #[test]
    fn test_earlier_rounds_dropped() {
        let (mut state, mut keys) = setup(1);
        let x = missed_round(&mut state, &mut keys);
        let hash = x.hash();
        for key in &mut keys[1..4] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, Some(hash)))
                .unwrap();
        }
        state
            .handle_proposal(proposal(&mut keys[1], 1, 0, None, x))
            .unwrap();
        assert_eq!(state.metrics.stale_messages.get(), 4);
        assert_eq!(state.consensus().votes.precommits(0).unwrap().count(Some(&hash)), 0);
        assert_eq!((state.round(), state.step()), (1, Step::Propose));
    }

    #[test]
    fn test_commit_from_earlier_round() {
        let (mut state, mut keys) = setup(1);
        state.earlier_round_commits = true;
        let hash = missed_round(&mut state, &mut keys).hash();

        // Earlier prevotes are useless but precommits can still complete a commit
        state
            .handle_vote(vote(&mut keys[1], VoteType::Prevote, 1, 0, Some(hash)))
            .unwrap();
        assert_eq!(state.metrics.stale_messages.get(), 1);
        for key in &mut keys[1..4] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, Some(hash)))
                .unwrap();
        }
        assert_eq!(state.step(), Step::Commit);
        let actions = state.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Report(Activity::Committed { height: 1, round: 0, hash: h }) if *h == hash
        )));
    }

    #[test]
    fn test_late_proposal_commits() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Propose,
            })
            .unwrap();
        let x = block(1, "X");
        let hash = x.hash();
        for key in &mut keys[1..4] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, Some(hash)))
                .unwrap();
        }

        // Quorum exists but the block is unknown
        assert_eq!(state.step(), Step::Prevote);

        accept(&mut state, &mut keys[1], 0, x);
        assert_eq!(state.step(), Step::Commit);
        assert_eq!(state.metrics.commits.get(), 1);
    }

    #[test]
    fn test_restore_resumes_step() {
        let (state, _, hash) = precommitted_as_proposer();
        let persisted = encode_state(state.consensus());

        let (mut restored, _) = setup(16);
        restored.start(10, Hash::default(), Some(persisted.as_ref())).unwrap();
        assert_eq!(
            (restored.height(), restored.round(), restored.step()),
            (10, 0, Step::Precommit)
        );
        let consensus = restored.consensus();
        assert_eq!(consensus.locked_round, Some(0));
        assert_eq!(
            consensus.locked_proposal.as_ref().map(Proposal::hash),
            Some(hash)
        );
        assert_eq!(consensus.votes.prevotes(0).unwrap().count(Some(&hash)), 3);

        let actions = restored.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Timeout(_, info) if info.step == Step::Precommit
        )));
        assert_eq!(
            own_vote(&actions, VoteType::Precommit).and_then(|v| v.hash),
            Some(hash)
        );
    }

    #[test]
    fn test_restore_resumes_verification() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Propose,
            })
            .unwrap();

        // B's block arrives late and is still being verified when we crash
        let x = block(1, "X");
        let hash = x.hash();
        let late = proposal(&mut keys[1], 1, 0, None, x);
        state.handle_proposal(late.clone()).unwrap();
        assert_eq!(state.step(), Step::Prevote);
        let persisted = encode_state(state.consensus());

        let (mut restored, _) = setup(1);
        restored.start(1, Hash::default(), Some(persisted.as_ref())).unwrap();
        assert_eq!(restored.step(), Step::Prevote);
        let actions = restored.take_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Verify(context, block)
                if context.proposer == ValidatorId::from("B") && block.hash() == hash
        )));

        // Redelivery is a duplicate, the verification already in flight completes the commit
        restored.handle_proposal(late).unwrap();
        restored
            .verified(VerifyResult {
                height: 1,
                round: 0,
                block_hash: hash,
                success: true,
            })
            .unwrap();
        for key in &mut keys[1..4] {
            restored
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, Some(hash)))
                .unwrap();
        }
        assert_eq!(restored.step(), Step::Commit);
        assert_eq!(restored.metrics.commits.get(), 1);
    }

    #[test]
    fn test_restore_discards_other_height() {
        let (state, _, _) = precommitted_as_proposer();
        let persisted = encode_state(state.consensus());

        let (mut restored, _) = setup(16);
        restored.start(11, Hash::default(), Some(persisted.as_ref())).unwrap();
        assert_eq!(
            (restored.height(), restored.round(), restored.step()),
            (11, 0, Step::Propose)
        );
        assert!(restored.consensus().locked_proposal.is_none());
    }

    #[test]
    fn test_restore_commit_without_quorum_is_fatal() {
        let (mut state, _) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let mut consensus = state.snapshot();
        consensus.step = Step::Commit;
        let persisted = encode_state(&consensus);

        let (mut restored, _) = setup(1);
        assert_eq!(
            restored.start(1, Hash::default(), Some(persisted.as_ref())),
            Err(FatalConsensusError::CommitWithoutQuorum {
                height: 1,
                round: 0
            })
        );
    }

    #[test]
    fn test_restore_commit_without_proposal_is_fatal() {
        let (mut state, mut keys) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let hash = Hash::digest(b"X");
        for key in &mut keys[1..4] {
            state
                .handle_vote(vote(key, VoteType::Precommit, 1, 0, Some(hash)))
                .unwrap();
        }
        assert_eq!(state.step(), Step::Propose);
        let mut consensus = state.snapshot();
        consensus.step = Step::Commit;
        let persisted = encode_state(&consensus);

        let (mut restored, _) = setup(1);
        assert_eq!(
            restored.start(1, Hash::default(), Some(persisted.as_ref())),
            Err(FatalConsensusError::ProposalMissingAtCommit {
                height: 1,
                round: 0
            })
        );
    }

    #[test]
    fn test_fast_forward() {
        let (mut state, _) = setup(1);
        state.start(1, Hash::default(), None).unwrap();
        let parent = Hash::digest(b"parent");
        state.fast_forward(5, parent).unwrap();
        assert_eq!((state.height(), state.round()), (6, 0));
        state.fast_forward(3, Hash::default()).unwrap();
        assert_eq!(state.height(), 6);

        // Height 6 is proposed by C, so wait for a proposal extending `parent`
        let mut keys = Access::generate(&VALIDATORS);
        let block = Block::new(6, parent, Bytes::from_static(b"X"));
        state
            .handle_proposal(proposal(&mut keys[2], 6, 0, None, block))
            .unwrap();
        assert!(state.consensus().verifying_proposal.is_some());
    }

    #[test]
    fn test_validator_set_change() {
        let schedule = BTreeMap::from([(0, VALIDATORS.to_vec()), (2, vec!["A", "B", "C", "E"])]);
        let (mut state, _) = setup_with(Honest, Supervisor::scheduled(schedule, 1), None);
        state.start(1, Hash::default(), None).unwrap();
        state.take_actions();
        state.fast_forward(1, Hash::default()).unwrap();
        let actions = state.take_actions();
        assert!(matches!(
            &actions[0],
            Action::PeersChanged { added, removed }
                if added == &[ValidatorId::from("E")] && removed == &[ValidatorId::from("D")]
        ));
        assert!(!state.validators().contains(&ValidatorId::from("D")));
    }

    #[test]
    fn test_equivocator_splits_peers() {
        let (mut state, _) = setup_with(Equivocator, Supervisor::new(&VALIDATORS, 1), None);
        state.start(4, Hash::default(), None).unwrap();
        let context = state
            .take_actions()
            .into_iter()
            .find_map(|action| match action {
                Action::Propose(context) => Some(context),
                _ => None,
            })
            .unwrap();
        state.proposed(context, block(4, "X")).unwrap();
        let sends: Vec<_> = state
            .take_actions()
            .into_iter()
            .filter_map(|action| match action {
                Action::Send(recipients, ConsensusMessage::Propose(proposal)) => {
                    Some((recipients, proposal.hash()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].0, vec![ValidatorId::from("B")]);
        assert_eq!(
            sends[1].0,
            vec![ValidatorId::from("C"), ValidatorId::from("D")]
        );
        assert_ne!(sends[0].1, sends[1].1);
    }

    #[test]
    fn test_invalid_voter_forges_hash() {
        let (mut state, _) = setup_with(InvalidVoter, Supervisor::new(&VALIDATORS, 1), None);
        state.start(1, Hash::default(), None).unwrap();
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Propose,
            })
            .unwrap();
        let actions = state.take_actions();
        assert!(own_vote(&actions, VoteType::Prevote).unwrap().hash.is_some());
    }

    #[test]
    fn test_silent_withholds_votes() {
        let (mut state, _) = setup_with(Silent, Supervisor::new(&VALIDATORS, 1), None);
        state.start(1, Hash::default(), None).unwrap();
        state
            .handle_timeout(TimeoutInfo {
                height: 1,
                round: 0,
                step: Step::Propose,
            })
            .unwrap();
        assert_eq!(state.step(), Step::Prevote);
        let actions = state.take_actions();
        assert!(broadcasts(&actions).is_empty());
        assert!(state.consensus().votes.prevotes(0).is_none());
    }
}
