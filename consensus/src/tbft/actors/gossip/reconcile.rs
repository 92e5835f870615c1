use crate::tbft::types::{ConsensusMessage, ConsensusState, GossipState, VoteType};

/// Messages held in `state` that a peer reporting `peer` appears to be missing.
///
/// * At the same height: the proposal (if the peer is in the same round and has none) and any
///   votes for the peer's round absent from its bitmaps.
/// * One height behind: the committed proposal and its precommits, which let the peer commit.
///
/// Summaries are untrusted and only ever cause re-sends of messages we already hold.
pub fn reconcile(state: &ConsensusState, peer: &GossipState) -> Vec<ConsensusMessage> {
    let mut missing = Vec::new();
    if peer.height.checked_add(1) == Some(state.height) {
        if let Some(last_commit) = state.votes.last_commit() {
            missing.push(ConsensusMessage::Propose(last_commit.proposal.clone()));
            missing.extend(
                last_commit
                    .precommits
                    .votes()
                    .cloned()
                    .map(ConsensusMessage::Precommit),
            );
        }
        return missing;
    }
    if peer.height != state.height {
        return missing;
    }

    if peer.round == state.round && peer.proposal.is_none() && peer.verifying_proposal.is_none() {
        if let Some(proposal) = &state.proposal {
            missing.push(ConsensusMessage::Propose(proposal.clone()));
        }
    }

    // Bitmaps are only meaningful against the same validator set
    let validators = state.votes.validators();
    for (vote_type, seen) in [
        (VoteType::Prevote, &peer.prevotes),
        (VoteType::Precommit, &peer.precommits),
    ] {
        if seen.len() != validators.len() {
            continue;
        }
        let Some(votes) = state.votes.get(peer.round, vote_type) else {
            continue;
        };
        for vote in votes.votes() {
            let Some(index) = validators.index_of(&vote.voter) else {
                continue;
            };
            if seen.get(index as usize) == Some(false) {
                missing.push(ConsensusMessage::vote(vote.clone()));
            }
        }
    }
    missing
}
