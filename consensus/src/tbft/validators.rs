//! Ordered validator set with deterministic proposer election.

use super::types::{Height, Round, ValidatorId};
use std::collections::HashMap;
use tbft_utils::quorum;

/// Ordered list of validators active at some height.
///
/// The order of validators is significant: every honest node must construct the set from
/// the same ordered list (as resolved from chain configuration) or proposer election will
/// diverge. Duplicate identifiers are ignored (the first occurrence wins).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<ValidatorId>,
    indices: HashMap<ValidatorId, u32>,
    blocks_per_proposer: u64,
}

impl ValidatorSet {
    /// Create a new validator set.
    ///
    /// A `blocks_per_proposer` of zero is treated as one.
    pub fn new(validators: Vec<ValidatorId>, blocks_per_proposer: u64) -> Self {
        let (validators, indices) = Self::index(validators);
        Self {
            validators,
            indices,
            blocks_per_proposer: blocks_per_proposer.max(1),
        }
    }

    fn index(list: Vec<ValidatorId>) -> (Vec<ValidatorId>, HashMap<ValidatorId, u32>) {
        let mut validators = Vec::with_capacity(list.len());
        let mut indices = HashMap::with_capacity(list.len());
        for validator in list {
            if indices.contains_key(&validator) {
                continue;
            }
            indices.insert(validator.clone(), validators.len() as u32);
            validators.push(validator);
        }
        (validators, indices)
    }

    /// Number of validators in the set.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns true if the set has no validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Number of matching votes required for a quorum (strictly more than two-thirds of
    /// the validator count).
    pub fn quorum(&self) -> usize {
        quorum(self.validators.len() as u32).unwrap_or(0) as usize
    }

    /// Returns true if `validator` is a member of the set.
    pub fn contains(&self, validator: &ValidatorId) -> bool {
        self.indices.contains_key(validator)
    }

    /// Position of `validator` in the set.
    pub fn index_of(&self, validator: &ValidatorId) -> Option<u32> {
        self.indices.get(validator).copied()
    }

    /// Validator at position `index`.
    pub fn get(&self, index: u32) -> Option<&ValidatorId> {
        self.validators.get(index as usize)
    }

    /// Iterate over validators in order.
    pub fn iter(&self) -> impl Iterator<Item = &ValidatorId> {
        self.validators.iter()
    }

    /// Number of consecutive heights each validator proposes before rotation advances.
    pub fn blocks_per_proposer(&self) -> u64 {
        self.blocks_per_proposer
    }

    /// Select the proposer for `(height, round)`.
    ///
    /// Each validator proposes `blocks_per_proposer` consecutive heights. Within a height,
    /// every round change rotates to the next validator. This is a pure function of its
    /// inputs and the ordered validator list.
    pub fn get_proposer(&self, height: Height, round: Round) -> Option<&ValidatorId> {
        let n = self.validators.len() as u64;
        if n == 0 {
            return None;
        }
        let height_offset = (height / self.blocks_per_proposer) % n;
        let round_offset = (round as u64) % n;
        let index = (height_offset + round_offset) % n;
        self.validators.get(index as usize)
    }

    /// Replace the validator list, returning the validators that were `(added, removed)`.
    ///
    /// The new list is fully constructed before it replaces the old one.
    pub fn update_validators(
        &mut self,
        list: Vec<ValidatorId>,
    ) -> (Vec<ValidatorId>, Vec<ValidatorId>) {
        let (validators, indices) = Self::index(list);
        let added = validators
            .iter()
            .filter(|v| !self.indices.contains_key(*v))
            .cloned()
            .collect();
        let removed = self
            .validators
            .iter()
            .filter(|v| !indices.contains_key(*v))
            .cloned()
            .collect();
        self.validators = validators;
        self.indices = indices;
        (added, removed)
    }

    /// Adjust the rotation cadence (takes effect for the next proposer computed).
    pub fn update_blocks_per_proposer(&mut self, blocks_per_proposer: u64) {
        self.blocks_per_proposer = blocks_per_proposer.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ValidatorId> {
        names.iter().map(|n| ValidatorId::from(*n)).collect()
    }

    #[test]
    fn test_proposer_rotation() {
        let set = ValidatorSet::new(ids(&["a", "b", "c", "d"]), 1);
        let proposers: Vec<_> = (0..8)
            .map(|h| set.get_proposer(h, 0).unwrap().clone())
            .collect();
        assert_eq!(proposers, ids(&["a", "b", "c", "d", "a", "b", "c", "d"]));

        // Round changes rotate too
        assert_eq!(set.get_proposer(0, 1).unwrap(), &ValidatorId::from("b"));
        assert_eq!(set.get_proposer(3, 1).unwrap(), &ValidatorId::from("a"));
        assert_eq!(set.get_proposer(3, 5).unwrap(), &ValidatorId::from("a"));
    }

    #[test]
    fn test_blocks_per_proposer() {
        let mut set = ValidatorSet::new(ids(&["a", "b", "c"]), 2);
        let proposers: Vec<_> = (0..6)
            .map(|h| set.get_proposer(h, 0).unwrap().clone())
            .collect();
        assert_eq!(proposers, ids(&["a", "a", "b", "b", "c", "c"]));

        set.update_blocks_per_proposer(3);
        assert_eq!(set.get_proposer(5, 0).unwrap(), &ValidatorId::from("b"));

        // Zero is clamped
        set.update_blocks_per_proposer(0);
        assert_eq!(set.blocks_per_proposer(), 1);
    }

    #[test]
    fn test_proposer_determinism() {
        let list = ids(&["v1", "v2", "v3", "v4", "v5", "v6", "v7"]);
        let a = ValidatorSet::new(list.clone(), 4);
        let b = ValidatorSet::new(list, 4);
        for height in 0..200 {
            for round in 0..10 {
                let first = a.get_proposer(height, round);
                assert_eq!(first, a.get_proposer(height, round));
                assert_eq!(first, b.get_proposer(height, round));
            }
        }
        assert_eq!(
            a.get_proposer(u64::MAX, u32::MAX),
            b.get_proposer(u64::MAX, u32::MAX)
        );
    }

    #[test]
    fn test_empty_set() {
        let set = ValidatorSet::new(Vec::new(), 1);
        assert!(set.is_empty());
        assert_eq!(set.quorum(), 0);
        assert!(set.get_proposer(1, 0).is_none());
    }

    #[test]
    fn test_duplicates_ignored() {
        let set = ValidatorSet::new(ids(&["a", "b", "a", "c"]), 1);
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of(&ValidatorId::from("c")), Some(2));
        assert_eq!(set.get(1), Some(&ValidatorId::from("b")));
    }

    #[test]
    fn test_update_validators() {
        let mut set = ValidatorSet::new(ids(&["a", "b", "c", "d"]), 1);
        let (added, removed) = set.update_validators(ids(&["b", "c", "d", "e", "f"]));
        assert_eq!(added, ids(&["e", "f"]));
        assert_eq!(removed, ids(&["a"]));
        assert_eq!(set.len(), 5);
        assert!(!set.contains(&ValidatorId::from("a")));
        assert_eq!(set.index_of(&ValidatorId::from("b")), Some(0));
        assert_eq!(set.quorum(), 4);

        // No change yields empty differences
        let (added, removed) = set.update_validators(ids(&["b", "c", "d", "e", "f"]));
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_quorum() {
        for (n, expected) in [(1, 1), (2, 2), (3, 3), (4, 3), (5, 4), (7, 5)] {
            let list = (0..n).map(|i| ValidatorId::from(format!("v{i}"))).collect();
            let set = ValidatorSet::new(list, 1);
            assert_eq!(set.quorum(), expected, "n={n}");
        }
    }
}
