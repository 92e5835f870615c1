use crate::{
    tbft::types::{Height, ValidatorId},
    Supervisor as Su,
};
use std::{collections::BTreeMap, sync::Arc};

/// Validator sets scheduled by the height they take effect.
#[derive(Clone, Debug)]
pub struct Supervisor {
    schedule: Arc<BTreeMap<Height, Vec<ValidatorId>>>,
    blocks_per_proposer: u64,
}

impl Supervisor {
    pub fn new(validators: &[&str], blocks_per_proposer: u64) -> Self {
        Self::scheduled(BTreeMap::from([(0, validators.to_vec())]), blocks_per_proposer)
    }

    pub fn scheduled(schedule: BTreeMap<Height, Vec<&str>>, blocks_per_proposer: u64) -> Self {
        let schedule = schedule
            .into_iter()
            .map(|(height, names)| {
                (
                    height,
                    names.into_iter().map(ValidatorId::from).collect(),
                )
            })
            .collect();
        Self {
            schedule: Arc::new(schedule),
            blocks_per_proposer,
        }
    }
}

impl Su for Supervisor {
    fn validators(&self, height: Height) -> Option<Vec<ValidatorId>> {
        self.schedule
            .range(..=height)
            .next_back()
            .map(|(_, validators)| validators.clone())
    }

    fn blocks_per_proposer(&self, _height: Height) -> u64 {
        self.blocks_per_proposer
    }
}
