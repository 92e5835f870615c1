use crate::{
    tbft::types::{Activity, Hash, Height},
    Reporter as Re,
};
use std::sync::{Arc, Mutex};

/// Records all activity.
#[derive(Clone, Default)]
pub struct Reporter {
    activities: Arc<Mutex<Vec<Activity>>>,
}

impl Reporter {
    pub fn activities(&self) -> Vec<Activity> {
        self.activities.lock().unwrap().clone()
    }

    /// Blocks committed, in order.
    pub fn committed(&self) -> Vec<(Height, Hash)> {
        self.activities
            .lock()
            .unwrap()
            .iter()
            .filter_map(|activity| match activity {
                Activity::Committed { height, hash, .. } => Some((*height, *hash)),
                _ => None,
            })
            .collect()
    }

    pub fn conflicting_proposals(&self) -> usize {
        self.activities
            .lock()
            .unwrap()
            .iter()
            .filter(|activity| matches!(activity, Activity::ConflictingProposal { .. }))
            .count()
    }
}

impl Re for Reporter {
    async fn report(&mut self, activity: Activity) {
        self.activities.lock().unwrap().push(activity);
    }
}
