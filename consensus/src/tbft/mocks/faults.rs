//! Validators that deviate from the protocol.

use crate::{
    tbft::types::{Height, Round},
    FaultInjectionPolicy,
};
use std::time::Duration;

/// Send conflicting proposals whenever elected.
#[derive(Clone, Copy, Debug, Default)]
pub struct Equivocator;

impl FaultInjectionPolicy for Equivocator {
    fn equivocate_proposal(&mut self, _height: Height, _round: Round) -> bool {
        true
    }
}

/// Vote for blocks that do not exist.
#[derive(Clone, Copy, Debug, Default)]
pub struct InvalidVoter;

impl FaultInjectionPolicy for InvalidVoter {
    fn invalid_prevote(&mut self, _height: Height, _round: Round) -> bool {
        true
    }

    fn invalid_precommit(&mut self, _height: Height, _round: Round) -> bool {
        true
    }
}

/// Propose late (after the given delay).
#[derive(Clone, Copy, Debug)]
pub struct Slow {
    pub delay: Duration,
}

impl FaultInjectionPolicy for Slow {
    fn propose_delay(&mut self, _height: Height, _round: Round) -> Option<Duration> {
        Some(self.delay)
    }
}

/// Never send anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Silent;

impl FaultInjectionPolicy for Silent {
    fn drop_proposal(&mut self, _height: Height, _round: Round) -> bool {
        true
    }

    fn drop_prevote(&mut self, _height: Height, _round: Round) -> bool {
        true
    }

    fn drop_precommit(&mut self, _height: Height, _round: Round) -> bool {
        true
    }
}
