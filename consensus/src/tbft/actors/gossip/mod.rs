//! Periodically exchange [GossipState] with peers and send them whatever they are missing.
//!
//! Gossip never drives consensus. It only re-sends proposals and votes that a peer's summary
//! shows it lacks, which lets validators recover from dropped messages without relying on
//! reliable broadcast.

mod actor;
mod ingress;
mod reconcile;

use super::voter;
use crate::tbft::{metrics::Metrics, types::ValidatorId};
pub use actor::Actor;
pub use ingress::Mailbox;
pub use reconcile::reconcile;
use std::time::Duration;

pub struct Config {
    pub me: ValidatorId,
    pub voter: voter::Reader,
    pub metrics: Metrics,
    pub mailbox_size: usize,
    pub interval: Duration,
    pub fanout: usize,
}
