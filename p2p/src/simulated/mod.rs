//! Send messages between arbitrary peers with configurable performance (drops, duplicates,
//! latency, and jitter).
//!
//! Each registered peer receives a [network::Sender] and [network::Receiver]. Links are
//! unidirectional and can be added or removed at any time through the [network::Oracle]
//! returned by [network::Network::new], which makes it possible to partition and heal the
//! network in the middle of a test.

mod metrics;
pub mod network;

pub use network::{Config, Link, Network, Oracle, Receiver, Sender};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("network closed")]
    NetworkClosed,
    #[error("peer already registered")]
    AlreadyRegistered,
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("link missing")]
    LinkMissing,
    #[error("invalid success rate (must be in [0, 1]): {0}")]
    InvalidSuccessRate(f64),
    #[error("invalid duplicate rate (must be in [0, 1]): {0}")]
    InvalidDuplicateRate(f64),
    #[error("invalid latency (must be non-negative): latency={0} jitter={1}")]
    InvalidLatency(f64, f64),
}
