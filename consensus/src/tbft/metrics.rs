//! Metrics for TBFT consensus.

use super::types::ConsensusMessage;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::{atomic::AtomicI64, Arc, Mutex};

/// Message types for metrics labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MessageType {
    Propose,
    Prevote,
    Precommit,
    GossipState,
}

/// Message label for metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub message: MessageType,
}

impl Message {
    pub fn new(message: &ConsensusMessage) -> Self {
        let message = match message {
            ConsensusMessage::Propose(_) => MessageType::Propose,
            ConsensusMessage::Prevote(_) => MessageType::Prevote,
            ConsensusMessage::Precommit(_) => MessageType::Precommit,
            ConsensusMessage::GossipState(_) => MessageType::GossipState,
        };
        Self { message }
    }
}

/// Handles to every metric tracked by consensus.
///
/// Cloning shares the underlying metrics.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub current_height: Gauge<i64, AtomicI64>,
    pub current_round: Gauge<i64, AtomicI64>,
    pub commits: Counter,
    pub round_advances: Counter,
    pub equivocations: Counter,
    pub invalid_messages: Counter,
    pub stale_messages: Counter,
    pub persist_failures: Counter,
    pub gossip_sent: Counter,
    pub inbound_messages: Family<Message, Counter>,
    pub outbound_messages: Family<Message, Counter>,
}

impl Metrics {
    /// Create metrics and register them with `registry`.
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self::default();
        let mut registry = registry.lock().unwrap();
        registry.register(
            "current_height",
            "height consensus is working on",
            metrics.current_height.clone(),
        );
        registry.register(
            "current_round",
            "round consensus is working on",
            metrics.current_round.clone(),
        );
        registry.register("commits", "blocks committed", metrics.commits.clone());
        registry.register(
            "round_advances",
            "rounds that ended without a commit",
            metrics.round_advances.clone(),
        );
        registry.register(
            "equivocations",
            "conflicting proposals or votes observed",
            metrics.equivocations.clone(),
        );
        registry.register(
            "invalid_messages",
            "messages that failed decoding or authentication",
            metrics.invalid_messages.clone(),
        );
        registry.register(
            "stale_messages",
            "messages for a height or round that is not active",
            metrics.stale_messages.clone(),
        );
        registry.register(
            "persist_failures",
            "failed attempts to read or write consensus state",
            metrics.persist_failures.clone(),
        );
        registry.register(
            "gossip_sent",
            "messages sent to reconcile peer state",
            metrics.gossip_sent.clone(),
        );
        registry.register(
            "inbound_messages",
            "messages received by type",
            metrics.inbound_messages.clone(),
        );
        registry.register(
            "outbound_messages",
            "messages sent by type",
            metrics.outbound_messages.clone(),
        );
        drop(registry);
        metrics
    }

    /// Record an outbound message.
    pub fn outbound(&self, message: &ConsensusMessage) {
        self.outbound_messages
            .get_or_create(&Message::new(message))
            .inc();
    }

    /// Record an inbound message.
    pub fn inbound(&self, message: &ConsensusMessage) {
        self.inbound_messages
            .get_or_create(&Message::new(message))
            .inc();
    }
}
