//! Implementation of a `simulated` network.

use super::{metrics, Error};
use crate::{Message, PublicKey, Recipients};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, error};

type Task<P> = (P, Recipients<P>, Bytes, oneshot::Sender<Vec<P>>);

type Links<P> = Arc<Mutex<HashMap<(P, P), Link>>>;

/// Describes a connection between two peers.
///
/// Links are unidirectional (and must be set up in both directions
/// for a bidirectional connection).
#[derive(Clone, Debug)]
pub struct Link {
    /// Mean latency for the delivery of a message in milliseconds.
    pub latency: f64,

    /// Standard deviation of the latency for the delivery of a message in milliseconds.
    ///
    /// Any non-zero jitter allows messages to be delivered out of order.
    pub jitter: f64,

    /// Probability of a message being delivered successfully (in range [0,1]).
    pub success_rate: f64,

    /// Probability of a delivered message being delivered a second time (in range [0,1]).
    pub duplicate_rate: f64,
}

impl Link {
    /// A link that delivers every message exactly once after `latency` milliseconds.
    pub fn reliable(latency: f64) -> Self {
        Self {
            latency,
            jitter: 0.0,
            success_rate: 1.0,
            duplicate_rate: 0.0,
        }
    }
}

/// Configuration for a `simulated` network.
pub struct Config {
    /// Registry for network metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Maximum size of a message that can be sent over the network.
    pub max_size: usize,

    /// Seed for the network's link randomness (drops, duplicates, and latency).
    pub seed: u64,
}

/// Implementation of a `simulated` network.
pub struct Network<P: PublicKey> {
    rng: StdRng,
    max_size: usize,
    sender: mpsc::UnboundedSender<Task<P>>,
    receiver: mpsc::UnboundedReceiver<Task<P>>,
    links: Links<P>,
    agents: BTreeMap<P, mpsc::UnboundedSender<Message<P>>>,

    received_messages: Family<metrics::Message, Counter>,
    sent_messages: Family<metrics::Message, Counter>,
}

impl<P: PublicKey> Network<P> {
    /// Create a new simulated network and an [Oracle] that can modify links while it runs.
    pub fn new(cfg: Config) -> (Self, Oracle<P>) {
        let (sender, receiver) = mpsc::unbounded();
        let sent_messages = Family::<metrics::Message, Counter>::default();
        let received_messages = Family::<metrics::Message, Counter>::default();
        {
            let mut registry = cfg.registry.lock().unwrap();
            registry.register("messages_sent", "messages sent", sent_messages.clone());
            registry.register(
                "messages_received",
                "messages received",
                received_messages.clone(),
            );
        }
        let links: Links<P> = Arc::new(Mutex::new(HashMap::new()));

        (
            Self {
                rng: StdRng::seed_from_u64(cfg.seed),
                max_size: cfg.max_size,
                sender,
                receiver,
                links: links.clone(),
                agents: BTreeMap::new(),
                received_messages,
                sent_messages,
            },
            Oracle { links },
        )
    }

    /// Register a new peer with the network.
    ///
    /// By default, the peer will not be linked to any other peers.
    pub fn register(&mut self, public_key: P) -> Result<(Sender<P>, Receiver<P>), Error> {
        if self.agents.contains_key(&public_key) {
            return Err(Error::AlreadyRegistered);
        }
        let (sender, receiver) = mpsc::unbounded();
        self.agents.insert(public_key.clone(), sender);
        Ok((
            Sender {
                me: public_key,
                max_size: self.max_size,
                sender: self.sender.clone(),
            },
            Receiver { receiver },
        ))
    }

    /// Run the simulated network.
    pub async fn run(mut self) {
        // Drop our own handle so the network exits once all senders are gone
        drop(self.sender);
        while let Some((origin, recipients, message, reply)) = self.receiver.next().await {
            // Collect recipients
            let recipients = match recipients {
                Recipients::All => self.agents.keys().cloned().collect(),
                Recipients::Some(keys) => keys,
                Recipients::One(key) => vec![key],
            };

            // Send to all recipients
            let mut sent = Vec::new();
            for recipient in recipients {
                // Skip self
                if recipient == origin {
                    continue;
                }

                // Determine if recipient exists
                let Some(agent) = self.agents.get(&recipient) else {
                    debug!(%recipient, reason = "no agent", "dropping message");
                    continue;
                };

                // Determine if there is a link between the sender and recipient
                let link = self
                    .links
                    .lock()
                    .unwrap()
                    .get(&(origin.clone(), recipient.clone()))
                    .cloned();
                let Some(link) = link else {
                    debug!(%recipient, reason = "no link", "dropping message");
                    continue;
                };
                self.sent_messages
                    .get_or_create(&metrics::Message::new(&origin, &recipient))
                    .inc();

                // Apply link settings
                let should_deliver = self.rng.gen_bool(link.success_rate);
                let copies = if self.rng.gen_bool(link.duplicate_rate) {
                    2
                } else {
                    1
                };
                for _ in 0..copies {
                    let delay = Normal::new(link.latency, link.jitter)
                        .map(|normal| normal.sample(&mut self.rng))
                        .unwrap_or(link.latency)
                        .max(0.0);
                    let agent = agent.clone();
                    let origin = origin.clone();
                    let recipient = recipient.clone();
                    let message = message.clone();
                    let received_messages = self.received_messages.clone();
                    tokio::spawn(async move {
                        // Messages can be delivered out of order
                        tokio::time::sleep(Duration::from_micros((delay * 1000.0) as u64)).await;
                        if !should_deliver {
                            debug!(%recipient, reason = "random link failure", "dropping message");
                            return;
                        }
                        if let Err(err) = agent.unbounded_send((origin.clone(), message)) {
                            // This can only happen if the receiver exited.
                            debug!(%origin, %recipient, ?err, "failed to deliver");
                            return;
                        }
                        received_messages
                            .get_or_create(&metrics::Message::new(&origin, &recipient))
                            .inc();
                    });
                }
                sent.push(recipient);
            }

            // Notify sender of successful hand-off
            if reply.send(sent).is_err() {
                error!("failed to send ack");
            }
        }
    }
}

/// Handle for modifying links of a running [Network].
#[derive(Clone)]
pub struct Oracle<P: PublicKey> {
    links: Links<P>,
}

impl<P: PublicKey> Oracle<P> {
    /// Create (or replace) a unidirectional link between two peers.
    pub fn add_link(&self, sender: P, receiver: P, link: Link) -> Result<(), Error> {
        if sender == receiver {
            return Err(Error::LinkingSelf);
        }
        if !(0.0..=1.0).contains(&link.success_rate) {
            return Err(Error::InvalidSuccessRate(link.success_rate));
        }
        if !(0.0..=1.0).contains(&link.duplicate_rate) {
            return Err(Error::InvalidDuplicateRate(link.duplicate_rate));
        }
        if link.latency < 0.0 || link.jitter < 0.0 {
            return Err(Error::InvalidLatency(link.latency, link.jitter));
        }
        self.links.lock().unwrap().insert((sender, receiver), link);
        Ok(())
    }

    /// Remove a unidirectional link between two peers.
    pub fn remove_link(&self, sender: P, receiver: P) -> Result<(), Error> {
        self.links
            .lock()
            .unwrap()
            .remove(&(sender, receiver))
            .map(|_| ())
            .ok_or(Error::LinkMissing)
    }

    /// Link every pair of distinct peers in both directions.
    pub fn link_all(&self, peers: &[P], link: Link) -> Result<(), Error> {
        for sender in peers {
            for receiver in peers {
                if sender == receiver {
                    continue;
                }
                self.add_link(sender.clone(), receiver.clone(), link.clone())?;
            }
        }
        Ok(())
    }
}

/// Implementation of a [`crate::Sender`] for the simulated network.
#[derive(Clone, Debug)]
pub struct Sender<P: PublicKey> {
    me: P,
    max_size: usize,
    sender: mpsc::UnboundedSender<Task<P>>,
}

impl<P: PublicKey> crate::Sender for Sender<P> {
    type Error = Error;
    type PublicKey = P;

    async fn send(
        &mut self,
        recipients: Recipients<P>,
        message: Bytes,
        _priority: bool,
    ) -> Result<Vec<P>, Error> {
        // Check message size
        if message.len() > self.max_size {
            return Err(Error::MessageTooLarge(message.len()));
        }

        // Send message
        let (sender, receiver) = oneshot::channel();
        self.sender
            .unbounded_send((self.me.clone(), recipients, message, sender))
            .map_err(|_| Error::NetworkClosed)?;
        receiver.await.map_err(|_| Error::NetworkClosed)
    }
}

/// Implementation of a [`crate::Receiver`] for the simulated network.
#[derive(Debug)]
pub struct Receiver<P: PublicKey> {
    receiver: mpsc::UnboundedReceiver<Message<P>>,
}

impl<P: PublicKey> crate::Receiver for Receiver<P> {
    type Error = Error;
    type PublicKey = P;

    async fn recv(&mut self) -> Result<Message<P>, Error> {
        self.receiver.next().await.ok_or(Error::NetworkClosed)
    }
}
