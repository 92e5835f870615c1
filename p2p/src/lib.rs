//! Exchange messages between TBFT validators.
//!
//! # Overview
//!
//! The consensus core never opens sockets. It interacts with the network exclusively through
//! the [Sender] and [Receiver] traits defined here, which makes the transport (gossip overlay,
//! authenticated TCP mesh, in-process channels) an implementation detail of the embedding node.
//!
//! Delivery is assumed to be best-effort: messages may be dropped, duplicated, or reordered. The
//! [simulated] network exercises exactly these behaviors in tests.

use bytes::Bytes;
use std::{
    error::Error as StdError,
    fmt::{Debug, Display},
    future::Future,
    hash::Hash,
};

pub mod simulated;

/// Identity of a participant on the network.
pub trait PublicKey: Clone + Debug + Display + Eq + Hash + Ord + Send + Sync + 'static {}

impl<T> PublicKey for T where T: Clone + Debug + Display + Eq + Hash + Ord + Send + Sync + 'static {}

/// Tuple representing a message received from a given public key.
pub type Message<P> = (P, Bytes);

/// Enum indicating the set of recipients to send a message to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipients<P: PublicKey> {
    All,
    Some(Vec<P>),
    One(P),
}

/// Interface for sending messages to a set of recipients.
pub trait Sender: Clone + Debug + Send + 'static {
    /// Error that can occur when sending a message.
    type Error: Debug + StdError + Send + Sync;

    /// Public key type used to identify recipients.
    type PublicKey: PublicKey;

    /// Send a message to a set of recipients.
    ///
    /// Returns the recipients the message was handed off to (which does not imply delivery).
    fn send(
        &mut self,
        recipients: Recipients<Self::PublicKey>,
        message: Bytes,
        priority: bool,
    ) -> impl Future<Output = Result<Vec<Self::PublicKey>, Self::Error>> + Send;
}

/// Interface for receiving messages from arbitrary recipients.
pub trait Receiver: Debug + Send + 'static {
    /// Error that can occur when receiving a message.
    type Error: Debug + StdError + Send + Sync;

    /// Public key type used to identify recipients.
    type PublicKey: PublicKey;

    /// Receive a message from an arbitrary recipient.
    fn recv(
        &mut self,
    ) -> impl Future<Output = Result<Message<Self::PublicKey>, Self::Error>> + Send;
}
