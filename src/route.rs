//! The seam between the transport engine and the network layer beneath it.

use crate::{Ipv4Address, Message};
use thiserror::Error as ThisError;

/// Size of the IPv4 and TCP headers without options.
const HEADER_OVERHEAD: u32 = 40;

/// The interface and link properties used to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// The local interface address that segments on this route are sent from.
    pub source: Ipv4Address,
    /// The largest IP datagram the link carries.
    pub mtu: u32,
}

impl Route {
    pub const fn new(source: Ipv4Address, mtu: u32) -> Self {
        Self { source, mtu }
    }

    /// The largest segment payload that fits in one datagram on this route.
    pub fn mss(&self) -> u32 {
        self.mtu.saturating_sub(HEADER_OVERHEAD).max(1)
    }
}

/// A serialized segment together with the addresses it travels between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
    pub message: Message,
}

/// Supplied by the embedder to connect the engine to a network layer.
///
/// The engine calls [`transmit`](Router::transmit) while holding a
/// connection's lock, so an implementation must hand the datagram off rather
/// than deliver it back into the same [`Tcp`](crate::Tcp) synchronously.
pub trait Router: Send + Sync {
    /// Finds the route to a peer, if there is one.
    fn resolve_route(&self, destination: Ipv4Address) -> Option<Route>;

    /// Whether the address belongs to a local interface.
    fn is_local(&self, address: Ipv4Address) -> bool;

    /// Sends a datagram along the given route.
    fn transmit(&self, route: &Route, datagram: Datagram) -> Result<(), TransmitError>;
}

/// Why the network layer could not accept a datagram.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmitError {
    #[error("The destination is unreachable")]
    Unreachable,
    #[error("No buffer space is available")]
    NoBuffers,
    #[error("The datagram exceeds the link MTU")]
    TooLarge,
}
