//! Small types shared by the codec and the connection table.

use crate::Ipv4Address;
use std::{
    fmt::{self, Display},
    net::SocketAddrV4,
};

/// The ones' complement sum behind the Internet checksum. Bytes are paired
/// big-endian in the order they are pushed, so a sum can be fed in pieces of
/// any length.
#[derive(Debug, Default, Clone, Copy)]
pub struct Checksum {
    sum: u64,
    /// The first half of a pair still waiting for its partner
    pending: Option<u8>,
}

impl Checksum {
    pub fn push(&mut self, bytes: impl IntoIterator<Item = u8>) {
        for byte in bytes {
            match self.pending.take() {
                Some(high) => self.sum += u64::from(u16::from_be_bytes([high, byte])),
                None => self.pending = Some(byte),
            }
        }
    }

    /// The checksum field value. An odd final byte is padded with zero.
    pub fn finish(self) -> u16 {
        let mut sum = self.sum + self.pending.map_or(0, |high| u64::from(high) << 8);
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// An address and port pair naming one end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    /// `0.0.0.0:0`, which stands in for the peer of bound and listening
    /// connections
    pub const UNSPECIFIED: Self = Self::new(Ipv4Address::UNSPECIFIED, 0);

    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn is_unspecified(self) -> bool {
        self.address.is_unspecified() && self.port == 0
    }

    pub const fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(address: SocketAddrV4) -> Self {
        Self::new((*address.ip()).into(), address.port())
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddrV4::new(endpoint.address.into(), endpoint.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddrV4::from(*self).fmt(f)
    }
}
