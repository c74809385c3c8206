use std::{
    fmt::{self, Display},
    net::Ipv4Addr,
};

/// An IPv4 address identifying one end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    /// `0.0.0.0`, which binds to every local interface
    pub const UNSPECIFIED: Self = Self(Ipv4Addr::UNSPECIFIED);
    pub const LOCALHOST: Self = Self(Ipv4Addr::LOCALHOST);
    pub const BROADCAST: Self = Self(Ipv4Addr::BROADCAST);

    pub const fn new([a, b, c, d]: [u8; 4]) -> Self {
        Self(Ipv4Addr::new(a, b, c, d))
    }

    pub fn is_unspecified(self) -> bool {
        self.0.is_unspecified()
    }

    pub fn to_u32(self) -> u32 {
        self.0.into()
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.octets()
    }
}

impl Default for Ipv4Address {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(address: Ipv4Addr) -> Self {
        Self(address)
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n.into())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(octets: [u8; 4]) -> Self {
        Self(octets.into())
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        address.to_u32()
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_agree() {
        let address = Ipv4Address::new([10, 0, 0, 42]);
        assert_eq!(address.to_u32(), 0x0a00_002a);
        assert_eq!(Ipv4Address::from(0x0a00_002a), address);
        assert_eq!(<[u8; 4]>::from(address), [10, 0, 0, 42]);
        assert_eq!(Ipv4Addr::from(address), Ipv4Addr::new(10, 0, 0, 42));
        assert_eq!(address.to_string(), "10.0.0.42");
        assert_eq!(Ipv4Address::default(), Ipv4Address::UNSPECIFIED);
        assert!(Ipv4Address::UNSPECIFIED.is_unspecified());
        assert!(!Ipv4Address::LOCALHOST.is_unspecified());
    }
}
