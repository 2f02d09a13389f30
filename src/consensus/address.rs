//! Cluster membership: addresses, late-bound address resolution, and the
//! ordered member configuration.

use super::node::MemberId;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::sync::Arc;

/// A member network address: host and port. Value-comparable, used both for
/// cluster configuration and transient TCP targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Creates an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Resolves the address to a socket address, taking the first candidate.
    /// Resolution happens on every call, so DNS changes take effect on the
    /// next reconnect attempt.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(format!("address {self} did not resolve")))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("address {s} must be host:port")))?;
        if host.is_empty() {
            return Err(Error::InvalidInput(format!("address {s} has an empty host")));
        }
        Ok(Self { host: host.to_string(), port: port.parse()? })
    }
}

/// Resolves a member's current address. The indirection allows addresses to
/// be supplied lazily or late, e.g. from service discovery; the resolver is
/// consulted on every (re)connect attempt.
pub trait AddressResolver: Send + Sync {
    /// Returns the member's current address.
    fn resolve(&self) -> Result<Address>;
}

/// A fixed address resolves to itself.
impl AddressResolver for Address {
    fn resolve(&self) -> Result<Address> {
        Ok(self.clone())
    }
}

/// The cluster membership: an ordered list of address resolvers. A member's
/// position in the list is its identity on the wire. Immutable once
/// constructed; [`super::Node::join`] replaces the configuration wholesale
/// and rebuilds every peer connection.
#[derive(Clone)]
pub struct Configuration {
    members: Vec<Arc<dyn AddressResolver>>,
}

impl Configuration {
    /// Creates a configuration from an ordered list of resolvers.
    pub fn new(members: Vec<Arc<dyn AddressResolver>>) -> Self {
        Self { members }
    }

    /// Creates a configuration from fixed addresses.
    pub fn from_addresses(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self::new(
            addresses.into_iter().map(|a| Arc::new(a) as Arc<dyn AddressResolver>).collect(),
        )
    }

    /// The number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The strict majority: more than half of the members.
    pub fn majority(&self) -> usize {
        self.size() / 2 + 1
    }

    /// Whether the given member index is part of the configuration.
    pub fn contains(&self, id: MemberId) -> bool {
        (id as usize) < self.members.len()
    }

    /// Returns the resolver for the given member.
    pub fn resolver(&self, id: MemberId) -> Result<Arc<dyn AddressResolver>> {
        self.members
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("member {id} not in configuration")))
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Configuration").field("size", &self.size()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn address_parse_and_display() {
        let address: Address = "127.0.0.1:9701".parse().unwrap();
        assert_eq!(address, Address::new("127.0.0.1", 9701));
        assert_eq!(address.to_string(), "127.0.0.1:9701");

        assert!("no-port".parse::<Address>().is_err());
        assert!(":9701".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn majority() {
        for (size, majority) in [(1u16, 1usize), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4)] {
            let config = Configuration::from_addresses(
                (0..size).map(|i| Address::new("localhost", 9700 + i)),
            );
            assert_eq!(config.size(), size as usize);
            assert_eq!(config.majority(), majority);
        }
    }

    #[test]
    fn late_bound_resolver() {
        // A resolver consulted on every connect attempt, e.g. a registry.
        struct Registry;
        impl AddressResolver for Registry {
            fn resolve(&self) -> crate::error::Result<Address> {
                Ok(Address::new("resolved", 1234))
            }
        }

        let config = Configuration::new(vec![Arc::new(Registry)]);
        assert_eq!(config.resolver(0).unwrap().resolve().unwrap(), Address::new("resolved", 1234));
        assert!(config.resolver(1).is_err());
    }
}
