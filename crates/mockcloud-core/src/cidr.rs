//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "IPv4 network parsing and host address allocation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    #[error("expected <address>/<prefix>, got '{0}'")]
    MissingPrefix(String),
    #[error("'{0}' is not an IPv4 address")]
    InvalidAddress(String),
    #[error("'{0}' is not a prefix length between 0 and 32")]
    InvalidPrefix(String),
    #[error("{address}/{prefix} has host bits set; the network address is {network}")]
    HostBitsSet {
        address: Ipv4Addr,
        prefix: u8,
        network: Ipv4Addr,
    },
}

/// An IPv4 network in CIDR notation whose address has no host bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Network {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Network {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::InvalidPrefix(prefix.to_string()));
        }
        let network = Ipv4Addr::from(u32::from(address) & mask(prefix));
        if network != address {
            return Err(CidrError::HostBitsSet {
                address,
                prefix,
                network,
            });
        }
        Ok(Self {
            network: address,
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    /// Number of assignable hosts, excluding network and broadcast addresses.
    pub fn usable_hosts(&self) -> u64 {
        let size = 1u64 << (32 - u32::from(self.prefix));
        size.saturating_sub(2)
    }

    /// The `index`-th assignable host, counting from zero.
    pub fn host(&self, index: u64) -> Option<Ipv4Addr> {
        if index >= self.usable_hosts() {
            return None;
        }
        let offset = u32::try_from(index + 1).ok()?;
        Some(Ipv4Addr::from(u32::from(self.network) + offset))
    }

    /// Whether `address` is an assignable host of this network.
    pub fn contains_host(&self, address: Ipv4Addr) -> bool {
        let raw = u32::from(address);
        raw & mask(self.prefix) == u32::from(self.network)
            && address != self.network
            && address != self.broadcast()
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Network {
    type Err = CidrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (address, prefix) = trimmed
            .split_once('/')
            .ok_or_else(|| CidrError::MissingPrefix(trimmed.to_owned()))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| CidrError::InvalidAddress(address.to_owned()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CidrError::InvalidPrefix(prefix.to_owned()))?;
        Self::new(address, prefix)
    }
}

impl Serialize for Ipv4Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("address range {network} is exhausted")]
    Exhausted { network: Ipv4Network },
    #[error("no free address found in {network} after {attempts} attempts")]
    RetriesExceeded { network: Ipv4Network, attempts: u32 },
}

/// Pick a random free host in `network`.
///
/// Collisions with `taken` are retried up to `retry_limit` draws. A network
/// whose hosts are all taken fails without drawing.
pub fn allocate<R: Rng + ?Sized>(
    network: &Ipv4Network,
    taken: &HashSet<Ipv4Addr>,
    rng: &mut R,
    retry_limit: u32,
) -> Result<Ipv4Addr, AllocationError> {
    let capacity = network.usable_hosts();
    let used = taken
        .iter()
        .filter(|address| network.contains_host(**address))
        .count() as u64;
    if capacity == 0 || used >= capacity {
        return Err(AllocationError::Exhausted { network: *network });
    }

    for _ in 0..retry_limit {
        let candidate = network
            .host(rng.gen_range(0..capacity))
            .ok_or(AllocationError::Exhausted { network: *network })?;
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(AllocationError::RetriesExceeded {
        network: *network,
        attempts: retry_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parses_and_displays_networks() {
        let network: Ipv4Network = "10.0.0.0/16".parse().unwrap();
        assert_eq!(network.to_string(), "10.0.0.0/16");
        assert_eq!(network.broadcast(), Ipv4Addr::new(10, 0, 255, 255));
        assert_eq!(network.usable_hosts(), 65_534);
        assert_eq!(network.host(0), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(network.host(65_533), Some(Ipv4Addr::new(10, 0, 255, 254)));
        assert_eq!(network.host(65_534), None);
    }

    #[test]
    fn rejects_malformed_networks() {
        assert!(matches!(
            "10.0.0.0".parse::<Ipv4Network>(),
            Err(CidrError::MissingPrefix(_))
        ));
        assert!(matches!(
            "10.0.0.300/16".parse::<Ipv4Network>(),
            Err(CidrError::InvalidAddress(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<Ipv4Network>(),
            Err(CidrError::InvalidPrefix(_))
        ));
        assert!(matches!(
            "10.0.1.0/16".parse::<Ipv4Network>(),
            Err(CidrError::HostBitsSet { .. })
        ));
        assert!("0.0.0.0/0".parse::<Ipv4Network>().is_ok());
    }

    #[test]
    fn host_membership_excludes_network_and_broadcast() {
        let network: Ipv4Network = "192.168.4.0/30".parse().unwrap();
        assert!(!network.contains_host(Ipv4Addr::new(192, 168, 4, 0)));
        assert!(network.contains_host(Ipv4Addr::new(192, 168, 4, 1)));
        assert!(network.contains_host(Ipv4Addr::new(192, 168, 4, 2)));
        assert!(!network.contains_host(Ipv4Addr::new(192, 168, 4, 3)));
        assert!(!network.contains_host(Ipv4Addr::new(192, 168, 5, 1)));
    }

    #[test]
    fn allocation_fills_a_small_network_then_reports_exhaustion() {
        let network: Ipv4Network = "172.16.0.0/29".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut taken = HashSet::new();
        for _ in 0..network.usable_hosts() {
            let address = allocate(&network, &taken, &mut rng, 1_000).unwrap();
            assert!(network.contains_host(address));
            assert!(taken.insert(address));
        }
        assert_eq!(
            allocate(&network, &taken, &mut rng, 1_000),
            Err(AllocationError::Exhausted { network })
        );
    }

    #[test]
    fn allocation_gives_up_after_retry_limit() {
        let network: Ipv4Network = "10.1.0.0/30".parse().unwrap();
        let taken: HashSet<_> = [Ipv4Addr::new(10, 1, 0, 1)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = allocate(&network, &taken, &mut rng, 64);
        assert_eq!(outcome, Ok(Ipv4Addr::new(10, 1, 0, 2)));
        assert_eq!(
            allocate(&network, &taken, &mut rng, 0),
            Err(AllocationError::RetriesExceeded {
                network,
                attempts: 0
            })
        );
    }
}
