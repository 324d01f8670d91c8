use crate::errinput;
use crate::error::{Error, Result};

use std::collections::HashSet;
use std::net::Ipv4Addr;

/// A finite pool of virtual IPs, configured as an IPv4 CIDR range. The pool
/// itself is stateless: the set of allocated addresses is always derived
/// from the catalog, never stored, so allocation survives restarts and
/// snapshot restores for free.
#[derive(Clone, Debug, PartialEq)]
pub struct Pool {
    network: u32,
    prefix: u8,
}

impl Pool {
    /// Parses a pool from CIDR notation, e.g. "10.0.0.0/24".
    pub fn new(cidr: &str) -> Result<Self> {
        let Some((addr, prefix)) = cidr.split_once('/') else {
            return errinput!("invalid CIDR {cidr}");
        };
        let addr: Ipv4Addr = addr.parse()?;
        let prefix: u8 = prefix.parse()?;
        if prefix > 32 {
            return errinput!("invalid prefix length /{prefix}");
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Ok(Self { network: u32::from(addr) & mask, prefix })
    }

    /// Iterates over the usable host addresses in CIDR order. The network
    /// and broadcast addresses are excluded for prefixes shorter than /31.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let size = 1u64 << (32 - self.prefix);
        let (skip, take) = match self.prefix {
            31 | 32 => (0, size),
            _ => (1, size - 2),
        };
        (0..size).skip(skip as usize).take(take as usize).map(|i| Ipv4Addr::from(self.network + i as u32))
    }

    /// Returns the first address in CIDR order that is not in the used set,
    /// or Exhausted if every address is taken.
    pub fn first_free(&self, used: &HashSet<String>) -> Result<Ipv4Addr> {
        self.hosts()
            .find(|ip| !used.contains(&ip.to_string()))
            .ok_or_else(|| Error::Exhausted(format!("vip pool {self}")))
    }
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(Pool::new("10.0.0.0/24").unwrap().to_string(), "10.0.0.0/24");
        // Host bits are masked off.
        assert_eq!(Pool::new("10.0.0.5/24").unwrap().to_string(), "10.0.0.0/24");
        assert!(Pool::new("10.0.0.0").is_err());
        assert!(Pool::new("10.0.0.0/33").is_err());
        assert!(Pool::new("banana/8").is_err());
    }

    #[test]
    fn hosts_exclude_network_and_broadcast() {
        let hosts: Vec<String> = Pool::new("10.0.0.0/30").unwrap().hosts().map(|ip| ip.to_string()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);

        let hosts: Vec<String> = Pool::new("10.0.0.0/31").unwrap().hosts().map(|ip| ip.to_string()).collect();
        assert_eq!(hosts, vec!["10.0.0.0", "10.0.0.1"]);
    }

    #[test]
    fn first_free_in_order() {
        let pool = Pool::new("10.0.0.0/29").unwrap();
        let mut used = HashSet::new();
        assert_eq!(pool.first_free(&used).unwrap().to_string(), "10.0.0.1");
        used.insert("10.0.0.1".to_string());
        used.insert("10.0.0.3".to_string());
        assert_eq!(pool.first_free(&used).unwrap().to_string(), "10.0.0.2");
    }

    #[test]
    fn exhaustion() {
        let pool = Pool::new("10.0.0.0/30").unwrap();
        let used: HashSet<String> = ["10.0.0.1", "10.0.0.2"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(pool.first_free(&used), Err(Error::Exhausted(_))));
    }
}
