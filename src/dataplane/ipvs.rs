use crate::catalog::{Destination, Mode, Protocol, Service};
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A virtual server in the kernel table. The kernel identity is the
/// (address, port, protocol) triple; it doesn't know about service names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Virtual {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: String,
}

impl Virtual {
    /// Returns the kernel identity of the virtual server.
    pub fn id(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.protocol)
    }
}

impl From<&Service> for Virtual {
    fn from(service: &Service) -> Self {
        Self {
            host: service.host.clone(),
            port: service.port,
            protocol: service.protocol,
            scheduler: service.scheduler.clone(),
        }
    }
}

/// A real server behind a virtual server, identified by (address, port)
/// within its virtual server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Real {
    pub host: String,
    pub port: u16,
    pub weight: i32,
    pub mode: Mode,
}

impl Real {
    /// Returns the kernel identity of the real server within its virtual
    /// server.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&Destination> for Real {
    fn from(destination: &Destination) -> Self {
        Self {
            host: destination.host.clone(),
            port: destination.port,
            weight: destination.weight,
            mode: destination.mode,
        }
    }
}

/// Traffic counters of a virtual server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub connections: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// The kernel L4 virtual server table. The real implementation issues
/// netlink calls and lives outside this crate; in-process engines implement
/// the same contract for tests and development mode.
///
/// Every node programs its own kernel, so no cross-node locking is needed.
pub trait Ipvs: Send + Sync {
    /// Lists all virtual servers with their real servers.
    fn list(&self) -> Result<Vec<(Virtual, Vec<Real>)>>;

    /// Adds a virtual server. Errors with Exists if it is already present.
    fn add_virtual(&self, virt: &Virtual) -> Result<()>;

    /// Updates a virtual server, e.g. its scheduler.
    fn update_virtual(&self, virt: &Virtual) -> Result<()>;

    /// Deletes a virtual server and its real servers. Errors with NotFound
    /// if it is absent.
    fn delete_virtual(&self, virt: &Virtual) -> Result<()>;

    /// Adds a real server to a virtual server.
    fn add_real(&self, virt: &Virtual, real: &Real) -> Result<()>;

    /// Updates a real server, e.g. its weight.
    fn update_real(&self, virt: &Virtual, real: &Real) -> Result<()>;

    /// Deletes a real server from a virtual server.
    fn delete_real(&self, virt: &Virtual, real: &Real) -> Result<()>;

    /// Returns the traffic counters of a virtual server.
    fn counters(&self, virt: &Virtual) -> Result<Counters>;
}

/// An in-memory virtual server table with the same semantics as the kernel
/// one, including the benign error cases the reconciler must tolerate.
#[derive(Default)]
pub struct MemoryIpvs {
    table: Mutex<BTreeMap<String, Entry>>,
}

struct Entry {
    virt: Virtual,
    reals: BTreeMap<String, Real>,
    counters: Counters,
}

impl MemoryIpvs {
    /// Creates an empty virtual server table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ipvs for MemoryIpvs {
    fn list(&self) -> Result<Vec<(Virtual, Vec<Real>)>> {
        let table = self.table.lock()?;
        Ok(table
            .values()
            .map(|entry| (entry.virt.clone(), entry.reals.values().cloned().collect()))
            .collect())
    }

    fn add_virtual(&self, virt: &Virtual) -> Result<()> {
        let mut table = self.table.lock()?;
        if table.contains_key(&virt.id()) {
            return Err(Error::Exists(format!("virtual server {}", virt.id())));
        }
        table.insert(
            virt.id(),
            Entry { virt: virt.clone(), reals: BTreeMap::new(), counters: Counters::default() },
        );
        Ok(())
    }

    fn update_virtual(&self, virt: &Virtual) -> Result<()> {
        let mut table = self.table.lock()?;
        let entry = table
            .get_mut(&virt.id())
            .ok_or_else(|| Error::NotFound(format!("virtual server {}", virt.id())))?;
        entry.virt = virt.clone();
        Ok(())
    }

    fn delete_virtual(&self, virt: &Virtual) -> Result<()> {
        let mut table = self.table.lock()?;
        if table.remove(&virt.id()).is_none() {
            return Err(Error::NotFound(format!("virtual server {}", virt.id())));
        }
        Ok(())
    }

    fn add_real(&self, virt: &Virtual, real: &Real) -> Result<()> {
        let mut table = self.table.lock()?;
        let entry = table
            .get_mut(&virt.id())
            .ok_or_else(|| Error::NotFound(format!("virtual server {}", virt.id())))?;
        if entry.reals.contains_key(&real.id()) {
            return Err(Error::Exists(format!("real server {}", real.id())));
        }
        entry.reals.insert(real.id(), real.clone());
        Ok(())
    }

    fn update_real(&self, virt: &Virtual, real: &Real) -> Result<()> {
        let mut table = self.table.lock()?;
        let entry = table
            .get_mut(&virt.id())
            .ok_or_else(|| Error::NotFound(format!("virtual server {}", virt.id())))?;
        let existing = entry
            .reals
            .get_mut(&real.id())
            .ok_or_else(|| Error::NotFound(format!("real server {}", real.id())))?;
        *existing = real.clone();
        Ok(())
    }

    fn delete_real(&self, virt: &Virtual, real: &Real) -> Result<()> {
        let mut table = self.table.lock()?;
        let entry = table
            .get_mut(&virt.id())
            .ok_or_else(|| Error::NotFound(format!("virtual server {}", virt.id())))?;
        if entry.reals.remove(&real.id()).is_none() {
            return Err(Error::NotFound(format!("real server {}", real.id())));
        }
        Ok(())
    }

    fn counters(&self, virt: &Virtual) -> Result<Counters> {
        let table = self.table.lock()?;
        let entry = table
            .get(&virt.id())
            .ok_or_else(|| Error::NotFound(format!("virtual server {}", virt.id())))?;
        Ok(entry.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn virt() -> Virtual {
        Virtual {
            host: "10.0.0.1".to_string(),
            port: 80,
            protocol: Protocol::Tcp,
            scheduler: "rr".to_string(),
        }
    }

    #[test]
    fn benign_errors() {
        let ipvs = MemoryIpvs::new();
        let virt = virt();

        ipvs.add_virtual(&virt).unwrap();
        assert!(matches!(ipvs.add_virtual(&virt), Err(Error::Exists(_))));

        ipvs.delete_virtual(&virt).unwrap();
        assert!(matches!(ipvs.delete_virtual(&virt), Err(Error::NotFound(_))));
    }

    #[test]
    fn reals_nested_in_virtual() {
        let ipvs = MemoryIpvs::new();
        let virt = virt();
        let real = Real { host: "192.168.1.10".to_string(), port: 8080, weight: 1, mode: Mode::Nat };

        assert!(matches!(ipvs.add_real(&virt, &real), Err(Error::NotFound(_))));

        ipvs.add_virtual(&virt).unwrap();
        ipvs.add_real(&virt, &real).unwrap();
        assert!(matches!(ipvs.add_real(&virt, &real), Err(Error::Exists(_))));

        // Deleting the virtual server deletes its reals.
        ipvs.delete_virtual(&virt).unwrap();
        ipvs.add_virtual(&virt).unwrap();
        assert_eq!(ipvs.list().unwrap()[0].1.len(), 0);
    }

    #[test]
    fn counters_zeroed() {
        let ipvs = MemoryIpvs::new();
        let virt = virt();
        ipvs.add_virtual(&virt).unwrap();
        assert_eq!(ipvs.counters(&virt).unwrap(), Counters::default());
    }
}
