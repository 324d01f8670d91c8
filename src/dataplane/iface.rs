use crate::error::{Error, Result};

use std::collections::BTreeSet;
use std::sync::Mutex;

/// The set of VIP addresses bound on a network interface. Addresses are
/// added with a /32 mask and carry a marker label, so that only addresses
/// owned by the balancer are visible here and flushed on leadership changes.
/// The real implementation issues address syscalls and lives outside this
/// crate.
///
/// Only the cluster leader writes to the interface.
pub trait Interface: Send + Sync {
    /// Lists the marked addresses bound on the interface.
    fn vips(&self) -> Result<Vec<String>>;

    /// Binds an address with a /32 mask and the marker label.
    fn add_vip(&self, ip: &str) -> Result<()>;

    /// Unbinds an address. Errors with NotFound if it is not bound.
    fn delete_vip(&self, ip: &str) -> Result<()>;

    /// Unbinds all marked addresses.
    fn flush(&self) -> Result<()>;
}

/// An in-memory interface address set for tests and development mode.
#[derive(Default)]
pub struct MemoryInterface {
    vips: Mutex<BTreeSet<String>>,
}

impl MemoryInterface {
    /// Creates an interface with no bound addresses.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interface for MemoryInterface {
    fn vips(&self) -> Result<Vec<String>> {
        Ok(self.vips.lock()?.iter().cloned().collect())
    }

    fn add_vip(&self, ip: &str) -> Result<()> {
        if !self.vips.lock()?.insert(ip.to_string()) {
            return Err(Error::Exists(format!("address {ip}")));
        }
        Ok(())
    }

    fn delete_vip(&self, ip: &str) -> Result<()> {
        if !self.vips.lock()?.remove(ip) {
            return Err(Error::NotFound(format!("address {ip}")));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.vips.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_unbind() {
        let iface = MemoryInterface::new();
        iface.add_vip("10.0.0.1").unwrap();
        iface.add_vip("10.0.0.2").unwrap();
        assert!(matches!(iface.add_vip("10.0.0.1"), Err(Error::Exists(_))));

        assert_eq!(iface.vips().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);

        iface.delete_vip("10.0.0.1").unwrap();
        assert!(matches!(iface.delete_vip("10.0.0.1"), Err(Error::NotFound(_))));

        iface.flush().unwrap();
        assert!(iface.vips().unwrap().is_empty());
    }
}
