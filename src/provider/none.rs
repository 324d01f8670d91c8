use super::{Pool, Provider};
use crate::catalog::{Catalog, Service};
use crate::dataplane::Interface;
use crate::error::{Error, Result};

use log::debug;
use std::collections::HashSet;
use std::sync::Arc;

/// The built-in provider: first-free allocation from a configured CIDR pool,
/// and interface reconciliation against the catalog. There is no external
/// allocator to talk to, hence the name.
pub struct NoneProvider {
    pool: Pool,
    iface: Arc<dyn Interface>,
}

impl NoneProvider {
    /// Creates a provider from a CIDR range and an interface.
    pub fn new(vip_range: &str, iface: Arc<dyn Interface>) -> Result<Self> {
        Ok(Self { pool: Pool::new(vip_range)?, iface })
    }
}

impl Provider for NoneProvider {
    fn allocate_vip(&self, service: &mut Service, catalog: &Catalog) -> Result<()> {
        let used: HashSet<String> = catalog.services().into_iter().map(|s| s.host).collect();
        let ip = self.pool.first_free(&used)?;
        debug!("Allocated VIP {ip} to service {}", service.name);
        service.host = ip.to_string();
        Ok(())
    }

    fn release_vip(&self, _service: &Service) -> Result<()> {
        // Allocation derives the used set from live state, so there is
        // nothing to release.
        Ok(())
    }

    fn sync_vips(&self, catalog: &Catalog) -> Result<()> {
        let want: HashSet<String> = catalog.services().into_iter().map(|s| s.host).collect();
        let bound: HashSet<String> = self.iface.vips()?.into_iter().collect();

        let mut errors = Vec::new();
        for ip in want.difference(&bound) {
            debug!("Binding VIP {ip}");
            match self.iface.add_vip(ip) {
                Ok(()) | Err(Error::Exists(_)) => {}
                Err(err) => errors.push(format!("error adding ip {ip}: {err}")),
            }
        }
        for ip in bound.difference(&want) {
            debug!("Unbinding VIP {ip}");
            match self.iface.delete_vip(ip) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(err) => errors.push(format!("error deleting ip {ip}: {err}")),
            }
        }

        if !errors.is_empty() {
            return Err(Error::IO(errors.join("; ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::service;
    use crate::dataplane::MemoryInterface;

    fn setup(vip_range: &str) -> (NoneProvider, Arc<MemoryInterface>) {
        let iface = Arc::new(MemoryInterface::new());
        (NoneProvider::new(vip_range, iface.clone()).unwrap(), iface)
    }

    /// Allocation returns distinct addresses for distinct services until the
    /// pool is exhausted, then a typed error.
    #[test]
    fn allocates_distinct_until_exhausted() {
        let (provider, _) = setup("10.0.0.0/30");
        let mut catalog = Catalog::new();

        let mut web = service("web", "", 80);
        provider.allocate_vip(&mut web, &catalog).unwrap();
        assert_eq!(web.host, "10.0.0.1");
        catalog.add_service(web);

        let mut api = service("api", "", 443);
        provider.allocate_vip(&mut api, &catalog).unwrap();
        assert_eq!(api.host, "10.0.0.2");
        catalog.add_service(api);

        let mut extra = service("extra", "", 8080);
        assert!(matches!(provider.allocate_vip(&mut extra, &catalog), Err(Error::Exhausted(_))));
        assert_eq!(extra.host, "");
    }

    /// Released addresses become allocatable again, because the used set is
    /// derived from the catalog.
    #[test]
    fn reallocates_after_delete() {
        let (provider, _) = setup("10.0.0.0/30");
        let mut catalog = Catalog::new();

        let mut web = service("web", "", 80);
        provider.allocate_vip(&mut web, &catalog).unwrap();
        catalog.add_service(web.clone());
        provider.release_vip(&web).unwrap();
        catalog.delete_service(&web);

        let mut api = service("api", "", 443);
        provider.allocate_vip(&mut api, &catalog).unwrap();
        assert_eq!(api.host, "10.0.0.1");
    }

    /// After a sync pass, the bound set equals the catalog's hosts.
    #[test]
    fn sync_converges() {
        let (provider, iface) = setup("10.0.0.0/24");
        let mut catalog = Catalog::new();
        catalog.add_service(service("web", "10.0.0.1", 80));
        catalog.add_service(service("api", "10.0.0.2", 443));

        // A stale binding from a previous leadership term.
        iface.add_vip("10.0.0.9").unwrap();

        provider.sync_vips(&catalog).unwrap();
        assert_eq!(iface.vips().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);

        catalog.delete_service(&service("api", "10.0.0.2", 443));
        provider.sync_vips(&catalog).unwrap();
        assert_eq!(iface.vips().unwrap(), vec!["10.0.0.1"]);
    }
}
