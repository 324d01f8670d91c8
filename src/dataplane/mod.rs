//! The dataplane is the kernel-facing side of the balancer: the in-kernel
//! L4 virtual server table and the VIP addresses bound on a network
//! interface. Both are consumed through traits; the in-memory engines here
//! are used for development mode and tests, while programming the real
//! kernel (netlink) is an external concern behind the same traits.

mod iface;
mod ipvs;

pub use iface::{Interface, MemoryInterface};
pub use ipvs::{Counters, Ipvs, MemoryIpvs, Real, Virtual};

use crate::catalog::Catalog;
use crate::error::{Error, Result};

use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reconciles the kernel virtual server table with the catalog. The
/// reconciler is stateless: every pass is a full comparison of desired
/// against observed state, so it self-heals from external tampering with the
/// kernel table.
pub struct Reconciler {
    ipvs: Arc<dyn Ipvs>,
}

impl Reconciler {
    /// Creates a new reconciler over the given dataplane.
    pub fn new(ipvs: Arc<dyn Ipvs>) -> Self {
        Self { ipvs }
    }

    /// Brings the kernel table into agreement with the catalog: removes
    /// unknown virtual servers, adds missing ones, updates scheduler changes,
    /// and diffs the real server set of each virtual server. Individual
    /// failures are accumulated and returned as one compound error; partial
    /// progress is allowed.
    pub fn sync(&self, catalog: &Catalog) -> Result<()> {
        let mut errors = Vec::new();

        let want: BTreeMap<String, (Virtual, BTreeMap<String, Real>)> = catalog
            .services()
            .iter()
            .map(|service| {
                let virt = Virtual::from(service);
                let reals: BTreeMap<String, Real> = service
                    .destinations
                    .iter()
                    .map(|destination| {
                        let real = Real::from(destination);
                        (real.id(), real)
                    })
                    .collect();
                (virt.id(), (virt, reals))
            })
            .collect();

        let have: BTreeMap<String, (Virtual, BTreeMap<String, Real>)> = self
            .ipvs
            .list()?
            .into_iter()
            .map(|(virt, reals)| {
                let reals = reals.into_iter().map(|real| (real.id(), real)).collect();
                (virt.id(), (virt, reals))
            })
            .collect();

        // Remove virtual servers the catalog doesn't know about.
        for (id, (virt, _)) in &have {
            if !want.contains_key(id) {
                debug!("Removing virtual server {id}");
                Self::accumulate(&mut errors, self.ipvs.delete_virtual(virt));
            }
        }

        for (id, (virt, reals)) in &want {
            let Some((existing, existing_reals)) = have.get(id) else {
                // A new virtual server, with all of its reals.
                debug!("Adding virtual server {id}");
                Self::accumulate(&mut errors, self.ipvs.add_virtual(virt));
                for real in reals.values() {
                    Self::accumulate(&mut errors, self.ipvs.add_real(virt, real));
                }
                continue;
            };

            if existing.scheduler != virt.scheduler {
                Self::accumulate(&mut errors, self.ipvs.update_virtual(virt));
            }

            for (real_id, real) in existing_reals {
                if !reals.contains_key(real_id) {
                    debug!("Removing real server {real_id} from {id}");
                    Self::accumulate(&mut errors, self.ipvs.delete_real(virt, real));
                }
            }
            for (real_id, real) in reals {
                match existing_reals.get(real_id) {
                    None => {
                        debug!("Adding real server {real_id} to {id}");
                        Self::accumulate(&mut errors, self.ipvs.add_real(virt, real));
                    }
                    Some(existing) if existing != real => {
                        Self::accumulate(&mut errors, self.ipvs.update_real(virt, real));
                    }
                    Some(_) => {}
                }
            }
        }

        if !errors.is_empty() {
            return Err(Error::IO(errors.join("; ")));
        }
        Ok(())
    }

    /// Records an operation failure, ignoring benign races with the kernel
    /// view (already-exists on add, not-found on delete).
    fn accumulate(errors: &mut Vec<String>, result: Result<()>) {
        match result {
            Ok(()) | Err(Error::Exists(_)) | Err(Error::NotFound(_)) => {}
            Err(err) => errors.push(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{destination, service};

    /// After every reconciliation pass, the kernel table must equal the
    /// catalog projection.
    fn assert_converged(ipvs: &MemoryIpvs, catalog: &Catalog) {
        let want: Vec<(Virtual, Vec<Real>)> = catalog
            .services()
            .iter()
            .map(|s| (Virtual::from(s), s.destinations.iter().map(Real::from).collect()))
            .collect();
        let mut have = ipvs.list().unwrap();
        for (_, reals) in have.iter_mut() {
            reals.sort_by_key(|r| r.id());
        }
        let mut want = want;
        for (_, reals) in want.iter_mut() {
            reals.sort_by_key(|r| r.id());
        }
        assert_eq!(have, want);
    }

    #[test]
    fn full_pass() {
        let ipvs = Arc::new(MemoryIpvs::new());
        let reconciler = Reconciler::new(ipvs.clone());
        let mut catalog = Catalog::new();

        let web = service("web", "10.0.0.1", 80);
        let api = service("api", "10.0.0.2", 443);
        catalog.add_service(web.clone());
        catalog.add_service(api.clone());
        catalog.add_destination(destination("web-1", "192.168.1.10", 8080, &web));

        reconciler.sync(&catalog).unwrap();
        assert_converged(&ipvs, &catalog);

        // Removing a service removes its virtual server.
        catalog.delete_service(&api);
        reconciler.sync(&catalog).unwrap();
        assert_converged(&ipvs, &catalog);
    }

    #[test]
    fn heals_tampering() {
        let ipvs = Arc::new(MemoryIpvs::new());
        let reconciler = Reconciler::new(ipvs.clone());
        let mut catalog = Catalog::new();

        let web = service("web", "10.0.0.1", 80);
        catalog.add_service(web.clone());
        catalog.add_destination(destination("web-1", "192.168.1.10", 8080, &web));
        reconciler.sync(&catalog).unwrap();

        // Remove the virtual server behind the reconciler's back, and add a
        // rogue one. The next pass must repair both.
        let virt = Virtual::from(&catalog.get_service("web").unwrap());
        ipvs.delete_virtual(&virt).unwrap();
        let rogue = Virtual {
            host: "10.9.9.9".to_string(),
            port: 9999,
            protocol: crate::catalog::Protocol::Tcp,
            scheduler: "rr".to_string(),
        };
        ipvs.add_virtual(&rogue).unwrap();

        reconciler.sync(&catalog).unwrap();
        assert_converged(&ipvs, &catalog);
    }

    #[test]
    fn updates_weight() {
        let ipvs = Arc::new(MemoryIpvs::new());
        let reconciler = Reconciler::new(ipvs.clone());
        let mut catalog = Catalog::new();

        let web = service("web", "10.0.0.1", 80);
        catalog.add_service(web.clone());
        let mut dst = destination("web-1", "192.168.1.10", 8080, &web);
        catalog.add_destination(dst.clone());
        reconciler.sync(&catalog).unwrap();

        dst.weight = 10;
        catalog.add_destination(dst.clone());
        reconciler.sync(&catalog).unwrap();

        let reals = &ipvs.list().unwrap()[0].1;
        assert_eq!(reals[0].weight, 10);
    }
}
