//! VIP providers assign a virtual IP to each new service and reconcile the
//! addresses bound on the balancer's network interface with the catalog.
//! The default "none" provider hands out addresses from a configured CIDR
//! range; the trait is the seam for cloud environments where the VIP must
//! be obtained from an external API instead.

mod none;
mod pool;

pub use none::NoneProvider;
pub use pool::Pool;

use crate::catalog::{Catalog, Service};
use crate::dataplane::Interface;
use crate::errinput;
use crate::error::Result;

use std::sync::Arc;

pub trait Provider: Send + Sync {
    /// Picks an address that is not in use by any service in the catalog and
    /// writes it into the service's host field. Errors with Exhausted when
    /// the pool has no free address left.
    fn allocate_vip(&self, service: &mut Service, catalog: &Catalog) -> Result<()>;

    /// Releases a service's address. Advisory: allocation reads live state,
    /// so the default provider has nothing to do here. A provider backed by
    /// a non-idempotent external allocator must release explicitly.
    fn release_vip(&self, service: &Service) -> Result<()>;

    /// Brings the addresses bound on the interface into agreement with the
    /// set of service hosts in the catalog.
    fn sync_vips(&self, catalog: &Catalog) -> Result<()>;
}

/// Creates a provider by name. "none" (or blank) is the built-in CIDR pool
/// provider.
pub fn new(name: &str, vip_range: &str, iface: Arc<dyn Interface>) -> Result<Arc<dyn Provider>> {
    match name {
        "none" | "" => Ok(Arc::new(NoneProvider::new(vip_range, iface)?)),
        name => errinput!("unknown provider {name}"),
    }
}
