//! The catalog is the in-memory model of virtual services and their real
//! destinations. It is the authoritative state replicated across the cluster:
//! every mutation arrives as a committed command through the state machine,
//! and every node projects its catalog onto the local kernel dataplane.

use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// A transport protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            s => Err(Error::InvalidInput(format!("invalid protocol {s}"))),
        }
    }
}

/// A packet forwarding method for a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Masquerading (NAT).
    Nat,
    /// IP-in-IP tunneling.
    Tunnel,
    /// Direct routing.
    Route,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Nat
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Nat => write!(f, "nat"),
            Mode::Tunnel => write!(f, "tunnel"),
            Mode::Route => write!(f, "route"),
        }
    }
}

/// A virtual service: a VIP, port, and protocol fronting a set of
/// destinations. The host is blank at submission time and assigned by the
/// VIP provider before the add command is proposed, so the identity is only
/// valid once the service reaches the replicated log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// The logical service name, unique per service.
    pub name: String,
    /// The virtual IP fronting this service.
    pub host: String,
    /// The transport port.
    pub port: u16,
    /// The transport protocol.
    pub protocol: Protocol,
    /// The kernel scheduling method, e.g. "rr", "wrr", or "lc". Passed to the
    /// dataplane verbatim.
    pub scheduler: String,
    /// The service's destinations. Populated on reads by scanning the
    /// destination map; never authoritative here.
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

impl Service {
    /// Returns the service identity, derived from the assigned VIP, port, and
    /// protocol so that replicas converge on the same key.
    pub fn id(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.protocol)
    }
}

/// A real destination behind a virtual service. Its lifetime is nested in
/// the service: deleting the service deletes its destinations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// The destination name, typically the back-end agent's node name.
    pub name: String,
    /// The real server IP.
    pub host: String,
    /// The real server port.
    pub port: u16,
    /// The scheduling weight.
    pub weight: i32,
    /// The packet forwarding method.
    pub mode: Mode,
    /// The owning service's identity.
    pub service_id: String,
}

impl Destination {
    /// Returns the destination identity within its service.
    pub fn id(&self) -> String {
        format!("{}/{}:{}", self.service_id, self.host, self.port)
    }
}

/// A catalog shared between the state machine (sole writer) and readers.
pub type SharedCatalog = Arc<RwLock<Catalog>>;

/// The catalog of services and destinations, as two maps keyed by the
/// composite identities. All operations are idempotent: adding an existing
/// id overwrites it, and deleting a missing id is a no-op. The catalog does
/// not enforce cross-entity invariants (e.g. orphaned destinations); that is
/// the state machine's responsibility, by ordering commands correctly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    services: BTreeMap<String, Service>,
    destinations: BTreeMap<String, Destination>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty shared catalog.
    pub fn new_shared() -> SharedCatalog {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Returns all services, each populated with its destinations.
    pub fn services(&self) -> Vec<Service> {
        self.services
            .values()
            .map(|service| {
                let mut service = service.clone();
                service.destinations = self.destinations_of(&service.id());
                service
            })
            .collect()
    }

    /// Returns the named service with its destinations populated.
    pub fn get_service(&self, name: &str) -> Result<Service> {
        let Some(service) = self.services.values().find(|s| s.name == name) else {
            return Err(Error::NotFound(format!("service {name}")));
        };
        let mut service = service.clone();
        service.destinations = self.destinations_of(&service.id());
        Ok(service)
    }

    /// Returns the named destination.
    pub fn get_destination(&self, name: &str) -> Result<Destination> {
        self.destinations
            .values()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("destination {name}")))
    }

    /// Adds a service, replacing any existing service with the same identity.
    pub fn add_service(&mut self, mut service: Service) {
        service.destinations = Vec::new();
        self.services.insert(service.id(), service);
    }

    /// Deletes a service, if it exists. Does not touch its destinations.
    pub fn delete_service(&mut self, service: &Service) {
        self.services.remove(&service.id());
    }

    /// Adds a destination, replacing any existing destination with the same
    /// identity.
    pub fn add_destination(&mut self, destination: Destination) {
        self.destinations.insert(destination.id(), destination);
    }

    /// Deletes a destination, if it exists.
    pub fn delete_destination(&mut self, destination: &Destination) {
        self.destinations.remove(&destination.id());
    }

    /// Returns true if the service identity is present.
    pub fn contains_service(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }

    /// Removes everything. Used when restoring a snapshot.
    pub fn clear(&mut self) {
        self.services.clear();
        self.destinations.clear();
    }

    /// Returns the destinations belonging to a service.
    fn destinations_of(&self, service_id: &str) -> Vec<Destination> {
        self.destinations.values().filter(|d| d.service_id == service_id).cloned().collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn service(name: &str, host: &str, port: u16) -> Service {
        Service {
            name: name.to_string(),
            host: host.to_string(),
            port,
            protocol: Protocol::Tcp,
            scheduler: "rr".to_string(),
            destinations: Vec::new(),
        }
    }

    pub fn destination(name: &str, host: &str, port: u16, service: &Service) -> Destination {
        Destination {
            name: name.to_string(),
            host: host.to_string(),
            port,
            weight: 1,
            mode: Mode::Nat,
            service_id: service.id(),
        }
    }

    #[test]
    fn service_identity() {
        let web = service("web", "10.0.0.1", 80);
        assert_eq!(web.id(), "10.0.0.1:80/tcp");

        let dst = destination("web-1", "192.168.1.10", 8080, &web);
        assert_eq!(dst.id(), "10.0.0.1:80/tcp/192.168.1.10:8080");
    }

    #[test]
    fn get_populates_destinations() {
        let mut catalog = Catalog::new();
        let web = service("web", "10.0.0.1", 80);
        catalog.add_service(web.clone());
        catalog.add_destination(destination("web-1", "192.168.1.10", 8080, &web));
        catalog.add_destination(destination("web-2", "192.168.1.11", 8080, &web));

        let got = catalog.get_service("web").unwrap();
        assert_eq!(got.destinations.len(), 2);

        let all = catalog.services();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].destinations.len(), 2);
    }

    #[test]
    fn not_found() {
        let catalog = Catalog::new();
        assert_eq!(catalog.get_service("web"), Err(Error::NotFound("service web".to_string())));
        assert_eq!(
            catalog.get_destination("web-1"),
            Err(Error::NotFound("destination web-1".to_string()))
        );
    }

    /// Adding an existing id overwrites it, and deleting a missing id is a
    /// no-op; both leave an equivalent catalog unchanged.
    #[test]
    fn idempotence() {
        let mut catalog = Catalog::new();
        let web = service("web", "10.0.0.1", 80);
        catalog.add_service(web.clone());
        let before = catalog.clone();

        catalog.add_service(web.clone());
        assert_eq!(catalog, before);

        catalog.delete_service(&service("api", "10.0.0.2", 443));
        assert_eq!(catalog, before);

        catalog.delete_destination(&destination("web-1", "192.168.1.10", 8080, &web));
        assert_eq!(catalog, before);
    }

    #[test]
    fn delete_service_keeps_destinations() {
        // Cross-entity cleanup is the state machine's job, not the catalog's.
        let mut catalog = Catalog::new();
        let web = service("web", "10.0.0.1", 80);
        catalog.add_service(web.clone());
        catalog.add_destination(destination("web-1", "192.168.1.10", 8080, &web));
        catalog.delete_service(&web);
        assert!(catalog.get_destination("web-1").is_ok());
    }
}
