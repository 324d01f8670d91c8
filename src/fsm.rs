//! The replicated state machine: applies committed commands to the catalog
//! and couples every apply to a dataplane reconciliation pass through a
//! rendezvous channel with the coordinator. The back-pressure is deliberate:
//! a command is not considered applied until the local kernel state has been
//! reconciled, so "committed" implies "locally realized".

use crate::catalog::{Catalog, Service, SharedCatalog};
use crate::error::Result;
use crate::raft;

use crossbeam::channel::{Receiver, Sender};
use log::info;
use serde::de::Error as _;
use serde_derive::{Deserialize, Serialize};

/// A catalog operation, the unit of replication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    AddService = 0,
    DelService = 1,
    AddDestination = 2,
    DelDestination = 3,
}

// Op is encoded as its integer value, matching the wire format of the
// command record.
impl serde::Serialize for Op {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> serde::Deserialize<'de> for Op {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Op::AddService),
            1 => Ok(Op::DelService),
            2 => Ok(Op::AddDestination),
            3 => Ok(Op::DelDestination),
            op => Err(D::Error::custom(format!("invalid command op {op}"))),
        }
    }
}

/// A replicated command: an operation carrying exactly one service or one
/// destination. Encoded as JSON with named fields, so log records are
/// self-describing and tolerate unknown fields for forward compatibility.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "Op")]
    pub op: Op,
    #[serde(rename = "Service", default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(rename = "Destination", default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<crate::catalog::Destination>,
}

impl Command {
    /// A command adding or replacing a service.
    pub fn add_service(service: Service) -> Self {
        Self { op: Op::AddService, service: Some(service), destination: None }
    }

    /// A command deleting a service and its destinations.
    pub fn del_service(service: Service) -> Self {
        Self { op: Op::DelService, service: Some(service), destination: None }
    }

    /// A command adding or replacing a destination.
    pub fn add_destination(destination: crate::catalog::Destination) -> Self {
        Self { op: Op::AddDestination, service: None, destination: Some(destination) }
    }

    /// A command deleting a destination.
    pub fn del_destination(destination: crate::catalog::Destination) -> Self {
        Self { op: Op::DelDestination, service: None, destination: Some(destination) }
    }

    /// Encodes the command to its wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A reconciliation request: the coordinator replies with the outcome of the
/// reconciliation pass. One rendezvous per apply.
pub type ReconcileRequest = Sender<Result<()>>;

/// The state machine driven by the consensus log. It owns the single-writer
/// side of the shared catalog; all other components only read it.
pub struct Fsm {
    catalog: SharedCatalog,
    reconcile_tx: Sender<ReconcileRequest>,
}

impl Fsm {
    /// Creates a state machine over the shared catalog, returning the
    /// receiving end of the reconciliation channel for the coordinator. The
    /// channel has a queue depth of one: each apply blocks until its pass
    /// completes.
    pub fn new(catalog: SharedCatalog) -> (Self, Receiver<ReconcileRequest>) {
        let (reconcile_tx, reconcile_rx) = crossbeam::channel::bounded(1);
        (Self { catalog, reconcile_tx }, reconcile_rx)
    }

    /// Mutates the catalog with a decoded command. Consistency violations
    /// are programming errors: the command was already committed, so this
    /// node must halt and resynchronize rather than diverge.
    fn mutate(catalog: &mut Catalog, command: Command) {
        match command {
            Command { op: Op::AddService, service: Some(service), .. } => {
                let duplicate = catalog
                    .services()
                    .iter()
                    .any(|s| s.host == service.host && s.id() != service.id());
                if duplicate {
                    panic!("duplicate VIP allocation for {}", service.host);
                }
                catalog.add_service(service);
            }
            Command { op: Op::DelService, service: Some(service), .. } => {
                // Destinations are nested in their service: delete them too,
                // so no orphan is observable after the apply boundary.
                for destination in catalog.services().iter().flat_map(|s| &s.destinations) {
                    if destination.service_id == service.id() {
                        catalog.delete_destination(destination);
                    }
                }
                catalog.delete_service(&service);
            }
            Command { op: Op::AddDestination, destination: Some(destination), .. } => {
                if !catalog.contains_service(&destination.service_id) {
                    panic!("orphaned destination {} for unknown service {}", destination.name, destination.service_id);
                }
                catalog.add_destination(destination);
            }
            Command { op: Op::DelDestination, destination: Some(destination), .. } => {
                catalog.delete_destination(&destination);
            }
            command => panic!("malformed command {command:?}"),
        }
    }

    /// Publishes a reconciliation request and blocks until the coordinator
    /// acknowledges it. The outcome is the error of the reconciliation pass.
    fn reconcile(&self) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        self.reconcile_tx.send(reply_tx)?;
        reply_rx.recv()?
    }
}

impl raft::State for Fsm {
    fn apply(&mut self, command: Vec<u8>) -> Result<Vec<u8>> {
        // A command that doesn't decode is log corruption, not a client
        // error: it was committed, so halt instead of diverging.
        let command: Command =
            serde_json::from_slice(&command).expect("invalid command in log");
        info!("Applying {command:?}");

        {
            let mut catalog = self.catalog.write()?;
            Self::mutate(&mut catalog, command);
        }

        // The apply result is the reconciliation outcome, propagated to the
        // client that submitted the command.
        self.reconcile()?;
        Ok(Vec::new())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        info!("Snapshotting catalog");
        let services = self.catalog.read()?.services();
        Ok(serde_json::to_vec(&services)?)
    }

    fn restore(&mut self, data: Vec<u8>) -> Result<()> {
        info!("Restoring catalog from snapshot");
        let services: Vec<Service> = serde_json::from_slice(&data)?;
        {
            let mut catalog = self.catalog.write()?;
            catalog.clear();
            for mut service in services {
                let destinations = std::mem::take(&mut service.destinations);
                catalog.add_service(service);
                for destination in destinations {
                    catalog.add_destination(destination);
                }
            }
        }
        self.reconcile()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{destination, service};
    use crate::raft::State as _;

    /// Spawns a reconciler stub that acknowledges every request with the
    /// given responses, in order, then Ok.
    fn ack_with(reconcile_rx: Receiver<ReconcileRequest>, mut responses: Vec<Result<()>>) {
        std::thread::spawn(move || {
            responses.reverse();
            while let Ok(reply_tx) = reconcile_rx.recv() {
                let _ = reply_tx.send(responses.pop().unwrap_or(Ok(())));
            }
        });
    }

    fn apply(fsm: &mut Fsm, command: Command) -> Result<Vec<u8>> {
        fsm.apply(command.encode().unwrap())
    }

    #[test]
    fn apply_mutates_and_reconciles() {
        let catalog = Catalog::new_shared();
        let (mut fsm, reconcile_rx) = Fsm::new(catalog.clone());
        ack_with(reconcile_rx, vec![]);

        let web = service("web", "10.0.0.1", 80);
        apply(&mut fsm, Command::add_service(web.clone())).unwrap();
        apply(&mut fsm, Command::add_destination(destination("web-1", "192.168.1.10", 8080, &web)))
            .unwrap();

        let got = catalog.read().unwrap().get_service("web").unwrap();
        assert_eq!(got.destinations.len(), 1);

        // Deleting the service deletes its destinations.
        apply(&mut fsm, Command::del_service(web)).unwrap();
        let catalog = catalog.read().unwrap();
        assert!(catalog.get_service("web").is_err());
        assert!(catalog.get_destination("web-1").is_err());
    }

    #[test]
    fn reconciliation_error_propagates() {
        let catalog = Catalog::new_shared();
        let (mut fsm, reconcile_rx) = Fsm::new(catalog.clone());
        ack_with(reconcile_rx, vec![Err(crate::error::Error::IO("ipvs down".into()))]);

        let result = apply(&mut fsm, Command::add_service(service("web", "10.0.0.1", 80)));
        assert_eq!(result, Err(crate::error::Error::IO("ipvs down".into())));

        // The catalog was still mutated; replicas must not diverge.
        assert!(catalog.read().unwrap().get_service("web").is_ok());
    }

    #[test]
    #[should_panic(expected = "orphaned destination")]
    fn orphaned_destination_panics() {
        let catalog = Catalog::new_shared();
        let (mut fsm, reconcile_rx) = Fsm::new(catalog);
        ack_with(reconcile_rx, vec![]);

        let ghost = service("ghost", "10.0.0.9", 80);
        let _ = apply(&mut fsm, Command::add_destination(destination("d", "192.168.1.1", 80, &ghost)));
    }

    #[test]
    #[should_panic(expected = "duplicate VIP allocation")]
    fn duplicate_vip_panics() {
        let catalog = Catalog::new_shared();
        let (mut fsm, reconcile_rx) = Fsm::new(catalog);
        ack_with(reconcile_rx, vec![]);

        let _ = apply(&mut fsm, Command::add_service(service("web", "10.0.0.1", 80)));
        let _ = apply(&mut fsm, Command::add_service(service("api", "10.0.0.1", 443)));
    }

    /// A snapshot followed by a restore on an empty state machine yields an
    /// equal catalog.
    #[test]
    fn snapshot_restore_roundtrip() {
        let catalog = Catalog::new_shared();
        let (mut fsm, reconcile_rx) = Fsm::new(catalog.clone());
        ack_with(reconcile_rx, vec![]);

        let web = service("web", "10.0.0.1", 80);
        apply(&mut fsm, Command::add_service(web.clone())).unwrap();
        apply(&mut fsm, Command::add_destination(destination("web-1", "192.168.1.10", 8080, &web)))
            .unwrap();
        let data = fsm.snapshot().unwrap();

        let restored = Catalog::new_shared();
        let (mut fsm, reconcile_rx) = Fsm::new(restored.clone());
        ack_with(reconcile_rx, vec![]);
        // Restore clears any existing contents first.
        restored.write().unwrap().add_service(service("stale", "10.0.0.9", 1));
        fsm.restore(data).unwrap();

        assert_eq!(*catalog.read().unwrap(), *restored.read().unwrap());
    }

    /// The wire format is self-describing JSON with an integer op and named
    /// fields, and tolerates unknown fields.
    #[test]
    fn command_wire_format() {
        let command = Command::add_service(service("web", "10.0.0.1", 80));
        let json: serde_json::Value = serde_json::from_slice(&command.encode().unwrap()).unwrap();
        assert_eq!(json["Op"], 0);
        assert_eq!(json["Service"]["name"], "web");
        assert!(json.get("Destination").is_none());

        let mut extended = json;
        extended["FutureField"] = "ignored".into();
        let decoded: Command = serde_json::from_value(extended).unwrap();
        assert_eq!(decoded, command);
    }
}
