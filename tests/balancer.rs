//! In-process cluster tests: each balancer node runs with its own in-memory
//! dataplane engines, real TCP consensus, and real UDP gossip on loopback.

use ballast::catalog::{Destination, Mode, Protocol, Service};
use ballast::cluster::{Config, Gossip};
use ballast::dataplane::{Interface as _, Ipvs as _, MemoryInterface, MemoryIpvs};
use ballast::error::Error;
use ballast::Balancer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout for cluster convergence.
const TIMEOUT: Duration = Duration::from_secs(15);

/// A balancer node with inspectable dataplane engines.
struct TestNode {
    balancer: Balancer,
    ipvs: Arc<MemoryIpvs>,
    iface: Arc<MemoryInterface>,
}

impl TestNode {
    /// Runs a node on loopback with ephemeral ports.
    fn run(name: &str, bootstrap: bool, join: Vec<String>, vip_range: &str) -> Self {
        let ipvs = Arc::new(MemoryIpvs::new());
        let iface = Arc::new(MemoryInterface::new());
        let config = Config {
            name: name.to_string(),
            listen_raft: "127.0.0.1:0".to_string(),
            advertise_raft: None,
            listen_gossip: "127.0.0.1:0".to_string(),
            join,
            bootstrap,
            data_dir: None,
            provider: "none".to_string(),
            vip_range: vip_range.to_string(),
            stats_interval: Duration::ZERO,
        };
        let balancer = Balancer::new(config, ipvs.clone(), iface.clone()).expect("balancer failed");
        Self { balancer, ipvs, iface }
    }

    /// The gossip address other nodes join through.
    fn gossip_addr(&self) -> String {
        self.balancer.local_member().addr.to_string()
    }

    /// Polls until the predicate holds or the timeout expires.
    #[track_caller]
    fn wait_for<F: Fn(&Self) -> bool>(&self, what: &str, predicate: F) {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if predicate(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("timed out waiting for {what}");
    }
}

fn service(name: &str, port: u16) -> Service {
    Service {
        name: name.to_string(),
        host: String::new(),
        port,
        protocol: Protocol::Tcp,
        scheduler: "rr".to_string(),
        destinations: Vec::new(),
    }
}

fn destination(name: &str, host: &str, port: u16) -> Destination {
    Destination {
        name: name.to_string(),
        host: host.to_string(),
        port,
        weight: 1,
        mode: Mode::Nat,
        service_id: String::new(),
    }
}

/// Bootstraps a single node, adds a service and destination, and checks the
/// dataplane at every step: the VIP is bound on the interface and the
/// virtual server table matches the catalog.
#[test]
fn single_node_lifecycle() {
    let node = TestNode::run("lb-1", true, vec![], "10.0.0.0/29");
    node.wait_for("leadership", |n| n.balancer.is_leader());

    node.balancer.add_service(service("web", 80)).unwrap();
    let web = node.balancer.get_service("web").unwrap();
    assert_eq!(web.host, "10.0.0.1");
    assert_eq!(node.iface.vips().unwrap(), vec!["10.0.0.1"]);
    let table = node.ipvs.list().unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].0.id(), "10.0.0.1:80/tcp");

    node.balancer.add_destination("web", destination("web-1", "192.168.1.10", 8080)).unwrap();
    let table = node.ipvs.list().unwrap();
    assert_eq!(table[0].1.len(), 1);
    assert_eq!(table[0].1[0].host, "192.168.1.10");

    node.balancer.delete_service("web").unwrap();
    assert!(node.ipvs.list().unwrap().is_empty());
    assert!(node.iface.vips().unwrap().is_empty());
    assert!(matches!(node.balancer.get_service("web"), Err(Error::NotFound(_))));

    node.balancer.shutdown();
}

/// A /30 pool has two usable addresses; the third service is refused before
/// anything is committed.
#[test]
fn pool_exhaustion() {
    let node = TestNode::run("lb-1", true, vec![], "10.0.0.0/30");
    node.wait_for("leadership", |n| n.balancer.is_leader());

    node.balancer.add_service(service("web", 80)).unwrap();
    node.balancer.add_service(service("api", 443)).unwrap();
    assert!(matches!(node.balancer.add_service(service("extra", 8080)), Err(Error::Exhausted(_))));
    assert_eq!(node.balancer.get_services().unwrap().len(), 2);
    assert_eq!(node.iface.vips().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);

    node.balancer.shutdown();
}

/// A node joining mid-flight is added as a consensus peer by the leader,
/// replays the catalog, and programs its own dataplane, without binding any
/// VIPs (it is a follower).
#[test]
fn joining_node_replicates() {
    let first = TestNode::run("lb-1", true, vec![], "10.0.0.0/29");
    first.wait_for("leadership", |n| n.balancer.is_leader());
    first.balancer.add_service(service("web", 80)).unwrap();

    let second = TestNode::run("lb-2", false, vec![first.gossip_addr()], "10.0.0.0/29");
    second.wait_for("catalog replication", |n| n.balancer.get_service("web").is_ok());
    second.wait_for("dataplane reconciliation", |n| n.ipvs.list().unwrap().len() == 1);
    assert_eq!(second.ipvs.list().unwrap()[0].0.id(), "10.0.0.1:80/tcp");
    assert!(second.iface.vips().unwrap().is_empty());

    // New services replicate to both nodes.
    first.balancer.add_service(service("api", 443)).unwrap();
    second.wait_for("second service", |n| n.balancer.get_service("api").is_ok());

    second.balancer.shutdown();
    first.balancer.shutdown();
}

/// When the leader shuts down, a surviving node takes over leadership and
/// binds the VIPs, within the election timeout.
#[test]
fn leader_failover_moves_vips() {
    let first = TestNode::run("lb-1", true, vec![], "10.0.0.0/29");
    first.wait_for("leadership", |n| n.balancer.is_leader());

    let second = TestNode::run("lb-2", false, vec![first.gossip_addr()], "10.0.0.0/29");
    let third = TestNode::run("lb-3", false, vec![first.gossip_addr()], "10.0.0.0/29");
    second.wait_for("cluster join", |n| n.balancer.status().map(|s| s.members.len()) == Ok(3));

    first.balancer.add_service(service("web", 80)).unwrap();
    second.wait_for("catalog replication", |n| n.balancer.get_service("web").is_ok());
    third.wait_for("catalog replication", |n| n.balancer.get_service("web").is_ok());
    assert_eq!(first.iface.vips().unwrap(), vec!["10.0.0.1"]);

    first.balancer.shutdown();

    let deadline = Instant::now() + TIMEOUT;
    let survivors = [&second, &third];
    let new_leader = loop {
        if let Some(node) = survivors.iter().find(|n| n.balancer.is_leader()) {
            break node;
        }
        assert!(Instant::now() < deadline, "no new leader elected");
        std::thread::sleep(Duration::from_millis(100));
    };

    new_leader.wait_for("VIP takeover", |n| n.iface.vips().unwrap() == vec!["10.0.0.1"]);
    let other = survivors.iter().find(|n| !n.balancer.is_leader()).unwrap();
    assert!(other.iface.vips().unwrap().is_empty());

    second.balancer.shutdown();
    third.balancer.shutdown();
}

/// A back-end agent leaving the gossip cluster takes its destination with
/// it.
#[test]
fn agent_leave_removes_destination() {
    let node = TestNode::run("lb-1", true, vec![], "10.0.0.0/29");
    node.wait_for("leadership", |n| n.balancer.is_leader());

    node.balancer.add_service(service("web", 80)).unwrap();
    node.balancer.add_destination("web", destination("web-1", "192.168.1.10", 8080)).unwrap();

    let mut tags = BTreeMap::new();
    tags.insert("role".to_string(), "agent".to_string());
    let (agent, _events) =
        Gossip::new("web-1".to_string(), "127.0.0.1:0".parse().unwrap(), tags).unwrap();
    agent.join(&[node.gossip_addr()]).unwrap();

    // Wait for the agent to be visible, then leave.
    node.wait_for("agent visible", |_| agent.members().len() == 2);
    agent.leave().unwrap();

    node.wait_for("destination removed", |n| {
        n.balancer.get_service("web").map(|s| s.destinations.is_empty()) == Ok(true)
    });
    node.wait_for("dataplane converged", |n| n.ipvs.list().unwrap()[0].1.is_empty());

    node.balancer.shutdown();
}
