use super::gossip::{Event, Gossip, Member, Role, Tags};
use crate::catalog::{Catalog, Destination, Service, SharedCatalog};
use crate::dataplane::{Interface, Ipvs, Reconciler, Virtual};
use crate::error::{Error, Result};
use crate::fsm::{Command, Fsm, ReconcileRequest};
use crate::provider::{self, Provider};
use crate::raft;
use crate::storage;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long a leaving node waits to be removed from the consensus peer set
/// by the new leader.
const LEAVE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The poll interval while waiting for removal during a graceful leave.
const LEAVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The log compaction threshold (garbage fraction) and minimum size.
const COMPACT_FRACTION: f64 = 0.25;
const COMPACT_MIN_BYTES: u64 = 1024 * 1024;

/// Balancer configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The node name, unique in the cluster. Back-end agents use their node
    /// name to tie their gossip presence to a destination.
    pub name: String,
    /// The consensus listen address.
    pub listen_raft: String,
    /// The advertised consensus address, when the listen address is not
    /// dialable by peers (e.g. 0.0.0.0). Defaults to the listen address.
    pub advertise_raft: Option<String>,
    /// The gossip listen address.
    pub listen_gossip: String,
    /// Gossip addresses of existing cluster members to join on startup.
    pub join: Vec<String>,
    /// Allow single-node self-election when at most the local node is known.
    pub bootstrap: bool,
    /// The data directory, holding peers.json, raft.db, and snapshots/.
    /// None keeps all state in memory (development mode).
    pub data_dir: Option<PathBuf>,
    /// The VIP provider name.
    pub provider: String,
    /// The VIP pool in CIDR notation.
    pub vip_range: String,
    /// The statistics interval. Zero disables the ticker.
    pub stats_interval: Duration,
}

/// The balancer coordinator. Composes the consensus server, the gossip
/// node, the VIP provider, and the dataplane reconciler, and owns the
/// local effects of leadership: only the elected leader binds VIPs on its
/// interface, while every node programs its own kernel table.
pub struct Balancer {
    catalog: SharedCatalog,
    provider: Arc<dyn Provider>,
    gossip: Gossip,
    members: Arc<raft::Members>,
    raft: Option<raft::Client>,
    is_leader: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
    stats_shutdown: Option<Sender<()>>,
}

impl Balancer {
    /// Creates and starts a balancer node. The dataplane engines are
    /// injected: the kernel-backed implementations live outside this crate,
    /// and tests use the in-memory ones.
    pub fn new(config: Config, ipvs: Arc<dyn Ipvs>, iface: Arc<dyn Interface>) -> Result<Self> {
        let catalog = Catalog::new_shared();
        let provider = provider::new(&config.provider, &config.vip_range, iface.clone())?;
        let reconciler = Reconciler::new(ipvs.clone());
        let is_leader = Arc::new(AtomicBool::new(false));
        let vip_mutex = Arc::new(Mutex::new(()));
        let mut threads = Vec::new();

        // Flush any stale VIP bindings from a previous run before anything
        // else happens. A broken interface is fatal at startup.
        iface.flush()?;

        // The state machine and its reconciliation channel. The watcher must
        // run before the consensus node starts, since restoring a snapshot
        // at startup already publishes a reconciliation request.
        let (fsm, reconcile_rx) = Fsm::new(catalog.clone());
        {
            let (catalog, provider, reconciler) = (catalog.clone(), provider.clone(), Arc::new(reconciler));
            let is_leader = is_leader.clone();
            threads.push(std::thread::spawn(move || {
                Self::state_watcher(reconcile_rx, catalog, provider, reconciler, is_leader)
            }));
        }

        // The consensus server. The local node identity is the address
        // peers dial.
        let listener = TcpListener::bind(&config.listen_raft)?;
        let raft_addr = match &config.advertise_raft {
            Some(addr) => addr.clone(),
            None => listener.local_addr()?.to_string(),
        };
        let raft_port = raft_addr.parse::<SocketAddr>()?.port();

        let members = Arc::new(raft::Members::load(
            config.data_dir.as_ref().map(|dir| dir.join("peers.json")),
            raft_addr.clone(),
            Vec::new(),
        )?);
        let bootstrap = config.bootstrap && members.len() <= 1;
        if bootstrap {
            info!("Enabling single-node mode");
        }

        let engine: Box<dyn storage::Engine> = match &config.data_dir {
            Some(dir) => Box::new(storage::File::new_compact(
                dir.join("raft.db"),
                COMPACT_FRACTION,
                COMPACT_MIN_BYTES,
            )?),
            None => Box::new(storage::Memory::new()),
        };
        let raft_log = raft::Log::new(engine)?;
        let snapshots =
            raft::SnapshotStore::new(config.data_dir.as_ref().map(|dir| dir.join("snapshots")))?;

        let (leader_tx, leader_rx) = crossbeam::channel::unbounded();
        let (client_tx, client_rx) = crossbeam::channel::unbounded();
        let server = raft::Server::new(
            members.clone(),
            raft_log,
            Box::new(fsm),
            snapshots,
            raft::Options::default(),
            bootstrap,
        )?;
        {
            let is_leader = is_leader.clone();
            threads.push(std::thread::spawn(move || {
                if let Err(err) = server.serve(listener, client_rx, leader_tx, is_leader) {
                    error!("Consensus server failed: {err}");
                }
            }));
        }
        let raft_client = raft::Client::new(client_tx);

        // The leadership watcher: flush-then-rebind on winning, flush on
        // losing, serialized so transitions can't interleave.
        {
            let (catalog, provider, iface) = (catalog.clone(), provider.clone(), iface.clone());
            threads.push(std::thread::spawn(move || {
                Self::leader_watcher(leader_rx, catalog, provider, iface, vip_mutex)
            }));
        }

        // The gossip node and membership event dispatcher.
        let mut tags = BTreeMap::new();
        tags.insert("role".to_string(), "balancer".to_string());
        tags.insert("raft-port".to_string(), raft_port.to_string());
        let (gossip, event_rx) =
            Gossip::new(config.name.clone(), config.listen_gossip.parse()?, tags)?;
        {
            let raft = raft_client.clone();
            let (catalog, is_leader) = (catalog.clone(), is_leader.clone());
            let raft_addr = raft_addr.clone();
            threads.push(std::thread::spawn(move || {
                Self::dispatcher(event_rx, raft, catalog, is_leader, raft_addr)
            }));
        }
        if !config.join.is_empty() {
            info!("Joining gossip cluster via {:?}", config.join);
            gossip.join(&config.join)?;
        }

        // The statistics ticker, if enabled.
        let mut stats_shutdown = None;
        if !config.stats_interval.is_zero() {
            let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(0);
            stats_shutdown = Some(shutdown_tx);
            let (catalog, ipvs) = (catalog.clone(), ipvs.clone());
            let interval = config.stats_interval;
            threads.push(std::thread::spawn(move || {
                Self::stats_ticker(interval, shutdown_rx, catalog, ipvs)
            }));
        }

        Ok(Self {
            catalog,
            provider,
            gossip,
            members,
            raft: Some(raft_client),
            is_leader,
            threads,
            stats_shutdown,
        })
    }

    /// Returns true if this node currently holds leadership.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Returns the local consensus address.
    pub fn raft_addr(&self) -> &str {
        self.members.local()
    }

    /// Returns the local gossip member.
    pub fn local_member(&self) -> Member {
        self.gossip.local()
    }

    /// Returns all services with their destinations.
    pub fn get_services(&self) -> Result<Vec<Service>> {
        Ok(self.catalog.read()?.services())
    }

    /// Returns the named service with its destinations.
    pub fn get_service(&self, name: &str) -> Result<Service> {
        self.catalog.read()?.get_service(name)
    }

    /// Adds a service: allocates a VIP from the provider, then submits the
    /// command for replication. The call returns once the command has been
    /// committed, applied, and reconciled on this node.
    pub fn add_service(&self, mut service: Service) -> Result<()> {
        {
            let catalog = self.catalog.read()?;
            self.provider.allocate_vip(&mut service, &catalog)?;
        }
        self.submit(Command::add_service(service))
    }

    /// Deletes a service and its destinations.
    pub fn delete_service(&self, name: &str) -> Result<()> {
        let service = self.catalog.read()?.get_service(name)?;
        self.provider.release_vip(&service)?;
        self.submit(Command::del_service(service))
    }

    /// Adds a destination to a service.
    pub fn add_destination(&self, service_name: &str, mut destination: Destination) -> Result<()> {
        let service = self.catalog.read()?.get_service(service_name)?;
        destination.service_id = service.id();
        self.submit(Command::add_destination(destination))
    }

    /// Deletes the named destination.
    pub fn delete_destination(&self, name: &str) -> Result<()> {
        let destination = self.catalog.read()?.get_destination(name)?;
        self.submit(Command::del_destination(destination))
    }

    /// Fetches cluster status from the consensus leader.
    pub fn status(&self) -> Result<raft::Status> {
        self.raft()?.status()
    }

    /// Shuts the balancer down: leaves the cluster gracefully, stops the
    /// consensus server and all watcher threads, and clears the peer list.
    /// The log store is dropped last, with the consensus server thread.
    pub fn shutdown(mut self) {
        self.leave();
        drop(self.stats_shutdown.take());
        self.raft = None;
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("A balancer thread panicked during shutdown");
            }
        }
        self.members.clear();
    }

    /// Leaves the gossip cluster. A non-leader then waits up to the grace
    /// period for the leader to remove it from the consensus peer set (its
    /// own peer view empties when the removal applies); the leaving node
    /// intentionally does not remove itself.
    fn leave(&self) {
        info!("Starting cluster leave");
        let was_leader = self.is_leader();
        if let Err(err) = self.gossip.leave() {
            error!("Failed to leave gossip cluster: {err}");
        }
        if was_leader {
            return;
        }
        let deadline = Instant::now() + LEAVE_GRACE_PERIOD;
        while !self.members.peers().is_empty() && Instant::now() < deadline {
            std::thread::sleep(LEAVE_POLL_INTERVAL);
        }
        if !self.members.peers().is_empty() {
            warn!("Failed to leave consensus peer set gracefully, timeout");
        }
    }

    /// Submits a command for replication and blocks until it has been
    /// applied and reconciled locally.
    fn submit(&self, command: Command) -> Result<()> {
        self.raft()?.mutate(command.encode()?)?;
        Ok(())
    }

    fn raft(&self) -> Result<&raft::Client> {
        self.raft.as_ref().ok_or(Error::Abort)
    }

    /// Drains the reconciliation channel: for each applied command, runs the
    /// VIP sync (leader only) and the dataplane reconciliation, and replies
    /// with the combined outcome, which becomes the apply result.
    fn state_watcher(
        reconcile_rx: Receiver<ReconcileRequest>,
        catalog: SharedCatalog,
        provider: Arc<dyn Provider>,
        reconciler: Arc<Reconciler>,
        is_leader: Arc<AtomicBool>,
    ) {
        info!("Watching state changes");
        while let Ok(reply_tx) = reconcile_rx.recv() {
            let result =
                Self::handle_state_change(&catalog, &provider, &reconciler, &is_leader);
            if reply_tx.send(result).is_err() {
                debug!("Reconciliation requester gone, dropping reply");
            }
        }
    }

    fn handle_state_change(
        catalog: &SharedCatalog,
        provider: &Arc<dyn Provider>,
        reconciler: &Reconciler,
        is_leader: &AtomicBool,
    ) -> Result<()> {
        let catalog = catalog.read()?;
        let vips = match is_leader.load(Ordering::Relaxed) {
            true => provider.sync_vips(&catalog),
            false => Ok(()),
        };
        let dataplane = reconciler.sync(&catalog);
        match (vips, dataplane) {
            (Ok(()), result) => result,
            (result, Ok(())) => result,
            (Err(vips), Err(dataplane)) => Err(Error::IO(format!("{vips}; {dataplane}"))),
        }
    }

    /// Reacts to leadership transitions: on winning, flush all VIP bindings
    /// and rebind from the catalog; on losing, flush. The flush-then-rebind
    /// sequence bounds the window where two nodes might both hold VIPs. The
    /// mutex serializes transitions so a win and a loss can't interleave
    /// their bind/unbind steps.
    fn leader_watcher(
        leader_rx: Receiver<bool>,
        catalog: SharedCatalog,
        provider: Arc<dyn Provider>,
        iface: Arc<dyn Interface>,
        vip_mutex: Arc<Mutex<()>>,
    ) {
        info!("Watching leadership changes");
        while let Ok(is_leader) = leader_rx.recv() {
            let _guard = vip_mutex.lock().expect("lock poisoned");
            if let Err(err) = iface.flush() {
                error!("Failed to flush VIPs: {err}");
            }
            if is_leader {
                info!("Acquired leadership, binding VIPs");
                let result = catalog
                    .read()
                    .map_err(Error::from)
                    .and_then(|catalog| provider.sync_vips(&catalog));
                if let Err(err) = result {
                    error!("Failed to bind VIPs: {err}");
                }
            } else {
                info!("Lost leadership, VIPs unbound");
            }
        }
    }

    /// Dispatches membership events: balancer joins become consensus peer
    /// additions on the leader, balancer departures become peer removals,
    /// and agent departures are translated into destination deletions
    /// through the command path.
    fn dispatcher(
        event_rx: Receiver<Event>,
        raft: raft::Client,
        catalog: SharedCatalog,
        is_leader: Arc<AtomicBool>,
        local_raft_addr: String,
    ) {
        info!("Watching membership events");
        while let Ok(event) = event_rx.recv() {
            match event {
                Event::Join(member) => {
                    Self::handle_member_join(&member, &raft, &is_leader, &local_raft_addr)
                }
                Event::Leave(member) | Event::Failed(member) => Self::handle_member_leave(
                    &member,
                    &raft,
                    &catalog,
                    &is_leader,
                    &local_raft_addr,
                ),
            }
        }
    }

    fn handle_member_join(
        member: &Member,
        raft: &raft::Client,
        is_leader: &AtomicBool,
        local_raft_addr: &str,
    ) {
        let tags = Tags::parse(member);
        if tags.role != Some(Role::Balancer) {
            return;
        }
        if !is_leader.load(Ordering::Relaxed) {
            return;
        }
        let Some(port) = tags.raft_port else {
            warn!("Balancer {} has no raft-port tag, ignoring", member.name);
            return;
        };
        let peer = format!("{}:{port}", member.addr.ip());
        if peer == local_raft_addr {
            return;
        }
        info!("Adding balancer {} to the consensus group at {peer}", member.name);
        if let Err(err) = raft.add_peer(peer) {
            // Transient: gossip will redeliver the member on its next
            // incarnation, or the operator retries.
            error!("Failed to add consensus peer: {err}");
        }
    }

    fn handle_member_leave(
        member: &Member,
        raft: &raft::Client,
        catalog: &SharedCatalog,
        is_leader: &AtomicBool,
        local_raft_addr: &str,
    ) {
        let tags = Tags::parse(member);
        if tags.role == Some(Role::Balancer) {
            if !is_leader.load(Ordering::Relaxed) {
                return;
            }
            let Some(port) = tags.raft_port else {
                return;
            };
            let peer = format!("{}:{port}", member.addr.ip());
            if peer == local_raft_addr {
                return;
            }
            match raft.remove_peer(peer.clone()) {
                Ok(()) => info!("Removed balancer {} from the consensus group", member.name),
                // Not being a peer (e.g. it never joined consensus) is fine.
                Err(Error::NotFound(_)) => {}
                Err(err) => error!("Failed to remove consensus peer {peer}: {err}"),
            }
            return;
        }

        // An agent departure takes its destination with it, through the
        // regular command path. Every node observes the event; followers
        // forward to the leader and the deletion is idempotent.
        let destination = match catalog.read() {
            Ok(catalog) => catalog.get_destination(&member.name),
            Err(err) => {
                error!("Failed to read catalog: {err}");
                return;
            }
        };
        match destination {
            Ok(destination) => {
                info!("Removing destination {} for departed agent", member.name);
                let result = Command::del_destination(destination)
                    .encode()
                    .and_then(|command| raft.mutate(command).map(|_| ()));
                if let Err(err) = result {
                    error!("Failed to remove destination {}: {err}", member.name);
                }
            }
            Err(Error::NotFound(_)) => {
                debug!("No destination for departed member {}", member.name)
            }
            Err(err) => error!("Failed to look up destination {}: {err}", member.name),
        }
    }

    /// Logs per-service dataplane counters at the configured interval, as
    /// structured records under the stats target.
    fn stats_ticker(
        interval: Duration,
        shutdown_rx: Receiver<()>,
        catalog: SharedCatalog,
        ipvs: Arc<dyn Ipvs>,
    ) {
        info!("Collecting statistics every {interval:?}");
        let ticker = crossbeam::channel::tick(interval);
        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => Self::collect_stats(&catalog, &ipvs),
                recv(shutdown_rx) -> _ => return,
            }
        }
    }

    fn collect_stats(catalog: &SharedCatalog, ipvs: &Arc<dyn Ipvs>) {
        let services = match catalog.read() {
            Ok(catalog) => catalog.services(),
            Err(err) => {
                error!("Failed to read catalog: {err}");
                return;
            }
        };
        for service in services {
            let hosts =
                service.destinations.iter().map(|d| d.host.as_str()).collect::<Vec<_>>().join(",");
            match ipvs.counters(&Virtual::from(&service)) {
                Ok(counters) => info!(
                    target: "stats",
                    "service={} protocol={} port={} hosts={hosts} connections={} packets_in={} packets_out={} bytes_in={} bytes_out={}",
                    service.name,
                    service.protocol,
                    service.port,
                    counters.connections,
                    counters.packets_in,
                    counters.packets_out,
                    counters.bytes_in,
                    counters.bytes_out,
                ),
                Err(err) => debug!("No counters for service {}: {err}", service.name),
            }
        }
    }
}
