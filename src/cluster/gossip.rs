use crate::encoding::bincode;
use crate::error::Result;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, warn};
use rand::seq::SliceRandom as _;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The interval between gossip rounds.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// How long a member can stay silent before it is declared failed. A live
/// member bumps its incarnation every gossip round, so silence means its
/// updates have stopped arriving both directly and indirectly.
const FAILURE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long failed and left members are kept in the roster for
/// dissemination before being reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(15);

/// The number of random members to gossip with per round.
const FANOUT: usize = 3;

/// The socket read timeout, bounding shutdown latency.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// A cluster member, as disseminated via gossip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The member's node name, unique in the cluster.
    pub name: String,
    /// The member's gossip address.
    pub addr: SocketAddr,
    /// Free-form tags, e.g. role and consensus port. See Tags for the typed
    /// view.
    pub tags: BTreeMap<String, String>,
}

/// A membership event.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A member joined, or rejoined after a failure.
    Join(Member),
    /// A member left gracefully.
    Leave(Member),
    /// A member stopped responding.
    Failed(Member),
}

/// The role of a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// A balancer node, participating in consensus.
    Balancer,
    /// A back-end agent, fronted by the balancers.
    Agent,
}

/// A typed view of the free-form member tags, parsed once at event receipt
/// so the rest of the code doesn't operate on strings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tags {
    pub role: Option<Role>,
    pub raft_port: Option<u16>,
}

impl Tags {
    /// Parses the typed tags of a member.
    pub fn parse(member: &Member) -> Self {
        let role = match member.tags.get("role").map(|role| role.as_str()) {
            Some("balancer") => Some(Role::Balancer),
            Some("agent") => Some(Role::Agent),
            _ => None,
        };
        let raft_port = member.tags.get("raft-port").and_then(|port| port.parse().ok());
        Self { role, raft_port }
    }
}

/// A member's perceived health.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum Health {
    Alive,
    Failed,
    Left,
}

/// A member with dissemination metadata. The incarnation is bumped by the
/// owning member every gossip round, so it doubles as a heartbeat counter:
/// the state with the highest (incarnation, health) wins a merge.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MemberState {
    member: Member,
    incarnation: u64,
    health: Health,
}

/// A gossip packet: the sender's full roster view, including itself.
#[derive(Serialize, Deserialize)]
enum Packet {
    Sync { members: Vec<MemberState> },
}

/// The tracked roster of remote members, keyed by name, with the time their
/// state last advanced.
type Roster = BTreeMap<String, (MemberState, Instant)>;

/// A SWIM-flavored gossip membership over UDP: full-state anti-entropy with
/// a few random peers per round, silence-based failure detection, and
/// explicit graceful leave. Eventually consistent; sufficient to discover
/// balancer peers and back-end agents and to surface their failures.
pub struct Gossip {
    socket: UdpSocket,
    local: Arc<Mutex<MemberState>>,
    roster: Arc<Mutex<Roster>>,
    shutdown: Arc<AtomicBool>,
}

impl Gossip {
    /// Starts a gossip node bound to the given address, returning the node
    /// and its membership event channel.
    pub fn new(
        name: String,
        bind: SocketAddr,
        tags: BTreeMap<String, String>,
    ) -> Result<(Self, Receiver<Event>)> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let addr = socket.local_addr()?;

        let local = Arc::new(Mutex::new(MemberState {
            member: Member { name, addr, tags },
            incarnation: 0,
            health: Health::Alive,
        }));
        let roster = Arc::new(Mutex::new(Roster::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = crossbeam::channel::unbounded();

        let gossip = Self { socket, local, roster, shutdown };
        gossip.spawn_listener(event_tx.clone())?;
        gossip.spawn_prober(event_tx)?;
        Ok((gossip, event_rx))
    }

    /// Returns the local member.
    pub fn local(&self) -> Member {
        self.local.lock().expect("lock poisoned").member.clone()
    }

    /// Returns the currently alive members, including the local node.
    pub fn members(&self) -> Vec<Member> {
        let mut members = vec![self.local()];
        let roster = self.roster.lock().expect("lock poisoned");
        members.extend(
            roster.values().filter(|(s, _)| s.health == Health::Alive).map(|(s, _)| s.member.clone()),
        );
        members
    }

    /// Joins a cluster by introducing ourselves to the given seed addresses,
    /// returning the number of seeds contacted. Their rosters arrive with
    /// their next gossip rounds.
    pub fn join(&self, seeds: &[String]) -> Result<usize> {
        let packet = Packet::Sync { members: vec![self.local.lock()?.clone()] };
        let frame = bincode::serialize(&packet);
        let mut contacted = 0;
        for seed in seeds {
            let addr: SocketAddr = seed
                .parse()
                .map_err(|_| crate::error::Error::InvalidInput(format!("invalid seed address {seed}")))?;
            match self.socket.send_to(&frame, addr) {
                Ok(_) => contacted += 1,
                Err(err) => warn!("Failed to contact seed {seed}: {err}"),
            }
        }
        Ok(contacted)
    }

    /// Leaves the cluster gracefully by disseminating a Left state to all
    /// known members, then stops gossiping.
    pub fn leave(&self) -> Result<()> {
        {
            let mut local = self.local.lock()?;
            local.incarnation += 1;
            local.health = Health::Left;
        }
        let packet = Packet::Sync { members: vec![self.local.lock()?.clone()] };
        let frame = bincode::serialize(&packet);
        let roster = self.roster.lock()?;
        for (state, _) in roster.values() {
            if state.health == Health::Alive {
                let _ = self.socket.send_to(&frame, state.member.addr);
            }
        }
        self.shutdown.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Spawns the listener thread, merging inbound rosters.
    fn spawn_listener(&self, event_tx: Sender<Event>) -> Result<()> {
        let socket = self.socket.try_clone()?;
        let local = self.local.clone();
        let roster = self.roster.clone();
        let shutdown = self.shutdown.clone();

        std::thread::spawn(move || {
            let mut buf = vec![0u8; 65_535];
            while !shutdown.load(Ordering::Relaxed) {
                let len = match socket.recv_from(&mut buf) {
                    Ok((len, _)) => len,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) => {
                        error!("Gossip receive failed: {err}");
                        continue;
                    }
                };
                match bincode::deserialize::<Packet>(&buf[..len]) {
                    Ok(Packet::Sync { members }) => {
                        Self::merge(&local, &roster, &event_tx, members)
                    }
                    Err(err) => debug!("Dropping malformed gossip packet: {err}"),
                }
            }
        });
        Ok(())
    }

    /// Spawns the prober thread: failure detection, reaping, and gossip
    /// dissemination to a few random members per round.
    fn spawn_prober(&self, event_tx: Sender<Event>) -> Result<()> {
        let socket = self.socket.try_clone()?;
        let local = self.local.clone();
        let roster = self.roster.clone();
        let shutdown = self.shutdown.clone();

        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(PROBE_INTERVAL);

                let mut roster_guard = roster.lock().expect("lock poisoned");

                // Declare silent members failed, and reap old corpses.
                let now = Instant::now();
                for (state, last_seen) in roster_guard.values_mut() {
                    if state.health == Health::Alive && now.duration_since(*last_seen) > FAILURE_TIMEOUT
                    {
                        warn!("Member {} failed (no updates)", state.member.name);
                        state.health = Health::Failed;
                        let _ = event_tx.send(Event::Failed(state.member.clone()));
                    }
                }
                roster_guard.retain(|_, (state, last_seen)| {
                    state.health == Health::Alive
                        || now.duration_since(*last_seen) <= REAP_TIMEOUT
                });

                // Bump our heartbeat and gossip the full roster to a few
                // random members.
                let payload = {
                    let mut local = local.lock().expect("lock poisoned");
                    local.incarnation += 1;
                    let mut members: Vec<MemberState> =
                        roster_guard.values().map(|(s, _)| s.clone()).collect();
                    members.push(local.clone());
                    members
                };
                let targets: Vec<SocketAddr> = roster_guard
                    .values()
                    .filter(|(s, _)| s.health == Health::Alive)
                    .map(|(s, _)| s.member.addr)
                    .collect();
                drop(roster_guard);

                let frame = bincode::serialize(&Packet::Sync { members: payload });
                let mut rng = rand::thread_rng();
                for addr in targets.choose_multiple(&mut rng, FANOUT) {
                    if let Err(err) = socket.send_to(&frame, addr) {
                        debug!("Gossip send to {addr} failed: {err}");
                    }
                }
            }
        });
        Ok(())
    }

    /// Merges an inbound roster view. The freshest (incarnation, health)
    /// state wins; transitions emit membership events. Claims about the
    /// local member are refuted by outbidding their incarnation.
    fn merge(
        local: &Mutex<MemberState>,
        roster: &Mutex<Roster>,
        event_tx: &Sender<Event>,
        members: Vec<MemberState>,
    ) {
        let local_name = local.lock().expect("lock poisoned").member.name.clone();
        let mut roster = roster.lock().expect("lock poisoned");
        let now = Instant::now();

        for state in members {
            if state.member.name == local_name {
                // Somebody thinks we're gone; refute with a fresher claim.
                let mut local = local.lock().expect("lock poisoned");
                if state.health != Health::Alive
                    && state.incarnation >= local.incarnation
                    && local.health == Health::Alive
                {
                    local.incarnation = state.incarnation + 1;
                }
                continue;
            }

            match roster.get_mut(&state.member.name) {
                None => {
                    debug!("Discovered member {} ({:?})", state.member.name, state.health);
                    if state.health == Health::Alive {
                        let _ = event_tx.send(Event::Join(state.member.clone()));
                    }
                    roster.insert(state.member.name.clone(), (state, now));
                }
                Some((existing, last_seen)) => {
                    let fresher = (state.incarnation, state.health)
                        > (existing.incarnation, existing.health);
                    if !fresher {
                        continue;
                    }
                    match (existing.health, state.health) {
                        (Health::Alive, Health::Failed) => {
                            let _ = event_tx.send(Event::Failed(state.member.clone()));
                        }
                        (Health::Alive, Health::Left) => {
                            let _ = event_tx.send(Event::Leave(state.member.clone()));
                        }
                        (Health::Failed | Health::Left, Health::Alive) => {
                            let _ = event_tx.send(Event::Join(state.member.clone()));
                        }
                        _ => {}
                    }
                    *existing = state;
                    if existing.health == Health::Alive {
                        *last_seen = now;
                    }
                }
            }
        }
    }
}

impl Drop for Gossip {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(role: &str, raft_port: Option<u16>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("role".to_string(), role.to_string());
        if let Some(port) = raft_port {
            tags.insert("raft-port".to_string(), port.to_string());
        }
        tags
    }

    fn wait_for<F: Fn(&Event) -> bool>(events: &Receiver<Event>, pred: F) -> Event {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
                if pred(&event) {
                    return event;
                }
            }
        }
        panic!("timed out waiting for event");
    }

    #[test]
    fn typed_tags() {
        let member = Member {
            name: "lb-1".to_string(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            tags: tags("balancer", Some(9705)),
        };
        assert_eq!(
            Tags::parse(&member),
            Tags { role: Some(Role::Balancer), raft_port: Some(9705) }
        );

        let agent = Member { tags: tags("agent", None), ..member.clone() };
        assert_eq!(Tags::parse(&agent), Tags { role: Some(Role::Agent), raft_port: None });

        let unknown = Member { tags: BTreeMap::new(), ..member };
        assert_eq!(Tags::parse(&unknown), Tags { role: None, raft_port: None });
    }

    #[test]
    fn join_and_leave() -> Result<()> {
        let bind: SocketAddr = "127.0.0.1:0".parse()?;
        let (first, first_events) = Gossip::new("lb-1".to_string(), bind, tags("balancer", Some(1)))?;
        let (second, second_events) =
            Gossip::new("lb-2".to_string(), bind, tags("balancer", Some(2)))?;

        second.join(&[first.local().addr.to_string()])?;

        let event = wait_for(&first_events, |e| matches!(e, Event::Join(m) if m.name == "lb-2"));
        let Event::Join(member) = event else { unreachable!() };
        assert_eq!(Tags::parse(&member).role, Some(Role::Balancer));
        wait_for(&second_events, |e| matches!(e, Event::Join(m) if m.name == "lb-1"));

        assert_eq!(first.members().len(), 2);

        second.leave()?;
        wait_for(&first_events, |e| matches!(e, Event::Leave(m) if m.name == "lb-2"));
        Ok(())
    }

    #[test]
    fn failure_detection() -> Result<()> {
        let bind: SocketAddr = "127.0.0.1:0".parse()?;
        let (first, first_events) = Gossip::new("lb-1".to_string(), bind, tags("balancer", None))?;
        let (second, _second_events) = Gossip::new("web-1".to_string(), bind, tags("agent", None))?;

        second.join(&[first.local().addr.to_string()])?;
        wait_for(&first_events, |e| matches!(e, Event::Join(m) if m.name == "web-1"));

        // Kill the agent without a leave; silence marks it failed.
        drop(second);
        let event =
            wait_for(&first_events, |e| matches!(e, Event::Failed(m) if m.name == "web-1"));
        assert_eq!(Tags::parse(match &event {
            Event::Failed(m) => m,
            _ => unreachable!(),
        }).role, Some(Role::Agent));
        Ok(())
    }
}
