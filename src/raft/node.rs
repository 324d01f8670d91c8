use super::{
    Entry, Envelope, Index, Log, Members, Message, Operation, Request, RequestID, Response,
    Snapshot, SnapshotStore, State, Status,
};
use crate::encoding::Value as _;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A node identity: the network address on which it serves consensus RPCs.
pub type NodeID = String;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// Node options.
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries to send in a single Append message.
    pub max_append_entries: usize,
    /// The number of applied entries between snapshots, which also compact
    /// the log. 0 disables snapshots.
    pub snapshot_interval: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            election_timeout_range: super::ELECTION_TIMEOUT_RANGE,
            max_append_entries: super::MAX_APPEND_ENTRIES,
            snapshot_interval: super::SNAPSHOT_INTERVAL,
        }
    }
}

/// A consensus node with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node and return a new one with a
/// possibly different role. Outbound messages are sent via the node_tx
/// channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new node. It starts as a leaderless follower, unless
    /// bootstrap mode is enabled and the membership manifest lists at most
    /// the local node, in which case it elects itself as a single-node
    /// cluster. If a snapshot is present, the state machine is restored from
    /// it before the remaining log is replayed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        members: Arc<Members>,
        log: Log,
        state: Box<dyn State>,
        snapshots: SnapshotStore,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        bootstrap: bool,
    ) -> Result<Self> {
        let node = RawNode::new(members, log, state, snapshots, node_tx, opts, bootstrap)?;
        if bootstrap && node.peers().is_empty() {
            info!("Bootstrapping single-node cluster");
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Returns true if this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, Node::Leader(_))
    }

    /// Processes a message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        // Drop election messages from non-members: a removed node, or a
        // fresh node campaigning before the leader has added it, must not
        // influence votes. Replication messages are accepted from unknown
        // senders, since a freshly added node learns the membership from the
        // log entries the leader replicates to it.
        if msg.from != *self.id()
            && !self.members().contains(&msg.from)
            && matches!(msg.message, Message::Campaign { .. } | Message::CampaignResponse { .. })
        {
            debug!("Dropping election message from non-member {}", msg.from);
            return Ok(self);
        }
        debug!("Stepping {:?}", msg);
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    fn members(&self) -> &Members {
        match self {
            Node::Candidate(n) => &n.members,
            Node::Follower(n) => &n.members,
            Node::Leader(n) => &n.members,
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A node role: leader, follower, or candidate.
pub trait Role {}

/// A node with the concrete role R, using the typestate pattern to encode
/// role-specific state and transitions.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    members: Arc<Members>,
    bootstrap: bool,
    log: Log,
    state: Box<dyn State>,
    snapshots: SnapshotStore,
    applied_index: Index,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            members: self.members,
            bootstrap: self.bootstrap,
            log: self.log,
            state: self.state,
            snapshots: self.snapshots,
            applied_index: self.applied_index,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the node's current term.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the current peer set (all members except the local node).
    fn peers(&self) -> BTreeSet<NodeID> {
        self.members.peers()
    }

    /// Returns the cluster size as number of members.
    fn cluster_size(&self) -> usize {
        self.members.len()
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message to a peer.
    fn send(&self, to: &NodeID, message: Message) -> Result<()> {
        Self::send_with(
            &self.node_tx,
            Envelope { from: self.id.clone(), to: to.clone(), term: self.term(), message },
        )
    }

    /// Sends a message without borrowing self, to allow partial borrows.
    fn send_with(tx: &crossbeam::channel::Sender<Envelope>, msg: Envelope) -> Result<()> {
        debug!("Sending {msg:?}");
        Ok(tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // BTreeSet iteration is ordered, for test determinism.
        for id in self.peers() {
            self.send(&id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to other node");
    }

    /// Applies a committed entry: either a state machine command or a
    /// membership change. Entries must be applied in log order. A membership
    /// change that removes the local node empties the local peer set, which
    /// the coordinator polls during a graceful leave.
    fn apply_entry(&mut self, entry: &Entry) -> Result<Response> {
        assert_eq!(entry.index, self.applied_index + 1, "entries must be applied in order");
        self.applied_index = entry.index;

        let Some(command) = &entry.command else {
            return Ok(Response::Mutate(Vec::new())); // noop entry
        };
        match Operation::decode(command).expect("invalid operation in log") {
            Operation::Command(command) => self.state.apply(command).map(Response::Mutate),
            Operation::AddPeer(peer) => {
                if self.members.add(peer.clone()) {
                    info!("Added cluster member {peer}");
                }
                Ok(Response::AddPeer(peer))
            }
            Operation::RemovePeer(peer) if peer == self.id => {
                info!("Removed from the cluster");
                for other in self.members.peers() {
                    self.members.remove(&other);
                }
                Ok(Response::RemovePeer(peer))
            }
            Operation::RemovePeer(peer) => {
                if self.members.remove(&peer) {
                    info!("Removed cluster member {peer}");
                }
                Ok(Response::RemovePeer(peer))
            }
        }
    }

    /// Takes a snapshot and compacts the log when enough entries have been
    /// applied since the last snapshot.
    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.opts.snapshot_interval == 0 || !self.snapshots.is_durable() {
            return Ok(());
        }
        let (prefix_index, _) = self.log.get_prefix();
        if self.applied_index < prefix_index + self.opts.snapshot_interval {
            return Ok(());
        }
        let index = self.applied_index;
        let Some(entry) = self.log.get(index)? else {
            return Ok(());
        };
        info!("Taking snapshot at applied index {index}");
        let snapshot = Snapshot {
            index,
            term: entry.term,
            members: self.members.all().into_iter().collect(),
            data: self.state.snapshot()?,
        };
        self.snapshots.save(&snapshot)?;
        self.log.compact(index)?;
        Ok(())
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received (including ourself).
    votes: BTreeSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: BTreeSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(
            Some(&self.id),
            self.log.get_term().1.as_ref(),
            "log vote does not match self"
        );
        assert!(self.role.election_duration < self.role.election_timeout, "election timeout passed");
        Ok(())
    }

    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let peers = self.peers();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // Propose an empty command when assuming leadership, to disambiguate
        // previous entries in the log (section 8 in the Raft paper). Prior to
        // the heartbeat, to avoid a wasted roundtrip if the heartbeat
        // response indicates the peer is behind.
        node.propose(None)?;
        node.maybe_commit_and_apply()?;
        node.heartbeat()?;

        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message.
        if msg.term > self.term() {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        let from = msg.from.clone();
        match msg.message {
            // Don't grant votes for other candidates who also campaign.
            Message::Campaign { .. } => {
                self.send(&from, Message::CampaignResponse { vote: false })?
            }

            // If we received a vote, record it. If the vote gives us quorum,
            // assume leadership.
            Message::CampaignResponse { vote: true } => {
                self.role.votes.insert(from);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get a vote. :(
            Message::CampaignResponse { vote: false } => {}

            // If we receive a message from the leader in this term, we lost
            // the election and have a new leader. Follow it and step the
            // message.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::InstallSnapshot { .. } => {
                return self.into_follower(msg.term, Some(from))?.step(msg);
            }

            // Abort any inbound client requests while candidate.
            Message::ClientRequest { id, .. } => {
                self.send(&from, Message::ClientResponse { id, response: Err(Error::Abort) })?;
            }

            // We're not a leader in this term, so we shouldn't see these.
            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::InstallSnapshotResponse { .. }
            | Message::ClientResponse { .. } => panic!("received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaign for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id.clone()); // vote for ourself
        self.log.set_term(term, Some(self.id.clone()))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::Campaign { last_index, last_term })?;
        Ok(())
    }
}

// A follower replicates state from a leader.
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
    /// Local client requests that have been forwarded to the leader. These
    /// are aborted on leader/term changes.
    forwarded: BTreeSet<RequestID>,
}

impl Follower {
    fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout, forwarded: BTreeSet::new() }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower. If a snapshot exists,
    /// the state machine is restored from it; the rest of the log is
    /// replayed as the commit index advances.
    fn new(
        members: Arc<Members>,
        log: Log,
        state: Box<dyn State>,
        snapshots: SnapshotStore,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
        bootstrap: bool,
    ) -> Result<Self> {
        let id = members.local().clone();
        let role = Follower::new(None, 0);
        let mut node = Self {
            id,
            members,
            bootstrap,
            log,
            state,
            snapshots,
            applied_index: 0,
            node_tx,
            opts,
            role,
        };
        node.role.election_timeout = node.gen_election_timeout();

        if let Some(snapshot) = node.snapshots.latest()? {
            info!("Restoring snapshot at index {} term {}", snapshot.index, snapshot.term);
            node.state.restore(snapshot.data)?;
            node.applied_index = snapshot.index;
            if node.log.get_commit_index().0 < snapshot.index {
                // The log is behind the snapshot (e.g. a crash between the
                // snapshot and the compaction), discard it.
                node.log.install(snapshot.index, snapshot.term)?;
            }
            // Replay any remaining committed entries.
            node.maybe_apply()?;
        }
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        if let Some(leader) = &self.role.leader {
            assert_ne!(leader, &self.id, "can't follow self");
            assert_ne!(self.term(), 0, "followers with leaders can't have term 0");
        } else {
            assert!(self.role.forwarded.is_empty(), "leaderless follower has forwarded requests");
        }
        assert!(self.role.leader_seen < self.role.election_timeout, "election timeout passed");
        Ok(())
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Abort any forwarded requests. These must be retried with new leader.
        self.abort_forwarded()?;

        // Apply any pending log entries, so that we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower, either a leaderless
    /// follower in a new term or following a leader in the current term.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);

        // Abort any forwarded requests. These must be retried with new leader.
        self.abort_forwarded()?;

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term(), "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role = Follower::new(Some(leader), self.role.election_timeout);
        } else {
            // We found a new term, but we don't necessarily know who the
            // leader is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term(), "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message.
        if msg.term > self.term() {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        // Record when we last saw a message from the leader (if any).
        if self.is_leader(&msg.from) {
            self.role.leader_seen = 0
        }

        let from = msg.from.clone();
        match msg.message {
            // The leader will send periodic heartbeats. If we don't have a
            // leader in this term yet, follow it. If the commit_index
            // advances, apply state transitions.
            Message::Heartbeat { last_index, commit_index } => {
                assert!(commit_index <= last_index, "commit_index after last_index");

                // Check that the heartbeat is from our leader.
                match &self.role.leader {
                    Some(leader) => assert_eq!(*leader, from, "multiple leaders in term"),
                    None => self = self.into_follower(Some(from.clone()), msg.term)?,
                }

                // Attempt to match the leader's log and respond to the
                // heartbeat. last_index always has the leader's term.
                let match_index = if self.log.has(last_index, msg.term)? { last_index } else { 0 };
                self.send(&from, Message::HeartbeatResponse { match_index })?;

                // Advance commit index and apply entries. The commit index
                // can only be advanced if the last_index matches the leader,
                // which implies the logs are identical up to it.
                if match_index != 0 && commit_index > self.log.get_commit_index().0 {
                    self.log.commit(commit_index)?;
                    self.maybe_apply()?;
                }
            }

            // Append log entries from the leader to the local log.
            Message::Append { base_index, base_term, entries } => {
                if let Some(first) = entries.first() {
                    assert_eq!(base_index, first.index - 1, "base index mismatch");
                }

                // Make sure the message comes from our leader.
                match &self.role.leader {
                    Some(leader) => assert_eq!(*leader, from, "multiple leaders in term"),
                    None => self = self.into_follower(Some(from.clone()), msg.term)?,
                }

                // If the base entry is in our log, append the entries.
                let (mut reject_index, mut match_index) = (0, 0);
                if base_index == 0 || self.log.has(base_index, base_term)? {
                    match_index = entries.last().map(|e| e.index).unwrap_or(base_index);
                    self.log.splice(entries)?;
                } else {
                    // Otherwise, reject the base index. If the local log is
                    // shorter than the base index, lower the reject index to
                    // skip all the missing entries.
                    reject_index = std::cmp::min(base_index, self.log.get_last_index().0 + 1);
                }
                self.send(&from, Message::AppendResponse { reject_index, match_index })?;
            }

            // The leader installs a full snapshot when our next entry has
            // already been compacted away on it.
            Message::InstallSnapshot { index, term, members, data } => {
                match &self.role.leader {
                    Some(leader) => assert_eq!(*leader, from, "multiple leaders in term"),
                    None => self = self.into_follower(Some(from.clone()), msg.term)?,
                }

                if index <= self.log.get_commit_index().0 {
                    // Stale snapshot, report the commit position (which the
                    // leader is guaranteed to have).
                    let (last_index, _) = self.log.get_commit_index();
                    self.send(&from, Message::InstallSnapshotResponse { last_index })?;
                } else {
                    info!("Installing snapshot at index {index} term {term}");
                    self.state.restore(data)?;
                    self.applied_index = index;
                    self.log.install(index, term)?;
                    self.members.replace(members.into_iter().collect());
                    self.send(&from, Message::InstallSnapshotResponse { last_index: index })?;
                }
            }

            // A candidate in this term is requesting our vote.
            Message::Campaign { last_index, last_term } => {
                // Don't vote if we already voted for someone else in this term.
                if let (_, Some(vote)) = self.log.get_term() {
                    if from != vote {
                        self.send(&from, Message::CampaignResponse { vote: false })?;
                        return Ok(self.into());
                    }
                }

                // Don't vote if our log is newer than the candidate's log.
                let (log_index, log_term) = self.log.get_last_index();
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    self.send(&from, Message::CampaignResponse { vote: false })?;
                    return Ok(self.into());
                }

                // Grant the vote.
                info!("Voting for {from} in term {} election", msg.term);
                self.log.set_term(msg.term, Some(from.clone()))?;
                self.send(&from, Message::CampaignResponse { vote: true })?;
            }

            // We may receive a vote after we lost an election and followed a
            // different leader. Ignore it.
            Message::CampaignResponse { .. } => {}

            // Forward client requests to the leader, or abort them if there
            // is none (the client must retry).
            Message::ClientRequest { id, request } => {
                assert_eq!(from, self.id, "client request from other node");

                if let Some(leader) = self.role.leader.clone() {
                    debug!("Forwarding request to leader {leader}");
                    self.role.forwarded.insert(id.clone());
                    self.send(&leader, Message::ClientRequest { id, request })?;
                } else {
                    self.send(&from, Message::ClientResponse { id, response: Err(Error::Abort) })?;
                }
            }

            // Returns client responses for forwarded requests.
            Message::ClientResponse { id, response } => {
                assert!(self.is_leader(&from), "client response from non-leader");

                if self.role.forwarded.remove(&id) {
                    let to = self.id.clone();
                    self.send(&to, Message::ClientResponse { id, response })?;
                }
            }

            // We're not a leader nor candidate in this term, so we shouldn't
            // see these.
            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::InstallSnapshotResponse { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        };
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            self.role.leader_seen = 0;
            // Only campaign as part of a formed cluster: a fresh node waits
            // to be added by the leader, and a node removed from the cluster
            // must not elect itself.
            if self.bootstrap || (self.log.get_last_index().0 > 0 && !self.peers().is_empty()) {
                return Ok(self.into_candidate()?.into());
            }
        }
        Ok(self.into())
    }

    /// Aborts all forwarded requests.
    fn abort_forwarded(&mut self) -> Result<()> {
        // BTreeSet iteration is sorted, for test determinism.
        for id in std::mem::take(&mut self.role.forwarded) {
            debug!("Aborting forwarded request {id:x?}");
            let to = self.id.clone();
            self.send(&to, Message::ClientResponse { id, response: Err(Error::Abort) })?;
        }
        Ok(())
    }

    /// Applies any pending committed log entries.
    fn maybe_apply(&mut self) -> Result<()> {
        let entries: Vec<Entry> =
            self.log.scan_apply(self.applied_index).collect::<Result<_>>()?;
        for entry in entries {
            debug!("Applying {entry:?}");
            // There is no client waiting for the result. Deterministic
            // application errors (e.g. dataplane reconciliation failures)
            // are logged and dropped; the state is already mutated.
            if let Err(err) = self.apply_entry(&entry) {
                debug!("Apply failed at index {}: {err}", entry.index);
            }
        }
        self.maybe_snapshot()?;
        Ok(())
    }

    /// Checks if an address is the current leader.
    fn is_leader(&self, from: &NodeID) -> bool {
        self.role.leader.as_ref() == Some(from)
    }
}

/// Follower replication progress.
struct Progress {
    /// The next index to replicate to the follower.
    next_index: Index,
    /// The last index where the follower's log matches the leader.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance a follower's match index, returning true if it
    /// did. next_index always stays above match_index.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1. Returns true on change.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = std::cmp::max(next_index, self.match_index + 1);
        true
    }
}

/// A pending client write request.
struct Write {
    /// The node which submitted the write.
    from: NodeID,
    /// The write request ID.
    id: RequestID,
}

// A leader serves requests and replicates the log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Pending write requests, keyed by the log index of their entry. When
    /// the entry is applied, the result is sent to the submitting client.
    /// All pending writes are aborted when leadership is lost.
    writes: HashMap<Index, Write>,
    /// Number of ticks since last periodic heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    fn new(peers: BTreeSet<NodeID>, last_index: Index) -> Self {
        let next_index = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress, writes: HashMap::new(), since_heartbeat: 0 }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) -> Result<()> {
        assert_ne!(self.term(), 0, "leaders can't have term 0");
        debug_assert_eq!(
            Some(&self.id),
            self.log.get_term().1.as_ref(),
            "log vote does not match self"
        );
        Ok(())
    }

    /// Transitions the leader into a follower. This can only happen if we
    /// discover a new term, so we become a leaderless follower.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "can only become follower in later term");

        info!("Discovered new term {term}");

        // Cancel in-flight requests.
        for write in
            std::mem::take(&mut self.role.writes).into_values().sorted_by_key(|w| w.id.clone())
        {
            self.send(
                &write.from,
                Message::ClientResponse { id: write.id, response: Err(Error::Abort) },
            )?;
        }

        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert()?;
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term() {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message.
        if msg.term > self.term() {
            return self.into_follower(msg.term)?.step(msg);
        }

        let from = msg.from.clone();

        // Ignore responses from peers we no longer track, e.g. a peer whose
        // removal was just applied while its response was in flight.
        if matches!(
            msg.message,
            Message::HeartbeatResponse { .. }
                | Message::AppendResponse { .. }
                | Message::InstallSnapshotResponse { .. }
        ) && !self.role.progress.contains_key(&from)
        {
            debug!("Dropping response from untracked peer {from}");
            return Ok(self.into());
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::InstallSnapshot { .. } => {
                panic!("saw other leader {from} in term {}", msg.term);
            }

            // A follower received our heartbeat and confirms our leadership.
            Message::HeartbeatResponse { match_index } => {
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "future match index");

                if match_index == 0 {
                    // The follower didn't match our last index: an append to
                    // it must have failed, or it's catching up. Probe it to
                    // discover a matching entry.
                    self.progress(&from).regress_next(last_index);
                    self.maybe_send_append(&from, true)?;
                } else if self.progress(&from).advance(match_index) {
                    // The follower's match index advanced: an append response
                    // got lost. Try to commit.
                    self.maybe_commit_and_apply()?;
                }
            }

            // A follower appended our log entries. Record its progress and
            // attempt to commit.
            Message::AppendResponse { match_index, reject_index: 0 } if match_index > 0 => {
                let (last_index, _) = self.log.get_last_index();
                assert!(match_index <= last_index, "follower matched unknown index");

                if self.progress(&from).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }

                // Eagerly send any further pending entries, if the peer is
                // catching up one max_append_entries batch at a time.
                self.maybe_send_append(&from, false)?;
            }

            // A follower rejected the log entries because the base entry in
            // reject_index did not match its log. Probe previous entries
            // until we find a common base.
            Message::AppendResponse { reject_index, match_index: 0 } if reject_index > 0 => {
                let (last_index, _) = self.log.get_last_index();
                assert!(reject_index <= last_index, "follower rejected unknown index");

                // If the rejected base index is at or below the match index,
                // the rejection is stale and can be ignored.
                if reject_index <= self.progress(&from).match_index {
                    return Ok(self.into());
                }

                // Probe below the reject index, or install a snapshot if the
                // index was already compacted away.
                if self.progress(&from).regress_next(reject_index) {
                    self.maybe_send_append(&from, true)?;
                }
            }

            Message::AppendResponse { .. } => panic!("invalid message {msg:?}"),

            // A follower installed our snapshot. Resume entry replication
            // from there.
            Message::InstallSnapshotResponse { last_index } => {
                self.progress(&from).advance(last_index);
                self.maybe_send_append(&from, false)?;
                self.maybe_commit_and_apply()?;
            }

            // A client submitted a state machine command. Propose it, and
            // track it until it's applied and the result returned.
            Message::ClientRequest { id, request: Request::Mutate(command) } => {
                let index = self.propose(Some(Operation::Command(command)))?;
                self.role.writes.insert(index, Write { from: from.clone(), id });
                if self.peers().is_empty() {
                    self.maybe_commit_and_apply()?;
                }
            }

            // A membership change. Proposed through the log like any command,
            // so every node applies it at the same position. Idempotent
            // requests respond immediately.
            Message::ClientRequest { id, request: Request::AddPeer(peer) } => {
                if self.members.contains(&peer) {
                    let response = Ok(Response::AddPeer(peer));
                    self.send(&from, Message::ClientResponse { id, response })?;
                } else {
                    info!("Proposing membership addition of {peer}");
                    let index = self.propose(Some(Operation::AddPeer(peer)))?;
                    self.role.writes.insert(index, Write { from: from.clone(), id });
                    if self.peers().is_empty() {
                        self.maybe_commit_and_apply()?;
                    }
                }
            }

            Message::ClientRequest { id, request: Request::RemovePeer(peer) } => {
                if peer == self.id {
                    let response = Err(Error::InvalidInput("can't remove the local leader".into()));
                    self.send(&from, Message::ClientResponse { id, response })?;
                } else if !self.members.contains(&peer) {
                    let response = Err(Error::NotFound(format!("peer {peer}")));
                    self.send(&from, Message::ClientResponse { id, response })?;
                } else {
                    info!("Proposing membership removal of {peer}");
                    let index = self.propose(Some(Operation::RemovePeer(peer)))?;
                    self.role.writes.insert(index, Write { from: from.clone(), id });
                    self.maybe_commit_and_apply()?;
                }
            }

            Message::ClientRequest { id, request: Request::Status } => {
                let mut match_index: std::collections::BTreeMap<NodeID, Index> = self
                    .role
                    .progress
                    .iter()
                    .map(|(id, p)| (id.clone(), p.match_index))
                    .collect();
                match_index.insert(self.id.clone(), self.log.get_last_index().0);
                let status = Status {
                    leader: self.id.clone(),
                    term: self.term(),
                    members: self.members.all().into_iter().collect(),
                    match_index,
                    commit_index: self.log.get_commit_index().0,
                    applied_index: self.applied_index,
                    storage: self.log.status()?,
                };
                let response = Ok(Response::Status(status));
                self.send(&from, Message::ClientResponse { id, response })?;
            }

            // Don't grant other votes in this term.
            Message::Campaign { .. } => {
                self.send(&from, Message::CampaignResponse { vote: false })?
            }

            // Votes can come in after we won the election, ignore them.
            Message::CampaignResponse { .. } => {}

            // Leaders don't proxy client requests, so we don't expect
            // responses from other nodes.
            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }

        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert()?;

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Broadcasts a heartbeat to all peers.
    fn heartbeat(&mut self) -> Result<()> {
        let (last_index, last_term) = self.log.get_last_index();
        let (commit_index, _) = self.log.get_commit_index();

        assert_eq!(last_term, self.term(), "leader has stale last_term");

        self.broadcast(Message::Heartbeat { last_index, commit_index })?;
        Ok(())
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: &NodeID) -> &mut Progress {
        self.role.progress.get_mut(id).expect("unknown peer")
    }

    /// Proposes an operation for consensus by appending it to our log and
    /// replicating it to peers. If successful, it will eventually be
    /// committed and applied.
    fn propose(&mut self, operation: Option<Operation>) -> Result<Index> {
        let index = self.log.append(operation.map(|op| op.encode()))?;
        for peer in self.peers() {
            // Eagerly send the entry to steady-state peers which have
            // already received all previous entries.
            if index == self.progress(&peer).next_index {
                self.maybe_send_append(&peer, false)?;
            }
        }
        Ok(index)
    }

    /// Commits any new log entries that have been replicated to a quorum,
    /// and applies them, responding to the submitting clients.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // Determine the new commit index.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.get_last_index().0))
                .collect(),
        );

        // If the commit index doesn't advance, do nothing. We don't assert on
        // this, since the quorum value may regress e.g. following a restart
        // or leader change where followers are initialized with log index 0.
        let (mut commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // We can only safely commit an entry from our own term (see figure 8
        // in the Raft paper).
        commit_index = match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term() => quorum_index,
            Some(_) => return Ok(commit_index),
            None => panic!("commit index {quorum_index} missing"),
        };

        // Commit the new entries.
        self.log.commit(commit_index)?;

        // Apply entries and respond to client writers.
        let term = self.term();
        let entries: Vec<Entry> =
            self.log.scan_apply(self.applied_index).collect::<Result<_>>()?;
        for entry in entries {
            debug!("Applying {entry:?}");
            let write = self.role.writes.remove(&entry.index);
            let result = self.apply_entry(&entry);

            if let Some(Write { id, from: to }) = write {
                let message = Message::ClientResponse { id, response: result };
                Self::send_with(
                    &self.node_tx,
                    Envelope { from: self.id.clone(), term, to, message },
                )?;
            }
        }

        // Membership changes may have been applied: reconcile the progress
        // tracking with the current peer set.
        self.sync_progress();
        self.maybe_snapshot()?;

        Ok(commit_index)
    }

    /// Reconciles the replication progress with the membership, dropping
    /// removed peers and starting to track added ones.
    fn sync_progress(&mut self) {
        let peers = self.peers();
        let (last_index, _) = self.log.get_last_index();
        self.role.progress.retain(|id, _| peers.contains(id));
        for peer in peers {
            self.role
                .progress
                .entry(peer)
                .or_insert(Progress { next_index: last_index + 1, match_index: 0 });
        }
    }

    /// Sends pending log entries to a peer, according to its next_index, or
    /// a snapshot if its next entry has already been compacted away. Sends
    /// an empty append as a probe when requested.
    fn maybe_send_append(&mut self, peer: &NodeID, mut probe: bool) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let (prefix_index, prefix_term) = self.log.get_prefix();
        // The peer may have just been removed by an applied membership
        // change while its response was in flight.
        let Some(progress) = self.role.progress.get(peer) else {
            debug!("No progress for peer {peer}, skipping append");
            return Ok(());
        };
        let (next_index, match_index) = (progress.next_index, progress.match_index);
        assert_ne!(next_index, 0, "invalid next_index");
        assert!(next_index > match_index, "invalid next_index <= match_index");
        assert!(match_index <= last_index, "invalid match_index > last_index");
        assert!(next_index <= last_index + 1, "invalid next_index > last_index + 1");

        // If the peer is already caught up, there's no point sending.
        if match_index == last_index {
            return Ok(());
        }

        // The peer needs entries that were compacted away, install the
        // latest snapshot instead.
        if next_index <= prefix_index {
            let snapshot = self.snapshots.latest()?.expect("compacted log without snapshot");
            info!("Installing snapshot at index {} on {peer}", snapshot.index);
            let message = Message::InstallSnapshot {
                index: snapshot.index,
                term: snapshot.term,
                members: snapshot.members,
                data: snapshot.data,
            };
            return self.send(peer, message);
        }

        // If a probe was requested, but next_index is immediately after
        // match_index, the entry must be accepted: send the entries instead.
        if probe && next_index == match_index + 1 {
            probe = false;
        }

        // If there are no pending entries and this is not a probe, there's
        // nothing more to send.
        if next_index > last_index && !probe {
            return Ok(());
        }

        // Fetch the base and entries.
        let (base_index, base_term) = match next_index {
            next if next == prefix_index + 1 => (prefix_index, prefix_term),
            1 => (0, 0),
            next => self.log.get(next - 1)?.map(|e| (e.index, e.term)).expect("missing base entry"),
        };

        let entries: Vec<Entry> = if !probe {
            self.log.scan(next_index..).take(self.opts.max_append_entries).collect::<Result<_>>()?
        } else {
            Vec::new()
        };

        // Optimistically assume the entries will be accepted, and bump the
        // next_index to avoid resending them until a response arrives.
        if let Some(last) = entries.last() {
            self.progress(peer).next_index = last.index + 1;
        }

        debug!("Replicating {} entries with base {base_index} to {peer}", entries.len());
        self.send(peer, Message::Append { base_index, base_term, entries })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state_test::Ledger;
    use crate::raft::SnapshotStore;
    use crate::storage;

    use crossbeam::channel::Receiver;
    use std::collections::BTreeMap;

    /// A deterministic in-process cluster: nodes are driven directly by
    /// routing their outbound envelopes, without threads or sockets.
    struct Cluster {
        nodes: BTreeMap<NodeID, Node>,
        rxs: BTreeMap<NodeID, Receiver<Envelope>>,
        ledgers: BTreeMap<NodeID, Ledger>,
        responses: BTreeMap<NodeID, Vec<(RequestID, Result<Response>)>>,
        next_request: u8,
    }

    fn node_id(i: usize) -> NodeID {
        format!("127.0.0.1:{}", 9700 + i)
    }

    impl Cluster {
        /// Creates a cluster where every node knows the full membership up
        /// front and the first node is in bootstrap mode.
        fn new(size: usize) -> Self {
            let ids: Vec<NodeID> = (1..=size).map(node_id).collect();
            let mut cluster = Self {
                nodes: BTreeMap::new(),
                rxs: BTreeMap::new(),
                ledgers: BTreeMap::new(),
                responses: BTreeMap::new(),
                next_request: 0,
            };
            for (i, id) in ids.iter().enumerate() {
                cluster.add_node(id.clone(), ids.clone(), i == 0, Options::default(), None);
            }
            cluster
        }

        /// Adds a node to the harness (not to the replicated membership).
        fn add_node(
            &mut self,
            id: NodeID,
            seeds: Vec<NodeID>,
            bootstrap: bool,
            opts: Options,
            snapshot_dir: Option<std::path::PathBuf>,
        ) {
            let members = Arc::new(Members::load(None, id.clone(), seeds).unwrap());
            let log = Log::new(Box::new(storage::Memory::new())).unwrap();
            let snapshots = SnapshotStore::new(snapshot_dir).unwrap();
            let ledger = Ledger::new();
            let (tx, rx) = crossbeam::channel::unbounded();
            let node =
                Node::new(members, log, Box::new(ledger.clone()), snapshots, tx, opts, bootstrap)
                    .unwrap();
            self.nodes.insert(id.clone(), node);
            self.rxs.insert(id.clone(), rx);
            self.ledgers.insert(id, ledger);
        }

        /// Routes all outbound envelopes until the cluster goes quiet.
        /// Messages to dead nodes are dropped. Responses surfacing at the
        /// submitting node's local client are collected.
        fn deliver(&mut self) {
            loop {
                let mut envelopes = Vec::new();
                for rx in self.rxs.values() {
                    while let Ok(envelope) = rx.try_recv() {
                        envelopes.push(envelope);
                    }
                }
                if envelopes.is_empty() {
                    return;
                }
                for envelope in envelopes {
                    // A response addressed to the sender itself surfaces at
                    // its local client rather than being stepped.
                    if matches!(envelope.message, Message::ClientResponse { .. })
                        && envelope.to == envelope.from
                    {
                        let Message::ClientResponse { id, response } = envelope.message else {
                            unreachable!()
                        };
                        self.responses.entry(envelope.to).or_default().push((id, response));
                        continue;
                    }
                    if let Some(node) = self.nodes.remove(&envelope.to) {
                        let node = node.step(envelope).unwrap();
                        self.nodes.insert(node.id().clone(), node);
                    }
                }
            }
        }

        /// Ticks a single node once.
        fn tick(&mut self, id: &NodeID) {
            let node = self.nodes.remove(id).unwrap();
            let node = node.tick().unwrap();
            self.nodes.insert(node.id().clone(), node);
        }

        /// Ticks a node until it becomes leader, delivering messages along
        /// the way.
        fn elect(&mut self, id: &NodeID) {
            for _ in 0..40 {
                if self.nodes[id].is_leader() {
                    return;
                }
                self.tick(id);
                self.deliver();
            }
            assert!(self.nodes[id].is_leader(), "{id} did not become leader");
        }

        /// Submits a client request on the given node.
        fn request(&mut self, id: &NodeID, request: Request) -> RequestID {
            self.next_request += 1;
            let request_id = vec![self.next_request];
            let term = self.nodes[id].term();
            let node = self.nodes.remove(id).unwrap();
            let node = node
                .step(Envelope {
                    from: id.clone(),
                    to: id.clone(),
                    term,
                    message: Message::ClientRequest { id: request_id.clone(), request },
                })
                .unwrap();
            self.nodes.insert(node.id().clone(), node);
            request_id
        }

        /// Returns the collected response for a request, if any.
        fn response(&self, id: &NodeID, request_id: &RequestID) -> Option<&Result<Response>> {
            self.responses
                .get(id)?
                .iter()
                .find(|(rid, _)| rid == request_id)
                .map(|(_, response)| response)
        }

        /// Ticks the leader through a heartbeat round and delivers.
        fn heartbeat(&mut self, id: &NodeID) {
            for _ in 0..Options::default().heartbeat_interval {
                self.tick(id);
            }
            self.deliver();
        }
    }

    #[test]
    fn bootstrap_single_node() {
        let mut cluster = Cluster::new(1);
        let id = node_id(1);
        assert!(cluster.nodes[&id].is_leader());

        let request_id = cluster.request(&id, Request::Mutate(vec![7]));
        cluster.deliver();
        assert_eq!(
            cluster.response(&id, &request_id),
            Some(&Ok(Response::Mutate(vec![7])))
        );
        assert_eq!(cluster.ledgers[&id].list(), vec![vec![7]]);
    }

    /// Any sequence of commands applied to the cluster yields equal state
    /// machines on all replicas.
    #[test]
    fn replication_converges() {
        let mut cluster = Cluster::new(3);
        let leader = node_id(1);
        cluster.elect(&leader);

        for i in 1..=5u8 {
            cluster.request(&leader, Request::Mutate(vec![i]));
            cluster.deliver();
        }
        cluster.heartbeat(&leader);

        let expect: Vec<Vec<u8>> = (1..=5u8).map(|i| vec![i]).collect();
        for (id, ledger) in &cluster.ledgers {
            assert_eq!(ledger.list(), expect, "replica {id} diverged");
        }
    }

    #[test]
    fn follower_forwards_requests() {
        let mut cluster = Cluster::new(3);
        let leader = node_id(1);
        let follower = node_id(2);
        cluster.elect(&leader);

        let request_id = cluster.request(&follower, Request::Mutate(vec![9]));
        cluster.deliver();
        cluster.heartbeat(&leader);
        assert_eq!(
            cluster.response(&follower, &request_id),
            Some(&Ok(Response::Mutate(vec![9])))
        );
    }

    #[test]
    fn leader_failover() {
        let mut cluster = Cluster::new(3);
        let old = node_id(1);
        let new = node_id(2);
        cluster.elect(&old);
        cluster.request(&old, Request::Mutate(vec![1]));
        cluster.deliver();
        cluster.heartbeat(&old);

        // Kill the leader and elect another node. The committed command
        // survives.
        cluster.nodes.remove(&old);
        cluster.elect(&new);
        cluster.request(&new, Request::Mutate(vec![2]));
        cluster.deliver();
        cluster.heartbeat(&new);

        assert_eq!(cluster.ledgers[&new].list(), vec![vec![1], vec![2]]);
        assert_eq!(cluster.ledgers[&node_id(3)].list(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn membership_addition_catches_up() {
        let mut cluster = Cluster::new(1);
        let leader = node_id(1);
        cluster.request(&leader, Request::Mutate(vec![1]));
        cluster.deliver();

        // A fresh node appears, knowing only the existing node. The leader
        // adds it and replicates the full log.
        let joiner = node_id(2);
        cluster.add_node(joiner.clone(), vec![leader.clone()], false, Options::default(), None);
        let request_id = cluster.request(&leader, Request::AddPeer(joiner.clone()));
        cluster.deliver();
        assert_eq!(
            cluster.response(&leader, &request_id),
            Some(&Ok(Response::AddPeer(joiner.clone())))
        );

        cluster.heartbeat(&leader);
        cluster.heartbeat(&leader);
        assert_eq!(cluster.ledgers[&joiner].list(), vec![vec![1]]);
    }

    #[test]
    fn membership_removal_empties_removed_node() {
        let mut cluster = Cluster::new(3);
        let leader = node_id(1);
        let removed = node_id(3);
        cluster.elect(&leader);

        cluster.request(&leader, Request::RemovePeer(removed.clone()));
        cluster.deliver();
        cluster.heartbeat(&leader);

        // Survivors agree on the new membership; the removed node saw its
        // own removal and emptied its peer set.
        assert_eq!(cluster.nodes[&leader].members().len(), 2);
        assert!(cluster.nodes[&removed].members().peers().is_empty());

        // Removing an unknown peer is a typed error.
        let request_id = cluster.request(&leader, Request::RemovePeer(removed.clone()));
        cluster.deliver();
        assert!(matches!(
            cluster.response(&leader, &request_id),
            Some(&Err(Error::NotFound(_)))
        ));
    }

    #[test]
    fn snapshot_installs_on_lagging_joiner() {
        let dir = tempfile::TempDir::with_prefix("ballast").unwrap();
        let opts = || Options { snapshot_interval: 2, ..Options::default() };

        let mut cluster = Cluster::new(0);
        let leader = node_id(1);
        cluster.add_node(leader.clone(), vec![], true, opts(), Some(dir.path().join("n1")));
        for i in 1..=6u8 {
            cluster.request(&leader, Request::Mutate(vec![i]));
            cluster.deliver();
        }

        // The log has been compacted, so a joiner must receive a snapshot.
        let joiner = node_id(2);
        cluster.add_node(
            joiner.clone(),
            vec![leader.clone()],
            false,
            opts(),
            Some(dir.path().join("n2")),
        );
        cluster.request(&leader, Request::AddPeer(joiner.clone()));
        cluster.deliver();
        for _ in 0..4 {
            cluster.heartbeat(&leader);
        }

        let expect: Vec<Vec<u8>> = (1..=6u8).map(|i| vec![i]).collect();
        assert_eq!(cluster.ledgers[&joiner].list(), expect);
        assert_eq!(cluster.nodes[&joiner].members().len(), 2);
    }
}
