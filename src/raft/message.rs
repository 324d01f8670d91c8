use super::{Entry, Index, NodeID, Term};
use crate::encoding;
use crate::error::Result;
use crate::storage;

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A message envelope sent between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender's current term.
    pub term: Term,
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The message payload.
    pub message: Message,
}

/// A message passed between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates campaign for leadership by soliciting votes from peers.
    Campaign {
        /// The index of the candidate's last stored log entry.
        last_index: Index,
        /// The term of the candidate's last stored log entry.
        last_term: Term,
    },

    /// Followers may grant a single vote per term, on a first-come basis.
    /// Candidates implicitly vote for themselves.
    CampaignResponse {
        /// Whether the vote was granted.
        vote: bool,
    },

    /// Leaders send periodic heartbeats to their followers.
    Heartbeat {
        /// The index of the leader's last log entry. Always has the
        /// leader's term.
        last_index: Index,
        /// The index of the leader's last committed log entry.
        commit_index: Index,
    },

    /// Followers respond to leader heartbeats.
    HeartbeatResponse {
        /// If non-zero, the follower's log matches the leader's last_index.
        match_index: Index,
    },

    /// Leaders replicate log entries to followers.
    Append {
        /// The index of the log entry immediately preceding the entries.
        base_index: Index,
        /// The term of the base entry.
        base_term: Term,
        /// The entries to replicate.
        entries: Vec<Entry>,
    },

    /// Followers accept or reject appends, depending on whether the base
    /// entry matches their log.
    AppendResponse {
        /// The index of the last appended entry, or 0 on rejection.
        match_index: Index,
        /// The base index of the rejected append, or 0 on success.
        reject_index: Index,
    },

    /// Leaders install a full state snapshot on followers whose next entry
    /// has already been compacted away.
    InstallSnapshot {
        /// The log index the snapshot covers.
        index: Index,
        /// The term of the entry at that index.
        term: Term,
        /// The cluster membership as of the snapshot. Membership changes are
        /// log entries, so a compacted log must carry them here.
        members: Vec<NodeID>,
        /// The serialized state machine.
        data: Vec<u8>,
    },

    /// Followers confirm an installed snapshot.
    InstallSnapshotResponse {
        /// The snapshot index now covering the follower's log.
        last_index: Index,
    },

    /// A client request, submitted to the local node. Followers forward it
    /// to their leader, or abort if there is none.
    ClientRequest {
        /// The request ID, globally unique for the request duration.
        id: RequestID,
        /// The request.
        request: Request,
    },

    /// A client response, returned along the forwarding path.
    ClientResponse {
        /// The response ID, matching the request.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

/// A client request ID.
pub type RequestID = Vec<u8>;

/// A client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Applies a state machine command.
    Mutate(Vec<u8>),
    /// Adds a node to the cluster.
    AddPeer(NodeID),
    /// Removes a node from the cluster.
    RemovePeer(NodeID),
    /// Fetches node status.
    Status,
}

/// A client response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Mutate(Vec<u8>),
    AddPeer(NodeID),
    RemovePeer(NodeID),
    Status(Status),
}

/// A command at the consensus layer: either an opaque state machine command
/// or a cluster membership change. Both are replicated and committed through
/// the log, so that every node converges on the same membership at the same
/// log position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// An opaque state machine command.
    Command(Vec<u8>),
    /// Adds a node to the cluster membership.
    AddPeer(NodeID),
    /// Removes a node from the cluster membership.
    RemovePeer(NodeID),
}

impl encoding::Value for Operation {}

/// Cluster status, as seen by the leader that served the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The current leader.
    pub leader: NodeID,
    /// The current term.
    pub term: Term,
    /// The cluster membership.
    pub members: Vec<NodeID>,
    /// The match indexes of all nodes.
    pub match_index: BTreeMap<NodeID, Index>,
    /// The current commit index.
    pub commit_index: Index,
    /// The current applied index.
    pub applied_index: Index,
    /// The log storage engine status.
    pub storage: storage::Status,
}
