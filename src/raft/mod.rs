//! The consensus runtime: a compact Raft implementation replicating the
//! balancer catalog. The state machine (see fsm) plugs in through the State
//! trait; the log and stable state live in a storage engine, snapshots in a
//! file store, and the membership in a peers.json manifest. Membership
//! changes are replicated through the log itself.

mod client;
mod log;
mod members;
mod message;
mod node;
mod server;
mod snapshot;
mod state;

pub use client::Client;
pub use log::{Entry, Index, Log};
pub use members::Members;
pub use message::{Envelope, Message, Operation, Request, RequestID, Response, Status};
pub use node::{Node, NodeID, Options, Term, Ticks};
pub use server::{ClientRequest, Server};
pub use snapshot::{Snapshot, SnapshotStore};
pub use state::State;

#[cfg(test)]
pub use state::test as state_test;

/// The interval between ticks, the unit of time for heartbeats and
/// elections.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The number of ticks between leader heartbeats.
const HEARTBEAT_INTERVAL: Ticks = 4;

/// The randomized election timeout range (min-max), in ticks. Randomized to
/// avoid ties.
const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum number of entries in a single Append message.
const MAX_APPEND_ENTRIES: usize = 64;

/// The number of applied entries between snapshots.
const SNAPSHOT_INTERVAL: u64 = 1024;
