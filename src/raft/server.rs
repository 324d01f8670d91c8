use super::{
    Envelope, Log, Members, Message, Node, NodeID, Options, Request, RequestID, Response,
    SnapshotStore, State, TICK_INTERVAL,
};
use crate::encoding::bincode;
use crate::error::Result;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The delay before reconnecting to an unreachable peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The capacity of a peer's outbound message buffer. Messages are dropped
/// when full; the protocol recovers via heartbeats and probes.
const PEER_BUFFER: usize = 1000;

/// How long an on-demand connection to a non-member is kept after its last
/// message. A joining node must respond to a leader that is not yet in its
/// own membership view; the connection persists once the membership entries
/// apply.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// An outbound peer connection: a buffered channel to its sender thread.
struct Peer {
    tx: Sender<Envelope>,
    last_send: std::time::Instant,
}

/// A client request paired with a reply channel.
pub type ClientRequest = (Request, Sender<Result<Response>>);

/// A consensus server: the node event loop plus the TCP transport towards
/// its peers. The peer connection set follows the replicated membership, so
/// peers added or removed at runtime are picked up without restarts.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    members: Arc<Members>,
}

impl Server {
    /// Creates a new server. The local node address in the membership is the
    /// advertised address that peers dial.
    pub fn new(
        members: Arc<Members>,
        log: Log,
        state: Box<dyn State>,
        snapshots: SnapshotStore,
        opts: Options,
        bootstrap: bool,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(members.clone(), log, state, snapshots, node_tx, opts, bootstrap)?;
        Ok(Self { node, node_rx, members })
    }

    /// Serves consensus RPCs and client requests until the client channel
    /// disconnects, which initiates shutdown. Leadership transitions are
    /// published on leader_tx and mirrored in is_leader.
    pub fn serve(
        self,
        listener: TcpListener,
        client_rx: Receiver<ClientRequest>,
        leader_tx: Sender<bool>,
        is_leader: Arc<AtomicBool>,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Serving consensus RPCs on {addr}");

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tcp_in_tx, tcp_in_rx) = crossbeam::channel::unbounded();
        {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || Self::tcp_receive(listener, tcp_in_tx, shutdown));
        }

        let result = Self::eventloop(
            self.node,
            self.members,
            self.node_rx,
            tcp_in_rx,
            client_rx,
            leader_tx,
            is_leader,
        );

        // Unblock the accept loop so its thread can exit.
        shutdown.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(addr);
        result
    }

    /// Runs the event loop: ticks the node, steps inbound messages, submits
    /// client requests, and routes outbound messages to peers or local
    /// clients.
    fn eventloop(
        mut node: Node,
        members: Arc<Members>,
        node_rx: Receiver<Envelope>,
        tcp_rx: Receiver<Envelope>,
        client_rx: Receiver<ClientRequest>,
        leader_tx: Sender<bool>,
        is_leader: Arc<AtomicBool>,
    ) -> Result<()> {
        let id = node.id().clone();
        let ticker = crossbeam::channel::tick(TICK_INTERVAL);
        let mut requests: HashMap<RequestID, Sender<Result<Response>>> = HashMap::new();
        let mut peer_txs: HashMap<NodeID, Peer> = HashMap::new();

        let mut was_leader = node.is_leader();
        is_leader.store(was_leader, Ordering::Relaxed);
        if was_leader {
            // A bootstrapped single node starts out as leader.
            let _ = leader_tx.send(true);
        }
        Self::sync_peers(&members, &mut peer_txs);

        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => node = node.tick()?,

                recv(tcp_rx) -> msg => node = node.step(msg?)?,

                recv(client_rx) -> request => {
                    let Ok((request, response_tx)) = request else {
                        // The client handle was dropped: shut down.
                        break;
                    };
                    let request_id = uuid::Uuid::new_v4().as_bytes().to_vec();
                    requests.insert(request_id.clone(), response_tx);
                    let term = node.term();
                    node = node.step(Envelope {
                        from: id.clone(),
                        to: id.clone(),
                        term,
                        message: Message::ClientRequest { id: request_id, request },
                    })?;
                },

                recv(node_rx) -> msg => {
                    let msg = msg?;
                    if msg.to == id {
                        match msg.message {
                            Message::ClientResponse { id: request_id, response } => {
                                if let Some(response_tx) = requests.remove(&request_id) {
                                    // The caller may have given up, ignore.
                                    let _ = response_tx.send(response);
                                }
                            }
                            message => panic!("unexpected local message {message:?}"),
                        }
                    } else {
                        // Connections are opened on demand: the destination
                        // may not be a member yet (e.g. responding to a
                        // leader that is still replicating the membership to
                        // us).
                        let peer = peer_txs
                            .entry(msg.to.clone())
                            .or_insert_with_key(|addr| Self::connect_peer(addr.clone()));
                        peer.last_send = std::time::Instant::now();
                        match peer.tx.try_send(msg) {
                            Ok(()) => {}
                            Err(TrySendError::Full(msg)) => {
                                debug!("Full send buffer for peer {}, discarding", msg.to)
                            }
                            Err(TrySendError::Disconnected(_)) => {}
                        }
                    }
                },
            }

            // Track leadership transitions, and keep the peer connections in
            // agreement with the membership (which changes as entries apply).
            if node.is_leader() != was_leader {
                was_leader = node.is_leader();
                is_leader.store(was_leader, Ordering::Relaxed);
                if leader_tx.send(was_leader).is_err() {
                    debug!("No leader change watcher, ignoring");
                }
            }
            Self::sync_peers(&members, &mut peer_txs);
        }
        Ok(())
    }

    /// Keeps the peer connections in agreement with the membership: members
    /// get persistent connections, on-demand connections to non-members are
    /// dropped once idle. Dropping the channel makes the sender thread exit.
    fn sync_peers(members: &Members, peer_txs: &mut HashMap<NodeID, Peer>) {
        let peers = members.peers();
        let now = std::time::Instant::now();
        peer_txs.retain(|id, peer| {
            peers.contains(id) || now.duration_since(peer.last_send) < IDLE_TIMEOUT
        });
        for addr in peers {
            if !peer_txs.contains_key(&addr) {
                let peer = Self::connect_peer(addr.clone());
                peer_txs.insert(addr, peer);
            }
        }
    }

    /// Spawns a sender thread for a peer, returning its connection handle.
    fn connect_peer(addr: NodeID) -> Peer {
        let (tx, rx) = crossbeam::channel::bounded(PEER_BUFFER);
        std::thread::spawn(move || Self::tcp_send_peer(addr, rx));
        Peer { tx, last_send: std::time::Instant::now() }
    }

    /// Accepts inbound peer connections, spawning a receiver thread each.
    fn tcp_receive(listener: TcpListener, in_tx: Sender<Envelope>, shutdown: Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                    let peer_in_tx = in_tx.clone();
                    std::thread::spawn(move || {
                        debug!("Peer {peer} connected");
                        match Self::tcp_receive_peer(stream, peer_in_tx) {
                            Ok(()) => debug!("Peer {peer} disconnected"),
                            Err(err) => debug!("Peer {peer} error: {err}"),
                        }
                    });
                }
                Err(err) => error!("Peer accept failed: {err}"),
            }
        }
    }

    /// Receives inbound messages from a peer connection, as length-prefixed
    /// Bincode frames.
    fn tcp_receive_peer(mut stream: TcpStream, in_tx: Sender<Envelope>) -> Result<()> {
        loop {
            let mut len = [0u8; 4];
            match stream.read_exact(&mut len) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut frame)?;
            let envelope: Envelope = bincode::deserialize(&frame)?;
            if in_tx.send(envelope).is_err() {
                return Ok(()); // the server is shutting down
            }
        }
    }

    /// Sends outbound messages to a peer, reconnecting on failure. Exits
    /// when the channel disconnects. Messages that can't be sent are
    /// dropped; the protocol recovers via heartbeats and probes.
    fn tcp_send_peer(addr: NodeID, rx: Receiver<Envelope>) {
        let mut stream: Option<TcpStream> = None;
        while let Ok(envelope) = rx.recv() {
            if stream.is_none() {
                match TcpStream::connect(&addr) {
                    Ok(s) => {
                        debug!("Connected to peer {addr}");
                        stream = Some(s);
                    }
                    Err(err) => {
                        debug!("Failed connecting to peer {addr}: {err}");
                        std::thread::sleep(RECONNECT_DELAY);
                        continue;
                    }
                }
            }
            let frame = bincode::serialize(&envelope);
            let result = (|| -> Result<()> {
                let stream = stream.as_mut().expect("no stream");
                stream.write_all(&(frame.len() as u32).to_be_bytes())?;
                stream.write_all(&frame)?;
                Ok(())
            })();
            if let Err(err) = result {
                debug!("Failed sending to peer {addr}: {err}");
                stream = None;
            }
        }
        debug!("Disconnected from peer {addr}");
    }
}
