use super::server::ClientRequest;
use super::{NodeID, Request, Response, Status};
use crate::errdata;
use crate::error::{Error, Result};

use crossbeam::channel::Sender;

/// A client handle for the local consensus server, submitting requests over
/// a channel shared with its event loop. Cloneable and thread-safe; each
/// request gets its own reply channel. When the server is gone, requests
/// fail with Abort.
#[derive(Clone)]
pub struct Client {
    tx: Sender<ClientRequest>,
}

impl Client {
    /// Creates a new client using the given request channel.
    pub fn new(tx: Sender<ClientRequest>) -> Self {
        Self { tx }
    }

    /// Submits a request and blocks until the response arrives.
    fn call(&self, request: Request) -> Result<Response> {
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        self.tx.send((request, response_tx)).map_err(|_| Error::Abort)?;
        response_rx.recv().map_err(|_| Error::Abort)?
    }

    /// Applies a state machine command, blocking until it has been
    /// committed, applied, and reconciled (or failed).
    pub fn mutate(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        match self.call(Request::Mutate(command))? {
            Response::Mutate(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Adds a node to the cluster. A no-op if it is already a member.
    pub fn add_peer(&self, peer: NodeID) -> Result<()> {
        match self.call(Request::AddPeer(peer))? {
            Response::AddPeer(_) => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Removes a node from the cluster. Errors with NotFound if it is not a
    /// member.
    pub fn remove_peer(&self, peer: NodeID) -> Result<()> {
        match self.call(Request::RemovePeer(peer))? {
            Response::RemovePeer(_) => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches cluster status from the leader.
    pub fn status(&self) -> Result<Status> {
        match self.call(Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}
