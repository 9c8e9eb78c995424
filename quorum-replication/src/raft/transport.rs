use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use parking_lot::RwLock;
use quorum_common::types::NodeId;
use quorum_common::{QuorumError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Outbound RPC client used by the replication drivers.
pub trait RaftTransport: Send + Sync {
    /// (Re)establishes the connection to `peer`.
    fn connect(&self, peer: &str) -> Result<()>;
    fn request_vote(&self, peer: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse>;
    fn append_entries(&self, peer: &str, req: AppendEntriesRequest)
        -> Result<AppendEntriesResponse>;
}

/// Inbound dispatch for the two consensus RPCs.
pub trait RaftService: Send + Sync {
    fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse>;
    fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
}

#[derive(Default)]
struct Routes {
    services: HashMap<NodeId, Weak<dyn RaftService>>,
    isolated: HashSet<NodeId>,
    unresponsive: HashSet<NodeId>,
}

/// In-process network connecting nodes of a simulated cluster, with
/// partition and timeout injection.
#[derive(Default)]
pub struct LocalNetwork {
    routes: RwLock<Routes>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: &str, service: Arc<dyn RaftService>) {
        self.routes
            .write()
            .services
            .insert(id.to_string(), Arc::downgrade(&service));
    }

    /// Client handle whose calls originate from `from`.
    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: Arc::clone(self),
            from: from.to_string(),
        })
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: &str) {
        self.routes.write().isolated.insert(id.to_string());
    }

    /// Restores every link, including unresponsive nodes.
    pub fn heal(&self) {
        let mut routes = self.routes.write();
        routes.isolated.clear();
        routes.unresponsive.clear();
    }

    /// Connections to and from `id` succeed but every RPC times out.
    pub fn set_unresponsive(&self, id: &str, unresponsive: bool) {
        let mut routes = self.routes.write();
        if unresponsive {
            routes.unresponsive.insert(id.to_string());
        } else {
            routes.unresponsive.remove(id);
        }
    }

    fn route(&self, from: &str, to: &str, connect_only: bool) -> Result<Arc<dyn RaftService>> {
        let routes = self.routes.read();
        if routes.isolated.contains(from) || routes.isolated.contains(to) {
            return Err(QuorumError::Disconnected(to.to_string()));
        }
        let service = routes
            .services
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| QuorumError::Disconnected(to.to_string()))?;
        if !connect_only && (routes.unresponsive.contains(from) || routes.unresponsive.contains(to))
        {
            return Err(QuorumError::Rpc(format!("request to {} timed out", to)));
        }
        Ok(service)
    }
}

/// Pushes a message through the wire codec so in-process calls see exactly
/// what a remote peer would.
fn over_wire<T: Serialize + DeserializeOwned>(msg: &T) -> Result<T> {
    let bytes = bincode::serialize(msg)?;
    Ok(bincode::deserialize(&bytes)?)
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: NodeId,
}

impl RaftTransport for LocalTransport {
    fn connect(&self, peer: &str) -> Result<()> {
        self.network.route(&self.from, peer, true).map(|_| ())
    }

    fn request_vote(&self, peer: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let service = self.network.route(&self.from, peer, false)?;
        trace!(from = %self.from, peer, term = req.term, "request_vote");
        let resp = service.request_vote(over_wire(&req)?)?;
        over_wire(&resp)
    }

    fn append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let service = self.network.route(&self.from, peer, false)?;
        trace!(from = %self.from, peer, prev = req.prev_log_index, "append_entries");
        let resp = service.append_entries(over_wire(&req)?)?;
        over_wire(&resp)
    }
}
