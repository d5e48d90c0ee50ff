use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::replica::{PeerClient, PeerConnector, ReplicaMetadata};
use crate::server::RpcServer;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tonic::Status;

/// LocalNetwork connects replicas running in the same process without sockets. Replicas are
/// addressed by replica id. Links can be cut to simulate partitions.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    servers: HashMap<String, RpcServer>,
    isolated: HashSet<String>,
    // (from, to)
    blocked_links: HashSet<(String, String)>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, replica_id: &str, server: RpcServer) {
        self.lock().servers.insert(replica_id.to_string(), server);
    }

    pub(crate) fn deregister(&self, replica_id: &str) {
        self.lock().servers.remove(replica_id);
    }

    /// Cuts every link to and from `replica_id`.
    pub fn isolate(&self, replica_id: &str) {
        self.lock().isolated.insert(replica_id.to_string());
    }

    /// Restores every link to and from `replica_id`.
    pub fn heal(&self, replica_id: &str) {
        let mut state = self.lock();
        state.isolated.remove(replica_id);
        state
            .blocked_links
            .retain(|(from, to)| from != replica_id && to != replica_id);
    }

    /// Drops requests from `from` to `to`, and replies travelling the same direction.
    pub fn block_link(&self, from: &str, to: &str) {
        self.lock().blocked_links.insert((from.to_string(), to.to_string()));
    }

    fn route(&self, from: &str, to: &str) -> Result<RpcServer, Status> {
        let state = self.lock();
        if !state.can_reach(from, to) {
            return Err(Status::unavailable(format!("{} can't reach {}", from, to)));
        }

        state
            .servers
            .get(to)
            .cloned()
            .ok_or_else(|| Status::unavailable(format!("{} is not running", to)))
    }

    fn check_reply_path(&self, from: &str, to: &str) -> Result<(), Status> {
        if self.lock().can_reach(to, from) {
            Ok(())
        } else {
            Err(Status::unavailable(format!("Reply from {} to {} was lost", to, from)))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().expect("LocalNetwork mutex guard poison")
    }
}

impl NetworkState {
    fn can_reach(&self, from: &str, to: &str) -> bool {
        !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.blocked_links.contains(&(from.to_string(), to.to_string()))
    }
}

pub(crate) struct LocalPeerConnector {
    network: LocalNetwork,
    my_replica_id: String,
}

impl LocalPeerConnector {
    pub(crate) fn new(network: LocalNetwork, my_replica_id: String) -> Self {
        LocalPeerConnector {
            network,
            my_replica_id,
        }
    }
}

impl PeerConnector for LocalPeerConnector {
    fn connect(&self, member: &ReplicaMetadata) -> Arc<dyn PeerClient> {
        Arc::new(LocalPeerClient {
            network: self.network.clone(),
            from: self.my_replica_id.clone(),
            to: member.replica_id().as_str().to_string(),
        })
    }
}

struct LocalPeerClient {
    network: LocalNetwork,
    from: String,
    to: String,
}

#[async_trait::async_trait]
impl PeerClient for LocalPeerClient {
    async fn request_vote(&self, request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let server = self.network.route(&self.from, &self.to)?;
        let reply = server.handle_request_vote(request).await?;
        self.network.check_reply_path(&self.from, &self.to)?;
        Ok(reply)
    }

    async fn append_entries(&self, request: ProtoAppendEntriesReq) -> Result<ProtoAppendEntriesResult, Status> {
        let server = self.network.route(&self.from, &self.to)?;
        let reply = server.handle_append_entries(request).await?;
        self.network.check_reply_path(&self.from, &self.to)?;
        Ok(reply)
    }

    async fn install_snapshot(&self, request: ProtoInstallSnapshotReq) -> Result<ProtoInstallSnapshotResult, Status> {
        let server = self.network.route(&self.from, &self.to)?;
        let reply = server.handle_install_snapshot(request).await?;
        self.network.check_reply_path(&self.from, &self.to)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_and_blocked_links() {
        let network = LocalNetwork::new();
        {
            let state = network.lock();
            assert!(state.can_reach("a", "b"));
        }

        network.block_link("a", "b");
        assert!(!network.lock().can_reach("a", "b"));
        assert!(network.lock().can_reach("b", "a"));

        network.isolate("c");
        assert!(!network.lock().can_reach("a", "c"));
        assert!(!network.lock().can_reach("c", "b"));

        network.heal("a");
        network.heal("c");
        assert!(network.lock().can_reach("a", "b"));
        assert!(network.lock().can_reach("c", "b"));
    }

    #[test]
    fn unregistered_replica_is_unavailable() {
        let network = LocalNetwork::new();
        let status = network.route("a", "b").err().expect("route should fail");
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
