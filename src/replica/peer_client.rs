use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::replica::peers::ReplicaMetadata;
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

/// PeerClient is how a replica calls the raft RPCs of another member. Implemented over gRPC for
/// real deployments and in-process for embedded clusters.
#[async_trait::async_trait]
pub(crate) trait PeerClient: Send + Sync {
    async fn request_vote(&self, request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status>;
    async fn append_entries(&self, request: ProtoAppendEntriesReq) -> Result<ProtoAppendEntriesResult, Status>;
    async fn install_snapshot(&self, request: ProtoInstallSnapshotReq) -> Result<ProtoInstallSnapshotResult, Status>;
}

/// PeerConnector creates clients for members as they join the configuration.
pub(crate) trait PeerConnector: Send + Sync {
    fn connect(&self, member: &ReplicaMetadata) -> Arc<dyn PeerClient>;
}

pub(crate) struct GrpcPeerConnector {
    logger: slog::Logger,
}

impl GrpcPeerConnector {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        GrpcPeerConnector { logger }
    }
}

impl PeerConnector for GrpcPeerConnector {
    fn connect(&self, member: &ReplicaMetadata) -> Arc<dyn PeerClient> {
        let url = format!("http://{}", member.address());
        slog::info!(self.logger, "Lazily connecting to {:?} at {}", member.replica_id(), url);

        // Channels connect lazily and reconnect on their own, so a peer that is down at startup
        // is simply unavailable until it comes up.
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|e| e.to_string())
            .and_then(|endpoint| endpoint.connect_lazy().map_err(|e| e.to_string()));

        match channel {
            Ok(channel) => Arc::new(GrpcPeerClient {
                inner: GrpcRaftClient::new(channel),
            }),
            Err(e) => {
                slog::error!(self.logger, "Peer address {} is unusable: {}", url, e);
                Arc::new(UnreachablePeerClient { reason: e })
            }
        }
    }
}

struct GrpcPeerClient {
    inner: GrpcRaftClient<Channel>,
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn request_vote(&self, request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let mut client = self.inner.clone();
        client.request_vote(request).await.map(|r| r.into_inner())
    }

    async fn append_entries(&self, request: ProtoAppendEntriesReq) -> Result<ProtoAppendEntriesResult, Status> {
        let mut client = self.inner.clone();
        client.append_entries(request).await.map(|r| r.into_inner())
    }

    async fn install_snapshot(&self, request: ProtoInstallSnapshotReq) -> Result<ProtoInstallSnapshotResult, Status> {
        let mut client = self.inner.clone();
        client.install_snapshot(request).await.map(|r| r.into_inner())
    }
}

struct UnreachablePeerClient {
    reason: String,
}

#[async_trait::async_trait]
impl PeerClient for UnreachablePeerClient {
    async fn request_vote(&self, _: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        Err(Status::unavailable(self.reason.clone()))
    }

    async fn append_entries(&self, _: ProtoAppendEntriesReq) -> Result<ProtoAppendEntriesResult, Status> {
        Err(Status::unavailable(self.reason.clone()))
    }

    async fn install_snapshot(&self, _: ProtoInstallSnapshotReq) -> Result<ProtoInstallSnapshotResult, Status> {
        Err(Status::unavailable(self.reason.clone()))
    }
}
