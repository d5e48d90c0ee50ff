use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::{ClientCore, RaftClient};
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::types::RaftMemberInfo;
use crate::commitlog::{FileLog, InMemoryLog, Log, StorageError};
use crate::context::{AppliedState, ContextPool};
use crate::replica::{
    self, ClusterTracker, FileLocalState, GrpcPeerConnector, PeerConnector, PersistentLocalState, Replica,
    ReplicaConfig, ReplicaId, ReplicaMetadata, SnapshotStore, VolatileLocalState, WriteAheadLogEntry,
};
use crate::server::{self, LocalNetwork, LocalPeerConnector, RpcServer};
use crate::state_machine::{ClusterState, PendingCommands, StateMachineApplier};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

const LOG_FILE_NAME: &str = "log";
const TERM_STATE_FILE_NAME: &str = "term_state";
const SNAPSHOT_FILE_NAME: &str = "snapshot";

const ACTOR_QUEUE_SIZE: usize = 64;

pub struct RaftClientConfig {
    pub my_replica_id: String,
    /// Address peers use to reach us. Looked up in `cluster_members` when `None`, which is only
    /// possible for nodes that are part of the bootstrap membership.
    pub my_address: Option<String>,
    /// Bootstrap membership. On restart, the snapshot and the committed log entries on disk build
    /// the membership on top of it.
    pub cluster_members: Vec<RaftMemberInfo>,
    /// Where the log, term state and snapshot live. `None` keeps everything in memory.
    pub data_directory: Option<PathBuf>,
    pub transport: RaftTransport,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

/// How replicas reach each other.
#[derive(Clone)]
pub enum RaftTransport {
    /// tonic server bound to our address, tonic clients to every peer.
    Grpc,
    /// In-process calls through a shared `LocalNetwork`.
    Local(LocalNetwork),
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("No address for {0}. It isn't in the cluster config, so `my_address` is required.")]
    MissingAddress(String),
    #[error("Can't bind to {0:?}")]
    InvalidAddress(String),
    // Includes corruption, which is fatal: a node with a damaged log must not vote.
    #[error("Storage initialization failure: {0}")]
    Storage(#[from] StorageError),
}

/// Validated inputs shared by the file backed and in-memory startup paths.
struct ReplicaWiring {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    my_address: String,
    cluster_members: Vec<RaftMemberInfo>,
    transport: RaftTransport,
    options: RaftOptionsValidated,
}

pub async fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let RaftClientConfig {
        my_replica_id,
        my_address,
        cluster_members,
        data_directory,
        transport,
        info_logger,
        options,
    } = config;

    let options = RaftOptionsValidated::try_from(options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;
    validate_cluster_members(&cluster_members)?;
    let my_address = my_address
        .or_else(|| my_info(&my_replica_id, &cluster_members).map(|member| member.address.clone()))
        .ok_or_else(|| RaftClientCreationError::MissingAddress(my_replica_id.clone()))?;
    if let RaftTransport::Grpc = transport {
        raft_rpc_server_addr(&my_address)?;
    }

    let wiring = ReplicaWiring {
        logger: info_logger.new(slog::o!("Replica" => my_replica_id.clone())),
        my_replica_id: ReplicaId::new(my_replica_id),
        my_address,
        cluster_members,
        transport,
        options,
    };

    match data_directory {
        Some(directory) => {
            fs::create_dir_all(&directory).map_err(StorageError::from)?;
            let log: FileLog<WriteAheadLogEntry> = FileLog::open(directory.join(LOG_FILE_NAME))?;
            let local_state = FileLocalState::open(
                directory.join(TERM_STATE_FILE_NAME),
                wiring.my_replica_id.clone(),
            )?;
            let snapshot_store = SnapshotStore::open(directory.join(SNAPSHOT_FILE_NAME))?;
            slog::info!(wiring.logger, "Opened durable storage in {:?}", directory);

            start_replica(wiring, log, Box::new(local_state), snapshot_store)
        }
        None => {
            let log: InMemoryLog<WriteAheadLogEntry> = InMemoryLog::create();
            let local_state = VolatileLocalState::new(wiring.my_replica_id.clone());
            start_replica(wiring, log, Box::new(local_state), SnapshotStore::volatile())
        }
    }
}

fn start_replica<L>(
    wiring: ReplicaWiring,
    log: L,
    local_state: Box<dyn PersistentLocalState>,
    snapshot_store: SnapshotStore,
) -> Result<RaftClient, RaftClientCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
{
    let ReplicaWiring {
        logger,
        my_replica_id,
        my_address,
        cluster_members,
        transport,
        options,
    } = wiring;

    // A snapshot on disk supersedes the bootstrap config: it holds both the state and the
    // membership as of its last included entry.
    let snapshot = snapshot_store.latest().cloned();
    let (initial_state, initial_members) = match &snapshot {
        Some(snapshot) => {
            let state = ClusterState::restore(&snapshot.data)
                .map_err(|e| StorageError::Corruption(format!("unreadable snapshot: {}", e)))?;
            slog::info!(
                logger,
                "Restoring from snapshot at {:?}",
                snapshot.metadata.last_included_index
            );
            let applied = AppliedState {
                state,
                last_applied: Some((
                    snapshot.metadata.last_included_index,
                    snapshot.metadata.last_included_term,
                )),
            };
            (applied, snapshot.metadata.membership.clone())
        }
        None => {
            let members: Vec<ReplicaMetadata> = cluster_members.into_iter().map(ReplicaMetadata::from).collect();
            let state = ClusterState::bootstrap(
                members
                    .iter()
                    .map(|member| (member.replica_id().as_str().to_string(), member.address().to_string())),
            );
            let applied = AppliedState {
                state,
                last_applied: None,
            };
            (applied, members)
        }
    };

    let (write_ahead_log, commit_stream) = replica::wired(
        logger.clone(),
        log,
        snapshot.as_ref().map(|snapshot| &snapshot.metadata),
        local_state.commit_index(),
    )?;

    let pool = ContextPool::new(initial_state, options.read_context_pool_size);
    let pending_commands = PendingCommands::new();
    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);

    let connector: Arc<dyn PeerConnector> = match &transport {
        RaftTransport::Grpc => Arc::new(GrpcPeerConnector::new(logger.clone())),
        RaftTransport::Local(network) => Arc::new(LocalPeerConnector::new(
            network.clone(),
            my_replica_id.as_str().to_string(),
        )),
    };
    let cluster_tracker = ClusterTracker::new(my_replica_id.clone(), initial_members, connector);

    let (server_shutdown_handle, grpc_server, local_network) = match transport {
        RaftTransport::Grpc => {
            let socket_addr = raft_rpc_server_addr(&my_address)?;
            let (handle, signal) = server::shutdown_signal();
            (Some(handle), Some((socket_addr, signal)), None)
        }
        RaftTransport::Local(network) => (None, None, Some(network)),
    };

    let (mut replica, election_listener) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        cluster_tracker,
        write_ahead_log,
        local_state,
        snapshot_store,
        pending_commands: pending_commands.clone(),
        actor_client: actor_client.weak(),
        server_shutdown_handle,
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        follower_min_timeout: options.follower_min_timeout,
        follower_max_timeout: options.follower_max_timeout,
        append_entries_timeout: options.leader_append_entries_timeout,
        max_entries_per_append: options.max_entries_per_append,
    });

    // Peers can't reach us before this, so nothing votes on a stale configuration.
    replica.replay_committed_entries()?;

    let rpc_server = RpcServer::new(logger.clone(), actor_client.weak());
    if let Some((socket_addr, signal)) = grpc_server {
        tokio::spawn(rpc_server.run(socket_addr, signal));
    } else if let Some(network) = &local_network {
        network.register(my_replica_id.as_str(), rpc_server);
    }

    let replica_actor = ReplicaActor::new(logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    let applier = StateMachineApplier::new(
        logger.new(slog::o!("Component" => "Applier")),
        commit_stream,
        pool.clone(),
        pending_commands,
        actor_client.weak(),
        options.snapshot_threshold,
    );
    tokio::spawn(applier.run());

    slog::info!(logger, "Replica started at {}", my_address);

    let core = ClientCore {
        my_replica_id,
        actor_client,
        pool,
        election_listener,
        command_timeout: options.command_timeout,
    };

    Ok(RaftClient::new(core, local_network))
}

fn validate_cluster_members(cluster_members: &[RaftMemberInfo]) -> Result<(), RaftClientCreationError> {
    if cluster_members.is_empty() {
        return Err(RaftClientCreationError::InvalidClusterInfo(
            "cluster needs at least one member".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(cluster_members.len());
    for member in cluster_members {
        if member.replica_id.is_empty() {
            return Err(RaftClientCreationError::InvalidClusterInfo(
                "member with empty replica id".to_string(),
            ));
        }
        if !seen.insert(member.replica_id.as_str()) {
            return Err(RaftClientCreationError::InvalidClusterInfo(format!(
                "replica id {} listed twice",
                member.replica_id
            )));
        }
    }

    Ok(())
}

fn my_info<'a>(my_replica_id: &'_ str, cluster_members: &'a [RaftMemberInfo]) -> Option<&'a RaftMemberInfo> {
    cluster_members
        .iter()
        .find(|member_info| member_info.replica_id == my_replica_id)
}

fn raft_rpc_server_addr(address: &str) -> Result<SocketAddr, RaftClientCreationError> {
    address
        .parse()
        .map_err(|_| RaftClientCreationError::InvalidAddress(address.to_string()))
}
