use crate::api::event_bus::RaftElectionState;
use crate::context::PoolStats;
use crate::replica;
use crate::state_machine::CommandOutput;

/// A cluster member as the application sees it. `address` is `host:port` of the member's raft
/// RPC endpoint when running over gRPC, and informational otherwise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    pub address: String,
}

impl From<RaftMemberInfo> for replica::ReplicaMetadata {
    fn from(member_info: RaftMemberInfo) -> Self {
        Self::new(replica::ReplicaId::new(member_info.replica_id), member_info.address)
    }
}

impl From<&replica::ReplicaMetadata> for RaftMemberInfo {
    fn from(metadata: &replica::ReplicaMetadata) -> Self {
        RaftMemberInfo {
            replica_id: metadata.replica_id().as_str().to_string(),
            address: metadata.address().to_string(),
        }
    }
}

/// Where to send writes when this node isn't leader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    pub address: String,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            address: internal_leader.address,
        }
    }
}

/// How fresh a read must be.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadMode {
    /// Goes through the leader's log first, so the read observes every write that completed
    /// before it started. Fails on followers with a leader redirect.
    Linearizable,
    /// Reads whatever this node has applied so far. May be stale, works on any node.
    LocalSnapshot,
}

/// A command that made it into the state machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitResult {
    pub applied_index: u64,
    pub value: CommandOutput,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContextPoolStats {
    pub max_open_reads: usize,
    pub reads_in_flight: usize,
    pub reads_opened: u64,
    pub writes_committed: u64,
    pub writes_rolled_back: u64,
}

impl From<PoolStats> for ContextPoolStats {
    fn from(stats: PoolStats) -> Self {
        ContextPoolStats {
            max_open_reads: stats.max_open_reads,
            reads_in_flight: stats.reads_in_flight,
            reads_opened: stats.reads_opened,
            writes_committed: stats.writes_committed,
            writes_rolled_back: stats.writes_rolled_back,
        }
    }
}

/// Point-in-time view of the local replica, for operators and tests.
#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub replica_id: String,
    pub term: u64,
    pub election_state: RaftElectionState,
    pub commit_index: Option<u64>,
    pub applied_index: Option<u64>,
    pub first_log_index: u64,
    pub last_log_index: Option<u64>,
    pub snapshot_index: Option<u64>,
    /// Configuration the replica is running with: the latest membership it knows to be committed.
    pub members: Vec<RaftMemberInfo>,
    pub context_pool: ContextPoolStats,
}

impl RaftStatus {
    pub(crate) fn new(status: replica::ReplicaStatus, applied_index: Option<u64>, pool: PoolStats) -> Self {
        RaftStatus {
            replica_id: status.replica_id.into_inner(),
            term: status.term.as_u64(),
            election_state: RaftElectionState::from(status.election_state),
            commit_index: status.commit_index.map(|i| i.as_u64()),
            applied_index,
            first_log_index: status.first_log_index.as_u64(),
            last_log_index: status.last_log_index.map(|i| i.as_u64()),
            snapshot_index: status.snapshot_index.map(|i| i.as_u64()),
            members: status.members.iter().map(RaftMemberInfo::from).collect(),
            context_pool: ContextPoolStats::from(pool),
        }
    }
}
