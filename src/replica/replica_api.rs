use crate::commitlog::{Index, StorageError};
use crate::replica::election::ElectionStateSnapshot;
use crate::replica::local_state::Term;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::snapshot::SnapshotMetadata;
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLogEntry};
use crate::state_machine::CommandWaiter;
use bytes::Bytes;

pub(crate) struct EnqueueForReplicationInput {
    pub(crate) kind: EntryKind,
    pub(crate) data: Vec<u8>,
    // Resolved by the applier once the entry is applied (or known lost).
    pub(crate) waiter: Option<CommandWaiter>,
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    pub(crate) enqueued_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("A configuration change is already in flight")]
    ConflictingChangeInFlight,

    #[error("Failed to persist log")]
    LocalIoError(StorageError),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) address: String,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
    // Lets a stale candidate learn the newer term and step down.
    pub(crate) current_term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Failed to persist vote: {0}")]
    LocalIoError(StorageError),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<WriteAheadLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry {
        // Lets the leader skip straight back to the end of our log.
        last_log_entry_index: Option<Index>,
    },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(StorageError),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) metadata: SnapshotMetadata,
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(StorageError),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted { peer_term: Term },
    // No retry. If the election stalls, the follower timer starts a new one.
    Failure,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    #[error("Peer has a newer term {new_term:?}")]
    StaleTerm { new_term: Term },
    #[error("Peer is missing the previous log entry")]
    PeerMissingPreviousLogEntry { peer_last_log_index: Option<Index> },
    #[error("Retryable failure: {0}")]
    RetryableFailure(String),
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    pub(crate) result: Result<(), InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    #[error("Peer has a newer term {new_term:?}")]
    StaleTerm { new_term: Term },
    #[error("Retryable failure: {0}")]
    RetryableFailure(String),
}

/// Heartbeat (or catch-up) trigger for one peer, only meaningful in the term it was created for.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// Point-in-time view of the replica, for operators and tests.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaStatus {
    pub(crate) replica_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) election_state: ElectionStateSnapshot,
    pub(crate) commit_index: Option<Index>,
    pub(crate) last_log_index: Option<Index>,
    pub(crate) first_log_index: Index,
    pub(crate) snapshot_index: Option<Index>,
    pub(crate) members: Vec<ReplicaMetadata>,
}
