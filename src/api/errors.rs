use crate::api::types::RaftLeaderInfo;
use crate::commitlog::StorageError;
use crate::replica::EnqueueForReplicationError;
use crate::state_machine::{ApplyError, CommandValidationError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Retry against the hinted leader.
    #[error("I'm not leader. Try {leader_hint:?}")]
    NotLeader { leader_hint: RaftLeaderInfo },

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    /// The entry may still commit and apply. Only the wait was abandoned.
    #[error("Timed out waiting for the command to apply")]
    Timeout,

    #[error("Another membership change hasn't committed yet")]
    ConflictingChangeInFlight,

    /// A newer leader replaced the entry before it committed.
    #[error("Lost leadership before the command committed")]
    LeadershipLost,

    /// The entry committed, but this node received it inside a snapshot and never saw its result.
    #[error("Command committed, but its result is unavailable on this node")]
    ResultUnavailable,

    #[error(transparent)]
    InvalidCommand(#[from] CommandValidationError),

    /// Committed, then deterministically rejected by the state machine on every member.
    #[error("Command rejected: {0}")]
    Rejected(#[from] ApplyError),

    #[error("Replica has exited")]
    ReplicaExited,

    #[error("Local storage failure: {0}")]
    Storage(StorageError),
}

impl From<EnqueueForReplicationError> for SubmitError {
    fn from(e: EnqueueForReplicationError) -> Self {
        match e {
            EnqueueForReplicationError::LeaderRedirect(leader) => SubmitError::NotLeader {
                leader_hint: RaftLeaderInfo::from(leader),
            },
            EnqueueForReplicationError::NoLeader => SubmitError::NoLeader,
            EnqueueForReplicationError::ConflictingChangeInFlight => SubmitError::ConflictingChangeInFlight,
            EnqueueForReplicationError::LocalIoError(e) => SubmitError::Storage(e),
            EnqueueForReplicationError::ActorExited => SubmitError::ReplicaExited,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Linearizable reads must go to the leader. Try {leader_hint:?}")]
    NotLeader { leader_hint: RaftLeaderInfo },

    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Timed out waiting for the read barrier")]
    Timeout,

    #[error("Read barrier failed: {0}")]
    BarrierFailed(SubmitError),
}

impl From<SubmitError> for ReadError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::NotLeader { leader_hint } => ReadError::NotLeader { leader_hint },
            SubmitError::NoLeader => ReadError::NoLeader,
            SubmitError::Timeout => ReadError::Timeout,
            other => ReadError::BarrierFailed(other),
        }
    }
}
