mod election;
mod local_state;
mod membership;
mod peer_client;
mod peers;
mod replica;
mod replica_api;
mod snapshot;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use membership::from_proto_member;
pub(crate) use membership::MembershipChange;
pub(crate) use peer_client::GrpcPeerConnector;
pub(crate) use peer_client::PeerClient;
pub(crate) use peer_client::PeerConnector;
pub(crate) use peers::quorum_size;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::ReplicaId;
pub(crate) use peers::ReplicaMetadata;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::AppendEntriesError;
pub(crate) use replica_api::AppendEntriesInput;
pub(crate) use replica_api::AppendEntriesOutput;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::EnqueueForReplicationError;
pub(crate) use replica_api::EnqueueForReplicationInput;
pub(crate) use replica_api::EnqueueForReplicationOutput;
pub(crate) use replica_api::InstallSnapshotError;
pub(crate) use replica_api::InstallSnapshotInput;
pub(crate) use replica_api::InstallSnapshotOutput;
pub(crate) use replica_api::InstallSnapshotReplyFromPeer;
pub(crate) use replica_api::LeaderRedirectInfo;
pub(crate) use replica_api::LeaderTimerTick;
pub(crate) use replica_api::ReplicaStatus;
pub(crate) use replica_api::RequestVoteError;
pub(crate) use replica_api::RequestVoteInput;
pub(crate) use replica_api::RequestVoteOutput;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub(crate) use snapshot::Snapshot;
pub(crate) use snapshot::SnapshotMetadata;
pub(crate) use snapshot::SnapshotStore;
pub(crate) use write_ahead_log::wired;
pub(crate) use write_ahead_log::CommitStream;
pub(crate) use write_ahead_log::CommittedEntry;
pub(crate) use write_ahead_log::EntryKind;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
