use crate::replica::membership::MembershipChange;
use crate::replica::peer_client::{PeerClient, PeerConnector};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything we need to know to reach a member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReplicaMetadata {
    replica_id: ReplicaId,
    address: String,
}

impl ReplicaMetadata {
    pub(crate) fn new(replica_id: ReplicaId, address: String) -> Self {
        ReplicaMetadata { replica_id, address }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) metadata: ReplicaMetadata,
    pub(crate) client: Arc<dyn PeerClient>,
}

/// ClusterTracker is the registry of the current voting configuration and the RPC clients used to
/// reach every other member. The local replica is tracked as a member (if it is one) but never
/// as a peer.
pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    members: BTreeMap<ReplicaId, ReplicaMetadata>,
    peers: HashMap<ReplicaId, Peer>,
    connector: Arc<dyn PeerConnector>,
}

impl ClusterTracker {
    pub(crate) fn new(
        my_replica_id: ReplicaId,
        members: Vec<ReplicaMetadata>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let mut tracker = ClusterTracker {
            my_replica_id,
            members: BTreeMap::new(),
            peers: HashMap::new(),
            connector,
        };
        tracker.reset_membership(members);

        tracker
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        self.members.contains_key(replica_id)
    }

    pub(crate) fn i_am_member(&self) -> bool {
        self.contains_member(&self.my_replica_id)
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.members.len()
    }

    /// Majority of the current configuration.
    pub(crate) fn quorum_size(&self) -> usize {
        quorum_size(self.members.len())
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn peer(&self, peer_id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub(crate) fn metadata(&self, replica_id: &ReplicaId) -> Option<&ReplicaMetadata> {
        self.members.get(replica_id)
    }

    pub(crate) fn members(&self) -> Vec<ReplicaMetadata> {
        self.members.values().cloned().collect()
    }

    /// Applies a committed configuration change. Returns true if membership changed.
    pub(crate) fn apply_change(&mut self, change: &MembershipChange) -> bool {
        match change {
            MembershipChange::Add(metadata) => {
                if self.members.get(metadata.replica_id()) == Some(metadata) {
                    return false;
                }
                self.insert_member(metadata.clone());
                true
            }
            MembershipChange::Remove(replica_id) => {
                self.peers.remove(replica_id);
                self.members.remove(replica_id).is_some()
            }
        }
    }

    /// Replaces the whole configuration, e.g. when a snapshot is loaded.
    pub(crate) fn reset_membership(&mut self, members: Vec<ReplicaMetadata>) {
        self.members.clear();
        self.peers.clear();
        for metadata in members {
            self.insert_member(metadata);
        }
    }

    fn insert_member(&mut self, metadata: ReplicaMetadata) {
        if metadata.replica_id() != &self.my_replica_id {
            let client = self.connector.connect(&metadata);
            self.peers.insert(
                metadata.replica_id().clone(),
                Peer {
                    metadata: metadata.clone(),
                    client,
                },
            );
        }
        self.members.insert(metadata.replica_id().clone(), metadata);
    }
}

pub(crate) fn quorum_size(num_members: usize) -> usize {
    (num_members / 2) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{
        ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
        ProtoRequestVoteReq, ProtoRequestVoteResult,
    };
    use tonic::Status;

    struct NoopClient;

    #[async_trait::async_trait]
    impl PeerClient for NoopClient {
        async fn request_vote(&self, _: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
            Err(Status::unavailable("noop"))
        }

        async fn append_entries(&self, _: ProtoAppendEntriesReq) -> Result<ProtoAppendEntriesResult, Status> {
            Err(Status::unavailable("noop"))
        }

        async fn install_snapshot(&self, _: ProtoInstallSnapshotReq) -> Result<ProtoInstallSnapshotResult, Status> {
            Err(Status::unavailable("noop"))
        }
    }

    struct NoopConnector;

    impl PeerConnector for NoopConnector {
        fn connect(&self, _: &ReplicaMetadata) -> Arc<dyn PeerClient> {
            Arc::new(NoopClient)
        }
    }

    fn member(id: &str) -> ReplicaMetadata {
        ReplicaMetadata::new(ReplicaId::new(id), format!("{}:1", id))
    }

    fn tracker(me: &str, members: &[&str]) -> ClusterTracker {
        ClusterTracker::new(
            ReplicaId::new(me),
            members.iter().map(|m| member(m)).collect(),
            Arc::new(NoopConnector),
        )
    }

    #[test]
    fn quorum_follows_membership() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);

        let mut tracker = tracker("a", &["a", "b", "c"]);
        assert!(tracker.i_am_member());
        assert_eq!(tracker.quorum_size(), 2);
        assert_eq!(tracker.peer_ids().len(), 2);

        assert!(tracker.apply_change(&MembershipChange::Add(member("d"))));
        assert_eq!(tracker.quorum_size(), 3);
        assert!(tracker.peer(&ReplicaId::new("d")).is_some());

        // Re-applying the same change is a no-op.
        assert!(!tracker.apply_change(&MembershipChange::Add(member("d"))));

        assert!(tracker.apply_change(&MembershipChange::Remove(ReplicaId::new("a"))));
        assert!(!tracker.i_am_member());
        assert_eq!(tracker.num_voting_replicas(), 3);
        assert!(!tracker.apply_change(&MembershipChange::Remove(ReplicaId::new("a"))));
    }

    #[test]
    fn joiner_is_not_a_member() {
        let tracker = tracker("new", &["a", "b", "c"]);
        assert!(!tracker.i_am_member());
        assert_eq!(tracker.peer_ids().len(), 3);
    }
}
