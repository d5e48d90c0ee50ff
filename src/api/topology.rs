use crate::api::client::ClientCore;
use crate::api::errors::SubmitError;
use crate::api::types::{CommitResult, RaftMemberInfo};
use crate::replica::{self, ElectionStateSnapshot};
use crate::state_machine::Command;

/// The committed membership, as of this node's applied state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterTopology {
    pub members: Vec<RaftMemberInfo>,
    /// Leader as currently known by this node. Not part of the committed state.
    pub leader: Option<String>,
    /// Bumped by every applied membership change.
    pub version: u64,
}

impl ClusterTopology {
    /// Majority of the members: `floor(n/2) + 1`.
    pub fn quorum_size(&self) -> usize {
        replica::quorum_size(self.members.len())
    }

    pub fn contains(&self, replica_id: &str) -> bool {
        self.members.iter().any(|member| member.replica_id == replica_id)
    }
}

/// TopologyManager reads and changes cluster membership. Changes go through the log one at a
/// time: proposing while another change is uncommitted fails with `ConflictingChangeInFlight`.
#[derive(Clone)]
pub struct TopologyManager {
    core: ClientCore,
}

impl TopologyManager {
    pub(super) fn new(core: ClientCore) -> Self {
        TopologyManager { core }
    }

    pub async fn get_topology(&self) -> ClusterTopology {
        let ctx = self.core.pool.acquire_read_context().await;
        let members = ctx
            .state()
            .members()
            .iter()
            .map(|(replica_id, address)| RaftMemberInfo {
                replica_id: replica_id.clone(),
                address: address.clone(),
            })
            .collect();
        let version = ctx.state().topology_version();
        drop(ctx);

        let leader = match self.core.election_listener.current() {
            ElectionStateSnapshot::Leader => Some(self.core.my_replica_id.as_str().to_string()),
            ElectionStateSnapshot::Follower(leader_id) => Some(leader_id.into_inner()),
            ElectionStateSnapshot::Candidate | ElectionStateSnapshot::FollowerNoLeader => None,
        };

        ClusterTopology {
            members,
            leader,
            version,
        }
    }

    pub async fn quorum_size(&self) -> usize {
        self.get_topology().await.quorum_size()
    }

    /// Adds a voting member and waits for the change to apply. The new node should already be
    /// running (as a non-member) so it can catch up.
    pub async fn propose_add_node(&self, replica_id: &str, address: &str) -> Result<CommitResult, SubmitError> {
        self.core
            .submit(Command::AddNode {
                node_id: replica_id.to_string(),
                address: address.to_string(),
            })
            .await
    }

    pub async fn propose_remove_node(&self, replica_id: &str) -> Result<CommitResult, SubmitError> {
        self.core
            .submit(Command::RemoveNode {
                node_id: replica_id.to_string(),
            })
            .await
    }
}
