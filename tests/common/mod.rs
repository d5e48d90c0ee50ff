#![allow(dead_code)]

use cluster_store::{
    Command, CommitResult, LocalNetwork, RaftClient, RaftClientConfig, RaftElectionState, RaftMemberInfo,
    RaftOptions, RaftStatus, RaftTransport, SubmitError,
};
use slog::Drain;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::time::{Duration, Instant};

pub const HEARTBEAT: Duration = Duration::from_millis(20);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Several replicas in one process, wired through a `LocalNetwork`.
pub struct LocalCluster {
    pub network: LocalNetwork,
    pub members: Vec<RaftMemberInfo>,
    clients: BTreeMap<String, RaftClient>,
    options: RaftOptions,
}

pub fn fast_options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(HEARTBEAT),
        follower_min_timeout: Some(HEARTBEAT * 8),
        follower_max_timeout: Some(HEARTBEAT * 16),
        leader_append_entries_timeout: Some(HEARTBEAT * 4),
        command_timeout: Some(Duration::from_secs(2)),
        ..RaftOptions::default()
    }
}

pub fn repl_id(id: usize) -> String {
    format!("node-{}", id + 1)
}

pub fn local_address(replica_id: &str) -> String {
    format!("{}.local:4000", replica_id)
}

impl LocalCluster {
    pub async fn start(num_members: usize, options: RaftOptions) -> Self {
        Self::start_with_storage(num_members, options, |_| None).await
    }

    /// `data_directory(replica_id)` picks the storage of every member.
    pub async fn start_with_storage(
        num_members: usize,
        options: RaftOptions,
        data_directory: impl Fn(&str) -> Option<PathBuf>,
    ) -> Self {
        let members: Vec<RaftMemberInfo> = (0..num_members)
            .map(|i| RaftMemberInfo {
                replica_id: repl_id(i),
                address: local_address(&repl_id(i)),
            })
            .collect();

        let mut cluster = LocalCluster {
            network: LocalNetwork::new(),
            members: members.clone(),
            clients: BTreeMap::new(),
            options,
        };
        for member in members {
            let directory = data_directory(&member.replica_id);
            cluster.start_node(&member.replica_id, directory).await;
        }

        cluster
    }

    /// Starts a replica with the cluster's bootstrap membership. Used for restarts, and for nodes
    /// that aren't members yet (they wait to be added).
    pub async fn start_node(&mut self, replica_id: &str, data_directory: Option<PathBuf>) {
        let config = RaftClientConfig {
            my_replica_id: replica_id.to_string(),
            my_address: Some(local_address(replica_id)),
            cluster_members: self.members.clone(),
            data_directory,
            transport: RaftTransport::Local(self.network.clone()),
            info_logger: create_root_logger_for_stdout(replica_id.to_string()),
            options: self.options.clone(),
        };

        let client = cluster_store::try_create_raft_client(config)
            .await
            .expect("Failed to start replica");
        self.clients.insert(replica_id.to_string(), client);
    }

    pub async fn stop_node(&mut self, replica_id: &str) {
        if let Some(client) = self.clients.remove(replica_id) {
            client.shutdown().await;
        }
    }

    pub fn client(&self, replica_id: &str) -> &RaftClient {
        self.clients
            .get(replica_id)
            .unwrap_or_else(|| panic!("No running replica {}", replica_id))
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub async fn statuses(&self, among: &[String]) -> Vec<RaftStatus> {
        let mut statuses = Vec::with_capacity(among.len());
        for id in among {
            if let Ok(status) = self.client(id).status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Waits until one of `among` is leader in the highest term seen and enough of `among`
    /// follow it to form a majority of the bootstrap membership.
    pub async fn wait_for_leader(&self, among: &[String]) -> String {
        let quorum = self.members.len() / 2 + 1;
        let deadline = Instant::now() + WAIT_TIMEOUT;

        loop {
            let statuses = self.statuses(among).await;
            let max_term = statuses.iter().map(|s| s.term).max();
            let leader = statuses
                .iter()
                .find(|s| s.election_state == RaftElectionState::Leader && Some(s.term) == max_term);

            if let Some(leader) = leader {
                let followers = statuses
                    .iter()
                    .filter(|s| match &s.election_state {
                        RaftElectionState::Follower { leader_replica_id } => {
                            leader_replica_id == &leader.replica_id && s.term == leader.term
                        }
                        _ => false,
                    })
                    .count();
                if followers + 1 >= quorum {
                    return leader.replica_id.clone();
                }
            }

            assert!(Instant::now() < deadline, "Timeout waiting for leader election");
            sleep(HEARTBEAT).await;
        }
    }

    pub async fn wait_for_any_leader(&self) -> String {
        let ids = self.ids();
        self.wait_for_leader(&ids).await
    }

    /// Submits through whoever is leader, following redirects and riding out elections.
    pub async fn submit(&self, command: Command) -> CommitResult {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut target = self.wait_for_any_leader().await;

        loop {
            let client = match self.clients.get(&target) {
                Some(client) => client,
                None => {
                    target = self.wait_for_any_leader().await;
                    continue;
                }
            };

            match client.submit(command.clone()).await {
                Ok(result) => return result,
                Err(SubmitError::NotLeader { leader_hint }) => target = leader_hint.replica_id,
                Err(SubmitError::NoLeader) | Err(SubmitError::LeadershipLost) | Err(SubmitError::Timeout) => {
                    sleep(HEARTBEAT).await;
                    target = self.wait_for_any_leader().await;
                }
                Err(e) => panic!("Submit of {:?} failed: {:?}", command, e),
            }

            assert!(Instant::now() < deadline, "Timeout submitting {:?}", command);
        }
    }

    /// Waits until `replica_id` has applied everything through `index`.
    pub async fn wait_for_applied(&self, replica_id: &str, index: u64) -> RaftStatus {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let status = self
                .client(replica_id)
                .status()
                .await
                .expect("Replica exited while waiting");
            if status.applied_index.unwrap_or(0) >= index {
                return status;
            }

            assert!(
                Instant::now() < deadline,
                "Timeout waiting for {} to apply {} (at {:?})",
                replica_id,
                index,
                status.applied_index
            );
            sleep(HEARTBEAT).await;
        }
    }

    pub async fn shutdown(self) {
        for (_, client) in self.clients {
            client.shutdown().await;
        }
    }
}

pub fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().filter_level(slog::Level::Info).fuse();

    slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id))
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
