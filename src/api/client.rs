use crate::actor::ActorClient;
use crate::api::errors::{ReadError, SubmitError};
use crate::api::event_bus::RaftEventListener;
use crate::api::topology::TopologyManager;
use crate::api::types::{CommitResult, RaftStatus, ReadMode};
use crate::commitlog::Index;
use crate::context::{ContextPool, ReadContext};
use crate::replica::{ElectionStateChangeListener, EnqueueForReplicationInput, ReplicaId, Term};
use crate::server::LocalNetwork;
use crate::state_machine::{
    Command, CommandOutcome, ConnectionString, ConnectionStringKind, DatabaseRecord,
};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Handle to one member of the cluster. Dropping every clone of the client (or calling
/// `shutdown()`) stops the local replica.
#[derive(Clone)]
pub struct RaftClient {
    core: ClientCore,
    // Set when running on the in-process transport.
    local_network: Option<LocalNetwork>,
}

/// What both `RaftClient` and `TopologyManager` need to submit commands and read state.
#[derive(Clone)]
pub(super) struct ClientCore {
    pub(super) my_replica_id: ReplicaId,
    pub(super) actor_client: ActorClient,
    pub(super) pool: ContextPool,
    pub(super) election_listener: ElectionStateChangeListener,
    pub(super) command_timeout: Duration,
}

/// Narrows `list_connection_strings()`. Empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStringFilter {
    pub name_prefix: Option<String>,
    pub kind: Option<ConnectionStringKind>,
}

impl ConnectionStringFilter {
    fn matches(&self, name: &str, connection_string: &ConnectionString) -> bool {
        let name_matches = self
            .name_prefix
            .as_ref()
            .map(|prefix| name.starts_with(prefix.as_str()))
            .unwrap_or(true);
        let kind_matches = self
            .kind
            .map(|kind| kind == connection_string.kind())
            .unwrap_or(true);

        name_matches && kind_matches
    }
}

/// A command that has been appended to the leader's log but not necessarily applied yet.
pub struct PendingCommand {
    index: Index,
    term: Term,
    receiver: oneshot::Receiver<CommandOutcome>,
    timeout: Duration,
}

impl PendingCommand {
    /// Log index the command was appended at.
    pub fn index(&self) -> u64 {
        self.index.as_u64()
    }

    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    /// Waits for the command to apply, up to the client's command timeout.
    pub async fn wait(self) -> Result<CommitResult, SubmitError> {
        let timeout = self.timeout;
        self.wait_timeout(timeout).await
    }

    /// Timing out abandons the wait, not the command. It may still commit and apply.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<CommitResult, SubmitError> {
        let outcome = match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without an answer: the replica (and its pending map) is gone.
            Ok(Err(_)) => return Err(SubmitError::ReplicaExited),
            Err(_) => return Err(SubmitError::Timeout),
        };

        match outcome {
            CommandOutcome::Applied { index, result } => Ok(CommitResult {
                applied_index: index.as_u64(),
                value: result?,
            }),
            CommandOutcome::LeadershipLost => Err(SubmitError::LeadershipLost),
            CommandOutcome::ResultUnavailable => Err(SubmitError::ResultUnavailable),
        }
    }
}

impl ClientCore {
    pub(super) async fn submit_detached(&self, command: Command) -> Result<PendingCommand, SubmitError> {
        command.validate()?;
        let (kind, data) = command.to_log_payload()?;

        let (tx, rx) = oneshot::channel();
        let output = self
            .actor_client
            .enqueue_for_replication(EnqueueForReplicationInput {
                kind,
                data,
                waiter: Some(tx),
            })
            .await?;

        Ok(PendingCommand {
            index: output.enqueued_index,
            term: output.enqueued_term,
            receiver: rx,
            timeout: self.command_timeout,
        })
    }

    pub(super) async fn submit(&self, command: Command) -> Result<CommitResult, SubmitError> {
        self.submit_detached(command).await?.wait().await
    }

    /// Returns a read context that reflects everything committed before this call, or the local
    /// applied state when the caller doesn't need that guarantee.
    pub(super) async fn read_context(&self, mode: ReadMode) -> Result<ReadContext, ReadError> {
        if let ReadMode::Linearizable = mode {
            // A no-op through the log proves we're still leader and that everything committed
            // before the read is applied once it comes back.
            let barrier = self.submit(Command::Noop).await?;
            if let Some(index) = Index::from_u64(barrier.applied_index) {
                self.pool.wait_for_applied(index).await;
            }
        }

        Ok(self.pool.acquire_read_context().await)
    }
}

impl RaftClient {
    pub(super) fn new(core: ClientCore, local_network: Option<LocalNetwork>) -> Self {
        RaftClient { core, local_network }
    }

    pub fn replica_id(&self) -> &str {
        self.core.my_replica_id.as_str()
    }

    /// Replicates `command` and waits until it is applied on this node.
    pub async fn submit(&self, command: Command) -> Result<CommitResult, SubmitError> {
        self.core.submit(command).await
    }

    /// Returns as soon as the command is in the leader's log. Await the handle for the result.
    pub async fn submit_detached(&self, command: Command) -> Result<PendingCommand, SubmitError> {
        self.core.submit_detached(command).await
    }

    pub async fn read_record(&self, name: &str, mode: ReadMode) -> Result<Option<DatabaseRecord>, ReadError> {
        let ctx = self.core.read_context(mode).await?;
        Ok(ctx.state().record(name).cloned())
    }

    /// Records whose name starts with `prefix`, ordered by name.
    pub async fn list_records(&self, prefix: &str, mode: ReadMode) -> Result<Vec<DatabaseRecord>, ReadError> {
        let ctx = self.core.read_context(mode).await?;
        Ok(ctx.state().records_with_prefix(prefix).cloned().collect())
    }

    pub async fn read_connection_string(
        &self,
        name: &str,
        mode: ReadMode,
    ) -> Result<Option<ConnectionString>, ReadError> {
        let ctx = self.core.read_context(mode).await?;
        Ok(ctx.state().connection_string(name).cloned())
    }

    /// Connection strings matching `filter`, ordered by name.
    pub async fn list_connection_strings(
        &self,
        filter: &ConnectionStringFilter,
        mode: ReadMode,
    ) -> Result<Vec<(String, ConnectionString)>, ReadError> {
        let ctx = self.core.read_context(mode).await?;
        Ok(ctx
            .state()
            .connection_strings()
            .filter(|(name, connection_string)| filter.matches(name, connection_string))
            .map(|(name, connection_string)| (name.clone(), connection_string.clone()))
            .collect())
    }

    pub fn topology(&self) -> TopologyManager {
        TopologyManager::new(self.core.clone())
    }

    pub fn event_listener(&self) -> RaftEventListener {
        RaftEventListener::new(self.core.election_listener.clone())
    }

    pub async fn status(&self) -> Result<RaftStatus, SubmitError> {
        let status = self
            .core
            .actor_client
            .status()
            .await
            .map_err(|_| SubmitError::ReplicaExited)?;
        let applied_index = self.core.pool.last_applied().map(|(index, _)| index.as_u64());

        Ok(RaftStatus::new(status, applied_index, self.core.pool.stats()))
    }

    /// Stops the replica and its RPC endpoint. Other clones of this client stop working too.
    pub async fn shutdown(&self) {
        if let Some(network) = &self.local_network {
            network.deregister(self.core.my_replica_id.as_str());
        }
        self.core.actor_client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_filter() {
        let sql = ConnectionString::Sql {
            connection_string: "Server=db".to_string(),
            factory_name: "System.Data.SqlClient".to_string(),
        };
        let raven = ConnectionString::Raven {
            topology_discovery_urls: vec!["http://a:8080".to_string()],
            database: "orders".to_string(),
        };

        let all = ConnectionStringFilter::default();
        assert!(all.matches("etl/sql", &sql));
        assert!(all.matches("replication/raven", &raven));

        let by_kind = ConnectionStringFilter {
            kind: Some(ConnectionStringKind::Raven),
            ..ConnectionStringFilter::default()
        };
        assert!(!by_kind.matches("etl/sql", &sql));
        assert!(by_kind.matches("replication/raven", &raven));

        let by_prefix = ConnectionStringFilter {
            name_prefix: Some("etl/".to_string()),
            kind: None,
        };
        assert!(by_prefix.matches("etl/sql", &sql));
        assert!(!by_prefix.matches("replication/raven", &raven));
    }

    #[tokio::test]
    async fn pending_command_outcomes() {
        let pending = |outcome: Option<CommandOutcome>| {
            let (tx, rx) = oneshot::channel();
            if let Some(outcome) = outcome {
                let _ = tx.send(outcome);
            }
            // Dropping tx without sending means the replica is gone.
            PendingCommand {
                index: Index::new(3),
                term: Term::new(1),
                receiver: rx,
                timeout: Duration::from_millis(50),
            }
        };

        let applied = pending(Some(CommandOutcome::Applied {
            index: Index::new(3),
            result: Ok(crate::state_machine::CommandOutput::Noop),
        }))
        .wait()
        .await
        .unwrap();
        assert_eq!(applied.applied_index, 3);

        assert!(matches!(
            pending(Some(CommandOutcome::LeadershipLost)).wait().await,
            Err(SubmitError::LeadershipLost)
        ));
        assert!(matches!(
            pending(Some(CommandOutcome::ResultUnavailable)).wait().await,
            Err(SubmitError::ResultUnavailable)
        ));
        assert!(matches!(pending(None).wait().await, Err(SubmitError::ReplicaExited)));
    }

    #[tokio::test]
    async fn pending_command_times_out_without_answer() {
        let (_tx, rx) = oneshot::channel();
        let pending = PendingCommand {
            index: Index::new(1),
            term: Term::new(1),
            receiver: rx,
            timeout: Duration::from_millis(20),
        };

        assert!(matches!(pending.wait().await, Err(SubmitError::Timeout)));
    }
}
