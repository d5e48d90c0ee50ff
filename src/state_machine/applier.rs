use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::context::ContextPool;
use crate::replica::{CommitStream, CommittedEntry, EntryKind, ReplicaId, ReplicaMetadata, Snapshot, SnapshotMetadata};
use crate::state_machine::{ClusterState, Command, PendingCommands};
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
enum ApplierHalted {
    #[error("unreadable snapshot at {index:?}: {reason}")]
    UnreadableSnapshot { index: Index, reason: String },
}

/// StateMachineApplier is the single consumer of the commit stream. It applies entries one at a
/// time, in index order, each inside its own write context, then wakes up whoever submitted the
/// entry. Every `snapshot_threshold` applied entries it hands a snapshot to the replica.
pub(crate) struct StateMachineApplier {
    logger: slog::Logger,
    commit_stream: CommitStream,
    pool: ContextPool,
    pending: PendingCommands,
    replica: WeakActorClient,
    snapshot_threshold: u64,
    last_snapshot_index: Option<Index>,
}

impl StateMachineApplier {
    pub(crate) fn new(
        logger: slog::Logger,
        commit_stream: CommitStream,
        pool: ContextPool,
        pending: PendingCommands,
        replica: WeakActorClient,
        snapshot_threshold: u64,
    ) -> Self {
        // Whatever we start from (a restored snapshot or nothing) counts as the last snapshot.
        let last_snapshot_index = pool.last_applied().map(|(index, _)| index);

        StateMachineApplier {
            logger,
            commit_stream,
            pool,
            pending,
            replica,
            snapshot_threshold,
            last_snapshot_index,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(entry) = self.commit_stream.recv().await {
            if let Err(e) = self.apply(entry).await {
                // Applying anything else would diverge from the rest of the cluster.
                slog::crit!(self.logger, "Applier halted: {}. Shutting down replica.", e);
                let _ = self.replica.shutdown().await;
                return;
            }

            if !self.maybe_create_snapshot().await {
                break;
            }
        }

        slog::info!(self.logger, "Commit stream closed. Applier exiting.");
    }

    async fn apply(&mut self, entry: CommittedEntry) -> Result<(), ApplierHalted> {
        // We're the only writer, so this can't move under us.
        if let Some((last_applied, _)) = self.pool.last_applied() {
            if entry.index <= last_applied {
                slog::debug!(self.logger, "Skipping already applied index {:?}", entry.index);
                return Ok(());
            }
        }

        let mut ctx = self.pool.acquire_write_context().await;
        match entry.kind {
            EntryKind::Snapshot => match ClusterState::restore(&entry.data) {
                Ok(state) => {
                    ctx.replace_state(state);
                    ctx.commit(entry.index, entry.term);
                    self.pending.resolve_through_snapshot(entry.index);
                    self.last_snapshot_index = Some(entry.index);
                    slog::info!(self.logger, "Restored state from snapshot at {:?}", entry.index);
                }
                Err(e) => {
                    // Dropping the context keeps the old state.
                    return Err(ApplierHalted::UnreadableSnapshot {
                        index: entry.index,
                        reason: e.to_string(),
                    });
                }
            },
            kind => {
                let result = Command::from_log_payload(kind, &entry.data)
                    .and_then(|command| ctx.state_mut().apply(entry.index.as_u64(), &command));
                if let Err(e) = &result {
                    slog::info!(self.logger, "Entry {:?} rejected: {}", entry.index, e);
                }

                ctx.commit(entry.index, entry.term);
                self.pending.resolve(entry.index, entry.term, result);
            }
        }

        Ok(())
    }

    /// Returns false once the replica is gone.
    async fn maybe_create_snapshot(&mut self) -> bool {
        let (last_applied, last_applied_term) = match self.pool.last_applied() {
            Some(applied) => applied,
            None => return true,
        };
        let applied_since_snapshot =
            last_applied.as_u64() - self.last_snapshot_index.map(|i| i.as_u64()).unwrap_or(0);
        if applied_since_snapshot < self.snapshot_threshold {
            return true;
        }

        let ctx = self.pool.acquire_read_context().await;
        let data = match ctx.state().serialize() {
            Ok(data) => data,
            Err(e) => {
                slog::error!(self.logger, "Failed to serialize state for snapshot: {:?}", e);
                return true;
            }
        };
        let membership = ctx
            .state()
            .members()
            .iter()
            .map(|(id, address)| ReplicaMetadata::new(ReplicaId::new(id.clone()), address.clone()))
            .collect();
        drop(ctx);

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: last_applied,
                last_included_term: last_applied_term,
                membership,
            },
            data: Bytes::from(data),
        };
        slog::info!(
            self.logger,
            "Created snapshot through {:?} ({} entries since last)",
            last_applied,
            applied_since_snapshot
        );

        self.last_snapshot_index = Some(last_applied);
        self.replica.snapshot_created(snapshot).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::commitlog::{InMemoryLog, Log};
    use crate::context::AppliedState;
    use crate::replica::{wired, Term, WriteAheadLogEntry};
    use crate::state_machine::{CommandOutcome, CommandOutput};
    use serde_json::json;
    use tokio::sync::oneshot;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn put(name: &str) -> WriteAheadLogEntry {
        entry(Command::PutRecord {
            name: name.into(),
            payload: json!(name),
            expected_version: None,
        })
    }

    fn entry(command: Command) -> WriteAheadLogEntry {
        let (kind, data) = command.to_log_payload().unwrap();
        WriteAheadLogEntry {
            term: Term::new(1),
            kind,
            data,
        }
    }

    fn empty_pool() -> ContextPool {
        ContextPool::new(
            AppliedState {
                state: ClusterState::default(),
                last_applied: None,
            },
            2,
        )
    }

    #[tokio::test]
    async fn applies_in_order_and_snapshots_at_threshold() {
        let (mut wal, stream) = wired(logger(), InMemoryLog::create(), None, None).unwrap();
        let pool = empty_pool();
        let pending = PendingCommands::new();
        let (actor_client, mut actor_rx) = ActorClient::new(10);

        let (tx, rx) = oneshot::channel();
        pending.register(Index::new(2), Term::new(1), tx);

        let applier = StateMachineApplier::new(logger(), stream, pool.clone(), pending, actor_client.weak(), 3);
        tokio::spawn(applier.run());

        for name in &["db1", "db2", "db3"] {
            wal.append(put(name)).unwrap();
        }
        wal.ratchet_fwd_commit_index(Index::new(3));
        wal.dispatch_committed_entries().unwrap();

        match rx.await.unwrap() {
            CommandOutcome::Applied { index, result } => {
                assert_eq!(index, Index::new(2));
                assert_eq!(result, Ok(CommandOutput::RecordWritten { version: 2 }));
            }
            other => panic!("Unexpected outcome: {:?}", other),
        }

        pool.wait_for_applied(Index::new(3)).await;
        let ctx = pool.acquire_read_context().await;
        assert_eq!(ctx.state().records_with_prefix("db").count(), 3);

        match actor_rx.recv().await {
            Some(Event::SnapshotCreated(snapshot)) => {
                assert_eq!(snapshot.metadata.last_included_index, Index::new(3));
                let restored = ClusterState::restore(&snapshot.data).unwrap();
                assert_eq!(&restored, ctx.state());
            }
            Some(other) => panic!("Unexpected event: {}", other.name()),
            None => panic!("Actor queue closed"),
        }
    }

    #[tokio::test]
    async fn replayed_entries_are_applied_once() {
        let commands = vec![
            Command::PutRecord {
                name: "db1".into(),
                payload: json!(1),
                expected_version: None,
            },
            Command::DeleteRecord { name: "db1".into() },
            Command::PutRecord {
                name: "db2".into(),
                payload: json!(2),
                expected_version: None,
            },
            Command::PutRecord {
                name: "db3".into(),
                payload: json!(3),
                expected_version: None,
            },
        ];

        // State as of index 3, as if entries 1..=3 had been applied before a restart.
        let mut state = ClusterState::default();
        for (i, command) in commands.iter().take(3).enumerate() {
            state.apply(i as u64 + 1, command).unwrap();
        }
        let pool = ContextPool::new(
            AppliedState {
                state,
                last_applied: Some((Index::new(3), Term::new(1))),
            },
            2,
        );

        // The reopened log publishes all four entries again.
        let mut log = InMemoryLog::create();
        for command in commands {
            Log::append(&mut log, entry(command)).unwrap();
        }
        let (mut wal, stream) = wired(logger(), log, None, Some(Index::new(4))).unwrap();
        let (actor_client, _actor_rx) = ActorClient::new(10);
        let applier = StateMachineApplier::new(logger(), stream, pool.clone(), PendingCommands::new(), actor_client.weak(), 100);
        tokio::spawn(applier.run());

        wal.dispatch_committed_entries().unwrap();
        pool.wait_for_applied(Index::new(4)).await;

        let ctx = pool.acquire_read_context().await;
        // Re-applying index 1 would have brought db1 back.
        assert!(ctx.state().record("db1").is_none());
        assert_eq!(ctx.state().record("db2").map(|r| r.version), Some(3));
        assert_eq!(ctx.state().record("db3").map(|r| r.version), Some(4));
        assert_eq!(pool.stats().writes_committed, 1);
    }

    #[tokio::test]
    async fn unreadable_snapshot_halts_applier_and_replica() {
        let (mut wal, stream) = wired(logger(), InMemoryLog::create(), None, None).unwrap();
        let pool = empty_pool();
        let (actor_client, mut actor_rx) = ActorClient::new(10);
        let applier = StateMachineApplier::new(logger(), stream, pool.clone(), PendingCommands::new(), actor_client.weak(), 100);
        let applier_task = tokio::spawn(applier.run());

        let metadata = SnapshotMetadata {
            last_included_index: Index::new(5),
            last_included_term: Term::new(1),
            membership: vec![],
        };
        wal.install_snapshot(&metadata, Bytes::from_static(b"garbage")).unwrap();
        assert_eq!(wal.append(put("after")).unwrap(), Index::new(6));
        wal.ratchet_fwd_commit_index(Index::new(6));
        wal.dispatch_committed_entries().unwrap();

        match actor_rx.recv().await {
            Some(Event::Shutdown) => {}
            Some(other) => panic!("Unexpected event: {}", other.name()),
            None => panic!("Actor queue closed"),
        }
        applier_task.await.unwrap();

        // Neither the snapshot nor anything after it was applied.
        assert_eq!(pool.last_applied(), None);
        let ctx = pool.acquire_read_context().await;
        assert!(ctx.state().record("after").is_none());
    }
}
