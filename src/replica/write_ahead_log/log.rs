use crate::commitlog;
use crate::commitlog::{Index, StorageError};
use crate::replica::local_state::Term;
use crate::replica::snapshot::SnapshotMetadata;
use crate::replica::write_ahead_log::commit_stream::{CommitStreamPublisher, CommittedEntry};
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLogEntry};
use bytes::Bytes;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// The log may start after a snapshot. The snapshot's last included (term, index) stands in for
/// the compacted prefix whenever we need the term of the entry just before the first retained one.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last (term, index) folded into a snapshot. Everything up to it is committed.
    snapshot_point: Option<(Term, Index)>,

    // Commit stream to publish committed entries to. Consumed by the state machine applier.
    commit_stream: CommitStreamPublisher,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry published to the commit stream. None if nothing is published.
    last_dispatched_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    pub(super) fn new(
        logger: slog::Logger,
        mut log: L,
        snapshot: Option<&SnapshotMetadata>,
        persisted_commit_index: Option<Index>,
        commit_stream: CommitStreamPublisher,
    ) -> Result<Self, StorageError> {
        let snapshot_point = snapshot.map(|m| (m.last_included_term, m.last_included_index));
        let expected_first_index = snapshot_point
            .map(|(_, index)| index.plus(1))
            .unwrap_or_else(Index::start_index);

        // A gap between the snapshot and the log means entries are missing for good.
        if log.first_index() > expected_first_index {
            return Err(StorageError::Corruption(format!(
                "log starts at {:?} but the snapshot only covers up to {:?}",
                log.first_index(),
                expected_first_index.checked_minus(1)
            )));
        }
        // We may have crashed after saving a snapshot but before compacting the log.
        if let Some((_, snapshot_index)) = snapshot_point {
            if log.first_index() <= snapshot_index {
                log.compact_through(snapshot_index)?;
            }
        }

        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            Some(last_index) if last_index >= log.first_index() => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => snapshot_point,
            },
            _ => snapshot_point,
        };
        // Entries between the snapshot and the persisted commit index are committed too. They're
        // published again by the first `dispatch_committed_entries()`.
        let snapshot_index = snapshot_point.map(|(_, index)| index);
        let latest_index = latest_entry_metadata.map(|(_, index)| index);
        let commit_index = match (persisted_commit_index, latest_index) {
            (Some(persisted), Some(latest)) => std::cmp::max(Some(std::cmp::min(persisted, latest)), snapshot_index),
            _ => snapshot_index,
        };
        if let (Some(persisted), Some(recovered)) = (persisted_commit_index, commit_index) {
            if persisted > recovered {
                slog::warn!(
                    logger,
                    "Persisted commit index {:?} is past the end of the log. Recovering through {:?}.",
                    persisted,
                    recovered
                );
            }
        }

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_point,
            commit_stream,
            commit_index,
            last_dispatched_index: snapshot_index,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn snapshot_point(&self) -> Option<(Term, Index)> {
        self.snapshot_point
    }

    /// Number of entries retained in the log, i.e. not yet folded into a snapshot.
    pub(crate) fn len(&self) -> u64 {
        self.log.next_index().as_u64() - self.log.first_index().as_u64()
    }

    /// Term of the entry at `index`. Answers for the snapshot point even though the entry itself
    /// has been compacted away.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, StorageError> {
        if let Some((snapshot_term, snapshot_index)) = self.snapshot_point {
            if index == snapshot_index {
                return Ok(Some(snapshot_term));
            }
        }

        Ok(self.log.read(index)?.map(|entry| entry.term))
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, StorageError> {
        self.log.read(index)
    }

    pub(crate) fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<WriteAheadLogEntry>, StorageError> {
        self.log.read_range(from, to_inclusive)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, StorageError> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => panic!("read_required() found no log entry for index {:?}", index),
        }
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), StorageError> {
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. Truncate at {:?}, commit index {:?}",
                index,
                commit_index
            );
        }

        let new_latest_entry_metadata = match index.checked_minus(1) {
            None => None,
            Some(new_latest_index) => self.term_at(new_latest_index)?.map(|term| (term, new_latest_index)),
        };

        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, StorageError> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn append_all(&mut self, entries: Vec<WriteAheadLogEntry>) -> Result<(), StorageError> {
        let last_term = match entries.last() {
            Some(entry) => entry.term,
            None => return Ok(()),
        };

        if let Some(last_index) = self.log.append_all(entries)? {
            self.latest_entry_metadata = Some((last_term, last_index));
        }
        Ok(())
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_dispatched_index(&self) -> Option<Index> {
        self.last_dispatched_index
    }

    /// Leader side. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, StorageError> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);

        Ok(true)
    }

    /// Follower side. Leader's commit index only ever moves forward, but replies can be
    /// reordered, so anything at or below our commit index is ignored.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        // Assert we only ratchet commit index forward.
        if let Some(current_commit_index) = self.commit_index {
            assert!(
                new_commit_index > current_commit_index,
                "Can't ratchet commit index backwards. Expected [input] {:?} > {:?} [current]",
                new_commit_index,
                current_commit_index,
            );
        }

        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self
            .latest_entry_metadata
            .expect("Can't ratchet commit index forward if we don't have any local logs")
            .1;
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// Publishes all committed but not yet published entries in order. Returns the committed
    /// configuration entries among them, so the caller can apply membership changes.
    pub(crate) fn dispatch_committed_entries(&mut self) -> Result<Vec<(Index, Bytes)>, StorageError> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(Vec::new()),
        };
        let from = self
            .last_dispatched_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        if from > commit_index {
            return Ok(Vec::new());
        }

        let mut configuration_entries = Vec::new();
        let mut index = from;
        for entry in self.read_range(from, commit_index)? {
            let data = Bytes::from(entry.data);
            if entry.kind == EntryKind::Configuration {
                configuration_entries.push((index, data.clone()));
            }

            self.commit_stream.notify_commit(
                &self.logger,
                CommittedEntry {
                    term: entry.term,
                    index,
                    kind: entry.kind,
                    data,
                },
            );
            self.last_dispatched_index.replace(index);
            index = index.plus(1);
        }

        Ok(configuration_entries)
    }

    /// Discards entries through `index`, which must already be captured by a saved snapshot.
    pub(crate) fn compact_through(&mut self, index: Index, term: Term) -> Result<(), StorageError> {
        assert!(
            matches!(self.last_dispatched_index, Some(d) if d >= index),
            "Can't compact entries that haven't been applied. Compact through {:?}, dispatched through {:?}",
            index,
            self.last_dispatched_index
        );
        if matches!(self.snapshot_point, Some((_, si)) if si >= index) {
            return Ok(());
        }

        self.log.compact_through(index)?;
        self.snapshot_point = Some((term, index));
        slog::info!(
            self.logger,
            "Compacted log through {:?}. {} entries retained.",
            index,
            self.len()
        );
        Ok(())
    }

    /// Replaces our log prefix with a snapshot received from the leader, then publishes the
    /// snapshot on the commit stream. If we already have the snapshot's last entry (same term),
    /// the entries after it are kept. Otherwise the whole log is discarded.
    pub(crate) fn install_snapshot(&mut self, metadata: &SnapshotMetadata, data: Bytes) -> Result<(), StorageError> {
        let index = metadata.last_included_index;
        let term = metadata.last_included_term;

        let matches_existing = match self.term_at(index) {
            Ok(existing_term) => existing_term == Some(term),
            Err(StorageError::Compacted(_)) => false,
            Err(e) => return Err(e),
        };

        if matches_existing {
            self.log.compact_through(index)?;
        } else {
            let first_index = self.log.first_index();
            self.log.truncate(first_index)?;
            self.log.compact_through(index)?;
            self.latest_entry_metadata = Some((term, index));
        }
        self.snapshot_point = Some((term, index));

        if !matches!(self.commit_index, Some(ci) if ci >= index) {
            self.commit_index = Some(index);
        }
        if !matches!(self.last_dispatched_index, Some(d) if d >= index) {
            self.last_dispatched_index = Some(index);
            self.commit_stream.notify_commit(
                &self.logger,
                CommittedEntry {
                    term,
                    index,
                    kind: EntryKind::Snapshot,
                    data,
                },
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use crate::replica::write_ahead_log::commit_stream;
    use crate::replica::write_ahead_log::CommitStream;

    type Wal = WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>;

    fn wal() -> (Wal, CommitStream) {
        let (publisher, stream) = commit_stream::new();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let wal = WriteAheadLog::new(logger, InMemoryLog::create(), None, None, publisher).unwrap();
        (wal, stream)
    }

    fn entry(term: u64, kind: EntryKind) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            kind,
            data: vec![term as u8],
        }
    }

    #[test]
    fn commit_requires_current_term() {
        let (mut wal, _stream) = wal();
        wal.append(entry(1, EntryKind::Data)).unwrap();
        wal.append(entry(2, EntryKind::Data)).unwrap();

        // Entry 1 is from an older term, so it can't be committed directly.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), None);

        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap());
    }

    #[tokio::test]
    async fn dispatch_publishes_in_order_and_reports_configuration() {
        let (mut wal, mut stream) = wal();
        wal.append_all(vec![
            entry(1, EntryKind::Data),
            entry(1, EntryKind::Configuration),
            entry(1, EntryKind::Data),
        ])
        .unwrap();

        wal.ratchet_fwd_commit_index(Index::new(2));
        let configs = wal.dispatch_committed_entries().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, Index::new(2));

        assert_eq!(stream.recv().await.unwrap().index, Index::new(1));
        let second = stream.recv().await.unwrap();
        assert_eq!(second.index, Index::new(2));
        assert_eq!(second.kind, EntryKind::Configuration);

        // Nothing new to publish.
        assert!(wal.dispatch_committed_entries().unwrap().is_empty());
        assert_eq!(wal.last_dispatched_index(), Some(Index::new(2)));
    }

    #[test]
    fn truncate_resets_latest_entry() {
        let (mut wal, _stream) = wal();
        wal.append_all(vec![entry(1, EntryKind::Data), entry(2, EntryKind::Data), entry(2, EntryKind::Data)])
            .unwrap();

        wal.truncate(Index::new(2)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(1))));

        wal.truncate(Index::new(1)).unwrap();
        assert_eq!(wal.latest_entry(), None);
    }

    #[test]
    fn compaction_keeps_snapshot_term_visible() {
        let (mut wal, _stream) = wal();
        wal.append_all((1..=4).map(|t| entry(t, EntryKind::Data)).collect()).unwrap();
        wal.ratchet_fwd_commit_index(Index::new(3));
        wal.dispatch_committed_entries().unwrap();

        wal.compact_through(Index::new(3), Term::new(3)).unwrap();
        assert_eq!(wal.first_index(), Index::new(4));
        assert_eq!(wal.len(), 1);
        assert_eq!(wal.term_at(Index::new(3)).unwrap(), Some(Term::new(3)));
        assert!(matches!(wal.term_at(Index::new(2)), Err(StorageError::Compacted(_))));

        // Truncating right after the snapshot point falls back to the snapshot's term.
        wal.truncate(Index::new(4)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(3), Index::new(3))));
    }

    #[tokio::test]
    async fn install_snapshot_discards_conflicting_log() {
        let (mut wal, mut stream) = wal();
        wal.append_all(vec![entry(1, EntryKind::Data), entry(1, EntryKind::Data)])
            .unwrap();

        let metadata = SnapshotMetadata {
            last_included_index: Index::new(5),
            last_included_term: Term::new(2),
            membership: vec![],
        };
        wal.install_snapshot(&metadata, Bytes::from_static(b"state")).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(5))));
        assert_eq!(wal.first_index(), Index::new(6));
        assert_eq!(wal.commit_index(), Some(Index::new(5)));

        let published = stream.recv().await.unwrap();
        assert_eq!(published.kind, EntryKind::Snapshot);
        assert_eq!(published.index, Index::new(5));
        assert_eq!(published.data, Bytes::from_static(b"state"));

        // Next append continues right after the snapshot.
        assert_eq!(wal.append(entry(2, EntryKind::Data)).unwrap(), Index::new(6));
    }

    #[test]
    fn reopen_after_snapshot_compacts_leftover_prefix() {
        let mut log = InMemoryLog::create();
        for t in 1..=5 {
            commitlog::Log::append(&mut log, entry(t, EntryKind::Data)).unwrap();
        }
        let metadata = SnapshotMetadata {
            last_included_index: Index::new(3),
            last_included_term: Term::new(3),
            membership: vec![],
        };

        let (publisher, _stream) = commit_stream::new();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let wal = WriteAheadLog::new(logger, log, Some(&metadata), None, publisher).unwrap();

        assert_eq!(wal.first_index(), Index::new(4));
        assert_eq!(wal.commit_index(), Some(Index::new(3)));
        assert_eq!(wal.latest_entry(), Some((Term::new(5), Index::new(5))));
    }

    #[tokio::test]
    async fn reopen_republishes_entries_through_persisted_commit_index() {
        let mut log = InMemoryLog::create();
        commitlog::Log::append(&mut log, entry(1, EntryKind::Data)).unwrap();
        commitlog::Log::append(&mut log, entry(1, EntryKind::Configuration)).unwrap();
        commitlog::Log::append(&mut log, entry(2, EntryKind::Data)).unwrap();
        commitlog::Log::append(&mut log, entry(2, EntryKind::Configuration)).unwrap();

        let (publisher, mut stream) = commit_stream::new();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let mut wal = WriteAheadLog::new(logger, log, None, Some(Index::new(3)), publisher).unwrap();
        assert_eq!(wal.commit_index(), Some(Index::new(3)));
        assert_eq!(wal.last_dispatched_index(), None);

        // Only the committed configuration entry is reported; index 4 may still be rolled back.
        let configs = wal.dispatch_committed_entries().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, Index::new(2));
        for expected in 1..=3 {
            assert_eq!(stream.recv().await.unwrap().index, Index::new(expected));
        }
        assert_eq!(wal.last_dispatched_index(), Some(Index::new(3)));
    }

    #[test]
    fn persisted_commit_index_is_clamped_to_log_and_snapshot() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());

        let mut log = InMemoryLog::create();
        commitlog::Log::append(&mut log, entry(1, EntryKind::Data)).unwrap();
        let (publisher, _stream) = commit_stream::new();
        let wal = WriteAheadLog::new(logger.clone(), log, None, Some(Index::new(7)), publisher).unwrap();
        assert_eq!(wal.commit_index(), Some(Index::new(1)));

        let mut log = InMemoryLog::create();
        for t in 1..=5 {
            commitlog::Log::append(&mut log, entry(t, EntryKind::Data)).unwrap();
        }
        let metadata = SnapshotMetadata {
            last_included_index: Index::new(4),
            last_included_term: Term::new(4),
            membership: vec![],
        };
        let (publisher, _stream) = commit_stream::new();
        let wal = WriteAheadLog::new(logger, log, Some(&metadata), Some(Index::new(2)), publisher).unwrap();
        assert_eq!(wal.commit_index(), Some(Index::new(4)));
        assert_eq!(wal.last_dispatched_index(), Some(Index::new(4)));
    }
}
