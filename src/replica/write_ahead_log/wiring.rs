use crate::commitlog;
use crate::commitlog::{Index, StorageError};
use crate::replica::snapshot::SnapshotMetadata;
use crate::replica::write_ahead_log::{commit_stream, CommitStream, WriteAheadLog, WriteAheadLogEntry};

pub(crate) fn wired<L>(
    logger: slog::Logger,
    log: L,
    snapshot: Option<&SnapshotMetadata>,
    persisted_commit_index: Option<Index>,
) -> Result<(WriteAheadLog<L>, CommitStream), StorageError>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    let (publisher, stream) = commit_stream::new();

    let wal = WriteAheadLog::new(logger, log, snapshot, persisted_commit_index, publisher)?;

    Ok((wal, stream))
}
