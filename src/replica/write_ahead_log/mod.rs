//! This module is a raft-specific commit log that wraps the generic commit log. It adds terms,
//! entry kinds, the commit index and the snapshot point on top of plain indexed storage.

mod commit_stream;
mod log;
mod log_entry;
mod wiring;

pub(crate) use commit_stream::CommitStream;
pub(crate) use commit_stream::CommittedEntry;
pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::EntryKind;
pub(crate) use log_entry::WriteAheadLogEntry;
pub(crate) use wiring::wired;
