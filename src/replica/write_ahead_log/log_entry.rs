use crate::commitlog;
use crate::commitlog::StorageError;
use crate::replica::Term;
use std::convert::TryFrom;

/// Byte representation:
///
/// ```text
/// |                                         1                               |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|       Term (8 bytes)          |Knd|   Data (variable size)  ... |
/// +---+-------------------------------+---+-------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created (little endian)
/// * `Knd` - entry kind, see `EntryKind`
/// * `Data` - app specific data payload
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum EntryKind {
    /// A state machine command. Empty data is the leader's no-op.
    Data,
    /// A single membership change.
    Configuration,
    /// Never written to the log. Marks a committed snapshot on the commit stream.
    Snapshot,
}

impl EntryKind {
    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            EntryKind::Data => 1,
            EntryKind::Configuration => 2,
            EntryKind::Snapshot => 3,
        }
    }

    pub(crate) fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(EntryKind::Data),
            2 => Some(EntryKind::Configuration),
            3 => Some(EntryKind::Snapshot),
            _ => None,
        }
    }
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 8 + 1;

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = StorageError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(StorageError::Corruption(format!(
                "log entry is {} bytes, shorter than its header",
                bytes.len()
            )));
        }
        if bytes[0] != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unknown log entry format version {}",
                bytes[0]
            )));
        }

        let mut term_bytes = [0; 8];
        term_bytes.copy_from_slice(&bytes[1..9]);
        let kind = EntryKind::from_u8(bytes[9])
            .ok_or_else(|| StorageError::Corruption(format!("unknown log entry kind {}", bytes[9])))?;

        Ok(WriteAheadLogEntry {
            term: Term::new(u64::from_le_bytes(term_bytes)),
            kind,
            data: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + entry.data.len());

        bytes.push(RAFT_LOG_ENTRY_FORMAT_VERSION);
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        bytes.push(entry.kind.as_u8());
        bytes.extend_from_slice(&entry.data);

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let entry = WriteAheadLogEntry {
            term: Term::new(0x0102),
            kind: EntryKind::Configuration,
            data: vec![9, 9],
        };

        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(bytes, vec![2, 0x02, 0x01, 0, 0, 0, 0, 0, 0, 2, 9, 9]);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn bad_bytes_are_corruption() {
        assert!(matches!(
            WriteAheadLogEntry::try_from(vec![2, 0, 0]),
            Err(StorageError::Corruption(_))
        ));
        assert!(matches!(
            WriteAheadLogEntry::try_from(vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            Err(StorageError::Corruption(_))
        ));
        assert!(matches!(
            WriteAheadLogEntry::try_from(vec![2, 0, 0, 0, 0, 0, 0, 0, 0, 42]),
            Err(StorageError::Corruption(_))
        ));
    }
}
