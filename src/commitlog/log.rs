use crate::commitlog::StorageError;
use std::convert::TryFrom;
use std::fmt;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Returns None for 0, which is how the wire and disk formats spell "no index".
    pub fn from_u64(index: u64) -> Option<Self> {
        match index {
            0 => None,
            i => Some(Self::new(i)),
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        match self.as_u64().checked_sub(delta) {
            Some(v) if v > 0 => Some(Index::new(v)),
            _ => None,
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. A prefix of the log may be discarded with `compact_through()`,
/// after which reads below `first_index()` fail with `StorageError::Compacted`.
///
/// Writes are expected to be issued by a single owner. Implementations must make an append
/// durable before returning.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, StorageError>;

    /// Append all entries in order and return the index of the last one. Implementations should
    /// override this if they can make the whole batch durable at once.
    fn append_all(&mut self, entries: Vec<E>) -> Result<Option<Index>, StorageError> {
        let mut last = None;
        for entry in entries {
            last = Some(self.append(entry)?);
        }
        Ok(last)
    }

    /// Read log entry at specified index. Ok(None) means the index is past the end of the log.
    fn read(&self, index: Index) -> Result<Option<E>, StorageError>;

    /// Read entries in `[from, to_inclusive]`. Stops early at the end of the log.
    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, StorageError> {
        let mut entries = Vec::new();
        let mut index = from;
        while index <= to_inclusive {
            match self.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }
        Ok(entries)
    }

    /// Removes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), StorageError>;

    /// Discards everything up to and including `index`. If `index` is at or past the end of the
    /// log, the log becomes empty and the next append will be written at `index + 1`.
    fn compact_through(&mut self, index: Index) -> Result<(), StorageError>;

    /// first_index returns the lowest index still retained. Equal to `next_index()` when empty.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

pub trait Entry: Clone + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = StorageError> {}
