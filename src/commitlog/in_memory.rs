use crate::commitlog::{Entry, Index, Log, StorageError};
use std::convert::TryFrom;
use std::marker::PhantomData;

/// InMemoryLog keeps the log in RAM. Nothing survives a restart, so it is only suitable for
/// tests and throwaway clusters. Use `FileLog` for anything else.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    // Index of `log[0]`.
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        InMemoryLog {
            log: vec![],
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        }
    }

    fn vec_index(&self, index: Index) -> Result<usize, StorageError> {
        if index < self.first_index {
            return Err(StorageError::Compacted(index));
        }
        Ok((index.as_u64() - self.first_index.as_u64()) as usize)
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, StorageError> {
        self.log.push(entry.into());

        Ok(self.first_index.plus(self.log.len() as u64 - 1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, StorageError> {
        let vec_index = self.vec_index(index)?;
        match self.log.get(vec_index).cloned() {
            Some(bytes) => E::try_from(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), StorageError> {
        let vec_index = self.vec_index(index)?;
        self.log.truncate(vec_index);
        Ok(())
    }

    fn compact_through(&mut self, index: Index) -> Result<(), StorageError> {
        if index < self.first_index {
            return Ok(());
        }

        let num_to_drop = (index.as_u64() - self.first_index.as_u64() + 1) as usize;
        if num_to_drop >= self.log.len() {
            self.log.clear();
        } else {
            self.log.drain(..num_to_drop);
        }
        self.first_index = index.plus(1);

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal entry type so the generic logs can be tested without the raft entry format.
    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub(crate) Vec<u8>);

    impl Entry for TestEntry {}

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = StorageError;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    fn entry(b: u8) -> TestEntry {
        TestEntry(vec![b; 3])
    }

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::create();
        assert_eq!(log.next_index(), Index::new(1));

        assert_eq!(log.append(entry(1)).unwrap(), Index::new(1));
        assert_eq!(log.append(entry(2)).unwrap(), Index::new(2));
        assert_eq!(log.append(entry(3)).unwrap(), Index::new(3));

        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(2)));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);

        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.read(Index::new(2)).unwrap(), None);
        assert_eq!(log.append(entry(9)).unwrap(), Index::new(2));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(9)));
    }

    #[test]
    fn compaction_discards_prefix() {
        let mut log = InMemoryLog::create();
        for i in 1..=5 {
            log.append(entry(i)).unwrap();
        }

        log.compact_through(Index::new(3)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert!(matches!(log.read(Index::new(3)), Err(StorageError::Compacted(_))));
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(4)));
        assert_eq!(
            log.read_range(Index::new(4), Index::new(10)).unwrap(),
            vec![entry(4), entry(5)]
        );
    }

    #[test]
    fn compaction_past_the_end_empties_log() {
        let mut log = InMemoryLog::create();
        log.append(entry(1)).unwrap();

        log.compact_through(Index::new(10)).unwrap();
        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.next_index(), Index::new(11));
        assert_eq!(log.append(entry(2)).unwrap(), Index::new(11));
    }
}
