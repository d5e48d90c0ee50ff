use crate::commitlog::{Index, StorageError};
use crate::grpc::ProtoTermState;
use crate::replica::peers::ReplicaId;
use prost::Message;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever raft requires that something is persisted to a durable
/// store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods are CAS-like: they return Ok(true) if we have mutated state. A mutation is durable
/// before the method returns.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term. Clears vote.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, StorageError>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId)
        -> Result<bool, StorageError>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, StorageError>;

    /// Records that everything through `index` is committed, iff it's past what we have. A
    /// restarted replica replays committed entries up to here before it takes part in elections.
    fn store_commit_index_if_increased(&mut self, index: Index) -> Result<bool, StorageError>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
    fn commit_index(&self) -> Option<Index>;
}

/// Keeps term and vote in RAM. For tests and clusters that don't need to survive restarts.
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    commit_index: Option<Index>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            commit_index: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, StorageError> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        self.current_term = new_term;
        self.voted_for_this_term = None;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, StorageError> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.voted_for_this_term.replace(Arc::new(vote));
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, StorageError> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn store_commit_index_if_increased(&mut self, index: Index) -> Result<bool, StorageError> {
        if matches!(self.commit_index, Some(current) if index <= current) {
            return Ok(false);
        }

        self.commit_index.replace(index);
        Ok(true)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }

    fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }
}

/// FileLocalState keeps term, vote and commit index in a small protobuf file. Every change is written to a temp
/// file, fsync'd and renamed over the old one, so a crash leaves either the old or the new state.
pub(crate) struct FileLocalState {
    path: PathBuf,
    // In-memory copy. Only updated after the disk write succeeds.
    inner: VolatileLocalState,
}

impl FileLocalState {
    pub(crate) fn open(path: impl AsRef<Path>, my_replica_id: ReplicaId) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut inner = VolatileLocalState::new(my_replica_id);

        if path.exists() {
            let bytes = fs::read(&path)?;
            let proto = ProtoTermState::decode(bytes.as_slice())?;
            inner.current_term = Term::new(proto.current_term);
            if !proto.voted_for.is_empty() {
                inner.voted_for_this_term = Some(Arc::new(ReplicaId::new(proto.voted_for)));
            }
            inner.commit_index = Index::from_u64(proto.commit_index);
        }

        Ok(FileLocalState { path, inner })
    }

    fn persist(
        &self,
        term: Term,
        voted_for: Option<&ReplicaId>,
        commit_index: Option<Index>,
    ) -> Result<(), StorageError> {
        let proto = ProtoTermState {
            current_term: term.as_u64(),
            voted_for: voted_for.map(|id| id.as_str().to_string()).unwrap_or_default(),
            commit_index: commit_index.map(|index| index.as_u64()).unwrap_or(0),
        };
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        proto.encode(&mut bytes)?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, StorageError> {
        if new_term <= self.inner.current_term {
            return Ok(false);
        }

        self.persist(new_term, None, self.inner.commit_index)?;
        self.inner.store_term_if_increased(new_term)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, StorageError> {
        if expected_term != self.inner.current_term || self.inner.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.persist(expected_term, Some(&vote), self.inner.commit_index)?;
        self.inner.store_vote_for_term_if_unvoted(expected_term, vote)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, StorageError> {
        let mut new_term = self.inner.current_term;
        new_term.incr();

        self.persist(new_term, Some(&self.inner.my_replica_id), self.inner.commit_index)?;
        self.inner.increment_term_and_vote_for_self()
    }

    fn store_commit_index_if_increased(&mut self, index: Index) -> Result<bool, StorageError> {
        if matches!(self.inner.commit_index, Some(current) if index <= current) {
            return Ok(false);
        }

        let (term, voted_for) = self.inner.voted_for_current_term();
        self.persist(term, voted_for.as_deref(), Some(index))?;
        self.inner.store_commit_index_if_increased(index)
    }

    fn current_term(&self) -> Term {
        self.inner.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.inner.voted_for_current_term()
    }

    fn commit_index(&self) -> Option<Index> {
        self.inner.commit_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    #[test]
    fn vote_once_per_term() {
        let mut state = VolatileLocalState::new(id("me"));

        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());

        assert!(!state.store_vote_for_term_if_unvoted(Term::new(2), id("a")).unwrap());
        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), id("a")).unwrap());
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), id("b")).unwrap());

        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(3));
        assert_eq!(voted_for.as_deref(), Some(&id("a")));

        // New term clears the vote.
        assert!(state.store_term_if_increased(Term::new(4)).unwrap());
        assert_eq!(state.voted_for_current_term().1, None);
    }

    #[test]
    fn file_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("term_state");

        {
            let mut state = FileLocalState::open(&path, id("me")).unwrap();
            assert_eq!(state.current_term(), Term::new(0));
            assert!(state.store_term_if_increased(Term::new(7)).unwrap());
            assert!(state.store_vote_for_term_if_unvoted(Term::new(7), id("peer")).unwrap());
        }

        {
            let mut state = FileLocalState::open(&path, id("me")).unwrap();
            let (term, voted_for) = state.voted_for_current_term();
            assert_eq!(term, Term::new(7));
            assert_eq!(voted_for.as_deref(), Some(&id("peer")));
            // Already voted this term, even across restarts.
            assert!(!state.store_vote_for_term_if_unvoted(Term::new(7), id("other")).unwrap());

            assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(8));
        }

        let state = FileLocalState::open(&path, id("me")).unwrap();
        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(8));
        assert_eq!(voted_for.as_deref(), Some(&id("me")));
    }

    #[test]
    fn commit_index_survives_reopen_and_term_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("term_state");

        {
            let mut state = FileLocalState::open(&path, id("me")).unwrap();
            assert_eq!(state.commit_index(), None);
            assert!(state.store_commit_index_if_increased(Index::new(4)).unwrap());
            assert!(!state.store_commit_index_if_increased(Index::new(3)).unwrap());
            assert!(!state.store_commit_index_if_increased(Index::new(4)).unwrap());
            // Term and vote writes carry the commit index along.
            assert!(state.store_term_if_increased(Term::new(2)).unwrap());
            assert!(state.store_vote_for_term_if_unvoted(Term::new(2), id("peer")).unwrap());
        }

        let mut state = FileLocalState::open(&path, id("me")).unwrap();
        assert_eq!(state.commit_index(), Some(Index::new(4)));
        assert_eq!(state.voted_for_current_term().1.as_deref(), Some(&id("peer")));

        assert!(state.store_commit_index_if_increased(Index::new(9)).unwrap());
        let state = FileLocalState::open(&path, id("me")).unwrap();
        assert_eq!(state.commit_index(), Some(Index::new(9)));
        assert_eq!(state.current_term(), Term::new(2));
    }

    #[test]
    fn garbage_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("term_state");
        fs::write(&path, [0xFF, 0xFF, 0xFF]).unwrap();

        assert!(matches!(
            FileLocalState::open(&path, id("me")),
            Err(StorageError::Corruption(_))
        ));
    }
}
