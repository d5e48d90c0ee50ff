use crate::commitlog::Index;
use crate::replica::Term;
use crate::state_machine::ClusterState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// The applied state as of some log position.
#[derive(Clone, Debug)]
pub(crate) struct AppliedState {
    pub(crate) state: ClusterState,
    pub(crate) last_applied: Option<(Index, Term)>,
}

impl AppliedState {
    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied.map(|(index, _)| index)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PoolStats {
    pub(crate) max_open_reads: usize,
    pub(crate) reads_in_flight: usize,
    pub(crate) reads_opened: u64,
    pub(crate) writes_committed: u64,
    pub(crate) writes_rolled_back: u64,
}

/// ContextPool hands out transactions over the applied state.
///
/// Readers share an immutable `Arc` view of the latest published state and never see a
/// half-applied entry. A writer works on a structure-sharing clone of that state (see
/// `ClusterState`), so it copies only what its command changes, and publishes it in one swap on
/// commit. Only one writer may be open at a time. A semaphore caps how many read contexts are
/// open at once; callers wait once all permits are checked out.
#[derive(Clone)]
pub(crate) struct ContextPool {
    inner: Arc<Inner>,
}

struct Inner {
    current: RwLock<Arc<AppliedState>>,
    writer_lock: Arc<tokio::sync::Mutex<()>>,
    read_permits: Arc<Semaphore>,
    max_open_reads: usize,
    applied_tx: watch::Sender<u64>,
    // Keeps the channel open so `send()` always lands.
    applied_rx: watch::Receiver<u64>,
    reads_opened: AtomicU64,
    writes_committed: AtomicU64,
    writes_rolled_back: AtomicU64,
}

impl ContextPool {
    pub(crate) fn new(initial: AppliedState, max_open_reads: usize) -> Self {
        assert!(max_open_reads > 0, "ContextPool needs room for at least one reader");

        let applied = initial.last_applied_index().map(|i| i.as_u64()).unwrap_or(0);
        let (applied_tx, applied_rx) = watch::channel(applied);

        ContextPool {
            inner: Arc::new(Inner {
                current: RwLock::new(Arc::new(initial)),
                writer_lock: Arc::new(tokio::sync::Mutex::new(())),
                read_permits: Arc::new(Semaphore::new(max_open_reads)),
                max_open_reads,
                applied_tx,
                applied_rx,
                reads_opened: AtomicU64::new(0),
                writes_committed: AtomicU64::new(0),
                writes_rolled_back: AtomicU64::new(0),
            }),
        }
    }

    /// Waits for a read permit, then pins the latest applied state.
    pub(crate) async fn acquire_read_context(&self) -> ReadContext {
        let permit = self
            .inner
            .read_permits
            .clone()
            .acquire_owned()
            .await
            .expect("ContextPool read semaphore is never closed");

        self.inner.reads_opened.fetch_add(1, Ordering::Relaxed);
        ReadContext {
            view: self.inner.latest(),
            _permit: permit,
        }
    }

    /// Waits for any other writer to finish, then opens a working copy that shares structure with
    /// the published state.
    pub(crate) async fn acquire_write_context(&self) -> WriteContext {
        let guard = self.inner.writer_lock.clone().lock_owned().await;
        let working = (*self.inner.latest()).clone();

        WriteContext {
            working,
            pool: self.inner.clone(),
            committed: false,
            _guard: guard,
        }
    }

    /// Resolves once everything through `index` has been applied.
    pub(crate) async fn wait_for_applied(&self, index: Index) {
        let mut rx = self.inner.applied_rx.clone();
        while *rx.borrow() < index.as_u64() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn last_applied(&self) -> Option<(Index, Term)> {
        self.inner.latest().last_applied
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            max_open_reads: self.inner.max_open_reads,
            reads_in_flight: self.inner.max_open_reads - self.inner.read_permits.available_permits(),
            reads_opened: self.inner.reads_opened.load(Ordering::Relaxed),
            writes_committed: self.inner.writes_committed.load(Ordering::Relaxed),
            writes_rolled_back: self.inner.writes_rolled_back.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn latest(&self) -> Arc<AppliedState> {
        self.current
            .read()
            .expect("ContextPool.current lock poison")
            .clone()
    }
}

/// A consistent view of the applied state. Holding it doesn't block the writer.
pub(crate) struct ReadContext {
    view: Arc<AppliedState>,
    _permit: OwnedSemaphorePermit,
}

impl ReadContext {
    pub(crate) fn state(&self) -> &ClusterState {
        &self.view.state
    }

    #[cfg(test)]
    fn last_applied_index(&self) -> Option<Index> {
        self.view.last_applied_index()
    }
}

/// Exclusive read-write transaction. Changes become visible only on `commit()`; dropping the
/// context throws them away.
pub(crate) struct WriteContext {
    working: AppliedState,
    pool: Arc<Inner>,
    committed: bool,
    _guard: OwnedMutexGuard<()>,
}

impl WriteContext {
    pub(crate) fn state_mut(&mut self) -> &mut ClusterState {
        &mut self.working.state
    }

    /// Replaces the whole state, e.g. from a snapshot.
    pub(crate) fn replace_state(&mut self, state: ClusterState) {
        self.working.state = state;
    }

    #[cfg(test)]
    fn last_applied(&self) -> Option<(Index, Term)> {
        self.working.last_applied
    }

    /// Publishes the working copy as the state after applying `(index, term)`.
    pub(crate) fn commit(mut self, index: Index, term: Term) {
        if let Some(previous) = self.working.last_applied_index() {
            assert!(
                index >= previous,
                "Applied index moved backwards: {:?} -> {:?}",
                previous,
                index
            );
        }
        self.working.last_applied = Some((index, term));

        let published = Arc::new(AppliedState {
            state: std::mem::take(&mut self.working.state),
            last_applied: self.working.last_applied,
        });
        *self
            .pool
            .current
            .write()
            .expect("ContextPool.current lock poison") = published;
        let _ = self.pool.applied_tx.send(index.as_u64());

        self.pool.writes_committed.fetch_add(1, Ordering::Relaxed);
        self.committed = true;
    }
}

impl Drop for WriteContext {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.writes_rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Command;
    use serde_json::json;
    use std::time::Duration;

    fn empty_pool(max_open_reads: usize) -> ContextPool {
        ContextPool::new(
            AppliedState {
                state: ClusterState::default(),
                last_applied: None,
            },
            max_open_reads,
        )
    }

    fn put(name: &str) -> Command {
        Command::PutRecord {
            name: name.into(),
            payload: json!({"name": name}),
            expected_version: None,
        }
    }

    #[tokio::test]
    async fn readers_keep_their_view_across_commits() {
        let pool = empty_pool(2);
        let before = pool.acquire_read_context().await;

        let mut write = pool.acquire_write_context().await;
        write.state_mut().apply(1, &put("db1")).unwrap();

        // Not visible until commit.
        let during = pool.acquire_read_context().await;
        assert!(during.state().record("db1").is_none());
        drop(during);

        write.commit(Index::new(1), Term::new(1));

        assert!(before.state().record("db1").is_none());
        assert_eq!(before.last_applied_index(), None);

        let after = pool.acquire_read_context().await;
        assert!(after.state().record("db1").is_some());
        assert_eq!(after.last_applied_index(), Some(Index::new(1)));
    }

    #[tokio::test]
    async fn dropped_write_context_rolls_back() {
        let pool = empty_pool(1);
        {
            let mut write = pool.acquire_write_context().await;
            write.state_mut().apply(1, &put("db1")).unwrap();
        }

        let read = pool.acquire_read_context().await;
        assert!(read.state().record("db1").is_none());
        assert_eq!(pool.last_applied(), None);
        assert_eq!(pool.stats().writes_rolled_back, 1);
        assert_eq!(pool.stats().writes_committed, 0);
    }

    #[tokio::test]
    async fn one_writer_at_a_time() {
        let pool = empty_pool(1);
        let first = pool.acquire_write_context().await;

        let pool_clone = pool.clone();
        let mut second = tokio::spawn(async move {
            let write = pool_clone.acquire_write_context().await;
            write.last_applied()
        });

        assert!(tokio::time::timeout(Duration::from_millis(50), &mut second).await.is_err());

        first.commit(Index::new(1), Term::new(1));
        let seen = second.await.unwrap();
        assert_eq!(seen, Some((Index::new(1), Term::new(1))));
    }

    #[tokio::test]
    async fn open_reads_are_bounded() {
        let pool = empty_pool(2);
        let a = pool.acquire_read_context().await;
        let _b = pool.acquire_read_context().await;
        assert_eq!(pool.stats().reads_in_flight, 2);

        // Third reader waits for a permit.
        assert!(tokio::time::timeout(Duration::from_millis(50), pool.acquire_read_context())
            .await
            .is_err());

        drop(a);
        let _c = pool.acquire_read_context().await;
        assert_eq!(pool.stats().reads_in_flight, 2);
        assert_eq!(pool.stats().reads_opened, 3);
    }

    #[tokio::test]
    async fn open_reader_does_not_block_writes() {
        let pool = empty_pool(1);
        let reader = pool.acquire_read_context().await;

        for i in 1..=3 {
            let mut write = pool.acquire_write_context().await;
            write.state_mut().apply(i, &put(&format!("db{}", i))).unwrap();
            write.commit(Index::new(i), Term::new(1));
        }

        assert_eq!(reader.state().records_with_prefix("db").count(), 0);
        assert_eq!(pool.last_applied(), Some((Index::new(3), Term::new(1))));
        assert_eq!(pool.stats().writes_committed, 3);
    }

    #[tokio::test]
    async fn wait_for_applied_resolves_after_commit() {
        let pool = empty_pool(1);

        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move { pool_clone.wait_for_applied(Index::new(2)).await });

        let write = pool.acquire_write_context().await;
        write.commit(Index::new(1), Term::new(1));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let write = pool.acquire_write_context().await;
        write.commit(Index::new(2), Term::new(1));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
