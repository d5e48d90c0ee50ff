use crate::commitlog::Index;
use crate::replica::Term;
use crate::state_machine::{ApplyError, CommandOutput};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// How a submitted command ended, as seen by the node it was submitted to.
#[derive(Debug)]
pub(crate) enum CommandOutcome {
    Applied {
        index: Index,
        result: Result<CommandOutput, ApplyError>,
    },
    /// A different entry (from another leader) committed at the index we were waiting on.
    LeadershipLost,
    /// The index was folded into a snapshot received from the leader before we applied it
    /// ourselves, so the result was never computed here.
    ResultUnavailable,
}

pub(crate) type CommandWaiter = oneshot::Sender<CommandOutcome>;

/// PendingCommands maps a log index to whoever is waiting for it. The replica registers a waiter
/// when it appends the entry. The applier resolves it once that index is applied.
#[derive(Clone, Default)]
pub(crate) struct PendingCommands {
    waiters: Arc<Mutex<BTreeMap<Index, (Term, CommandWaiter)>>>,
}

impl PendingCommands {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, index: Index, term: Term, waiter: CommandWaiter) {
        let replaced = self
            .waiters
            .lock()
            .expect("PendingCommands.register() mutex guard poison")
            .insert(index, (term, waiter));

        // Our earlier entry at this index was truncated away by a newer leader.
        if let Some((_, stale_waiter)) = replaced {
            let _ = stale_waiter.send(CommandOutcome::LeadershipLost);
        }
    }

    /// Called for every applied entry, in index order.
    pub(crate) fn resolve(&self, index: Index, applied_term: Term, result: Result<CommandOutput, ApplyError>) {
        let waiter = self
            .waiters
            .lock()
            .expect("PendingCommands.resolve() mutex guard poison")
            .remove(&index);

        if let Some((expected_term, waiter)) = waiter {
            let outcome = if expected_term == applied_term {
                CommandOutcome::Applied { index, result }
            } else {
                CommandOutcome::LeadershipLost
            };
            // Receiver may have timed out and gone away. The entry still applied.
            let _ = waiter.send(outcome);
        }
    }

    /// Fails every waiter at or below `index`.
    pub(crate) fn resolve_through_snapshot(&self, index: Index) {
        let covered = {
            let mut waiters = self
                .waiters
                .lock()
                .expect("PendingCommands.resolve_through_snapshot() mutex guard poison");
            let retained = waiters.split_off(&index.plus(1));
            std::mem::replace(&mut *waiters, retained)
        };

        for (_, (_, waiter)) in covered {
            let _ = waiter.send(CommandOutcome::ResultUnavailable);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters
            .lock()
            .expect("PendingCommands.len() mutex guard poison")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_gets_result_for_matching_term() {
        let pending = PendingCommands::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(Index::new(4), Term::new(2), tx);

        pending.resolve(Index::new(3), Term::new(2), Ok(CommandOutput::Noop));
        assert!(rx.try_recv().is_err());

        pending.resolve(Index::new(4), Term::new(2), Ok(CommandOutput::ConnectionStringWritten));
        match rx.try_recv() {
            Ok(CommandOutcome::Applied { index, result }) => {
                assert_eq!(index, Index::new(4));
                assert_eq!(result, Ok(CommandOutput::ConnectionStringWritten));
            }
            other => panic!("Unexpected outcome: {:?}", other),
        }
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn different_term_at_index_means_leadership_lost() {
        let pending = PendingCommands::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(Index::new(4), Term::new(2), tx);

        pending.resolve(Index::new(4), Term::new(3), Ok(CommandOutput::Noop));
        assert!(matches!(rx.try_recv(), Ok(CommandOutcome::LeadershipLost)));
    }

    #[test]
    fn re_registering_an_index_fails_the_old_waiter() {
        let pending = PendingCommands::new();
        let (old_tx, mut old_rx) = oneshot::channel();
        let (new_tx, _new_rx) = oneshot::channel();
        pending.register(Index::new(4), Term::new(2), old_tx);
        pending.register(Index::new(4), Term::new(5), new_tx);

        assert!(matches!(old_rx.try_recv(), Ok(CommandOutcome::LeadershipLost)));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn snapshot_fails_covered_waiters_only() {
        let pending = PendingCommands::new();
        let mut receivers = Vec::new();
        for i in 1..=4 {
            let (tx, rx) = oneshot::channel();
            pending.register(Index::new(i), Term::new(1), tx);
            receivers.push(rx);
        }

        pending.resolve_through_snapshot(Index::new(2));

        assert!(matches!(receivers[0].try_recv(), Ok(CommandOutcome::ResultUnavailable)));
        assert!(matches!(receivers[1].try_recv(), Ok(CommandOutcome::ResultUnavailable)));
        assert!(receivers[2].try_recv().is_err());
        assert_eq!(pending.len(), 2);
    }
}
