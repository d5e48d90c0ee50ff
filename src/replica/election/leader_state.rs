use crate::commitlog::Index;
use crate::replica::election::timers::LeaderTimerHandle;
use crate::replica::ReplicaId;
use std::cmp;
use std::collections::{HashMap, HashSet};

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(super) fn insert_peer(&mut self, peer_id: ReplicaId, peer_state: PeerState) {
        self.peer_state.insert(peer_id, peer_state);
    }

    /// Dropping the state stops the peer's heartbeat timer.
    pub(super) fn remove_peer(&mut self, peer_id: &ReplicaId) {
        self.peer_state.remove(peer_id);
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(crate) fn matched_index(&self, peer_id: &ReplicaId) -> Option<Index> {
        self.peer_state.get(peer_id).and_then(|ps| ps.matched())
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    leader_timer_handler: LeaderTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    // After initial reconciliation of follower logs, this will converge
    // to always be the same as `next - 1`.
    matched: Option<Index>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(leader_timer_handler: LeaderTimerHandle, previous_log_entry_index: Option<Index>) -> Self {
        PeerState {
            leader_timer_handler,
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.update_log(previous_log_entry, num_entries_replicated);
            }
            PeerStateUpdate::PeerLogBehind { peer_last_log_index } => {
                self.rewind_log(logger, peer_last_log_index);
            }
            PeerStateUpdate::SnapshotInstalled { last_included_index } => {
                self.matched = Some(cmp::max(last_included_index, self.matched.unwrap_or(last_included_index)));
                self.next = cmp::max(self.next, last_included_index.plus(1));
            }
        }
    }

    fn update_log(&mut self, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        let new_matched = match (previous_log_entry, num_entries_replicated) {
            // Heartbeat against an empty log tells us nothing.
            (None, 0) => return,
            (None, n) => Index::new_usize(n),
            // A successful heartbeat still proves the peer's log matches ours through `prev`.
            (Some(prev), n) => prev.plus(n as u64),
        };

        if let Some(matched) = self.matched {
            if new_matched <= matched {
                return;
            }
        }

        self.matched.replace(new_matched);
        self.next = cmp::max(self.next, new_matched.plus(1));
    }

    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        if let Some(matched) = self.matched {
            if peer_last_log_index.map_or(true, |last| last < matched) {
                slog::warn!(
                    logger,
                    "Peer log ends at {:?}, before the {:?} it acknowledged. Lowering matched index.",
                    peer_last_log_index,
                    matched
                );
                // What's left is a prefix of what matched, so it still matches.
                self.matched = peer_last_log_index;
            }
        }

        let one_back = match self.next.checked_minus(1) {
            Some(index) => index,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        // Skip straight past the end of the peer's log if it's shorter than what we tried.
        let past_peer_log = peer_last_log_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        // Never retry below what the peer is known to hold.
        let floor = self.matched.map(|i| i.plus(1)).unwrap_or_else(Index::start_index);
        self.next = cmp::max(floor, cmp::min(one_back, past_peer_log));
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.leader_timer_handler.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        peer_last_log_index: Option<Index>,
    },
    SnapshotInstalled {
        last_included_index: Index,
    },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::Term;
    use std::time::Duration;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    // The timer task needs a runtime, so every test here is async even though PeerState isn't.
    fn peer_state(previous_log_entry_index: Option<Index>) -> (PeerState, ActorClient) {
        let (actor_client, _rx) = ActorClient::new(10);
        let timer = LeaderTimerHandle::spawn_timer_task(
            Duration::from_secs(60),
            actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(1),
        );
        (PeerState::new(timer, previous_log_entry_index), actor_client)
    }

    fn send(ps: &mut PeerState, update: PeerStateUpdate) {
        let seq_no = ps.next_seq_no();
        assert!(ps.has_outstanding_request());
        ps.handle_append_entries_result(&logger(), seq_no, update);
        assert!(!ps.has_outstanding_request());
    }

    #[tokio::test]
    async fn rewind_uses_peer_hint_then_catches_up() {
        let (mut ps, _client) = peer_state(Some(Index::new(10)));
        assert_eq!(ps.next_and_previous_log_index(), (Index::new(11), Some(Index::new(10))));

        send(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: Some(Index::new(4)),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(5));

        // Hint beyond where we are doesn't move us forward.
        send(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: Some(Index::new(8)),
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(4));

        send(
            &mut ps,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(3)),
                num_entries_replicated: 7,
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(10)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(11));
    }

    #[tokio::test]
    async fn shorter_peer_log_lowers_matched() {
        let (mut ps, _client) = peer_state(Some(Index::new(10)));
        send(
            &mut ps,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(10)),
                num_entries_replicated: 0,
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(10)));

        // Peer came back having lost its tail.
        send(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: Some(Index::new(6)),
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(6)));
        assert_eq!(ps.next_and_previous_log_index(), (Index::new(7), Some(Index::new(6))));

        send(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: None,
            },
        );
        assert_eq!(ps.matched(), None);
        assert_eq!(ps.next_and_previous_log_index(), (Index::new(1), None));
    }

    #[tokio::test]
    async fn rejection_never_rewinds_below_matched() {
        let (mut ps, _client) = peer_state(Some(Index::new(5)));
        send(
            &mut ps,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 0,
            },
        );

        send(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: Some(Index::new(9)),
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(5)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(6));
    }

    #[tokio::test]
    async fn heartbeat_success_sets_matched() {
        let (mut ps, _client) = peer_state(Some(Index::new(5)));
        send(
            &mut ps,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 0,
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(5)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(6));
    }

    #[tokio::test]
    async fn stale_seq_no_is_dropped() {
        let (mut ps, _client) = peer_state(None);
        let first = ps.next_seq_no();
        let second = ps.next_seq_no();

        ps.handle_append_entries_result(
            &logger(),
            second,
            PeerStateUpdate::Success {
                previous_log_entry: None,
                num_entries_replicated: 2,
            },
        );
        ps.handle_append_entries_result(
            &logger(),
            first,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: None,
            },
        );

        assert_eq!(ps.matched(), Some(Index::new(2)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(3));
    }

    #[tokio::test]
    async fn snapshot_install_jumps_forward() {
        let (mut ps, _client) = peer_state(Some(Index::new(20)));
        send(
            &mut ps,
            PeerStateUpdate::PeerLogBehind {
                peer_last_log_index: None,
            },
        );
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(1));

        send(
            &mut ps,
            PeerStateUpdate::SnapshotInstalled {
                last_included_index: Index::new(15),
            },
        );
        assert_eq!(ps.matched(), Some(Index::new(15)));
        assert_eq!(ps.next_and_previous_log_index().0, Index::new(16));
    }
}
