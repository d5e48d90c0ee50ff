use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log, StorageError};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesReq,
    ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoRequestVoteReq,
};
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateSnapshot, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::MembershipChange;
use crate::replica::peer_client::PeerClient;
use crate::replica::peers::{ClusterTracker, Peer, ReplicaId};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, EnqueueForReplicationError,
    EnqueueForReplicationInput, EnqueueForReplicationOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, InstallSnapshotReplyFromPeer, InstallSnapshotReplyFromPeerError, LeaderRedirectInfo,
    LeaderTimerTick, ReplicaStatus, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    RequestVoteReplyFromPeer, RequestVoteResult, TermOutOfDateInfo,
};
use crate::replica::snapshot::{Snapshot, SnapshotStore};
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLog, WriteAheadLogEntry};
use crate::replica::ElectionStateChangeListener;
use crate::server::RpcServerShutdownHandle;
use crate::state_machine::PendingCommands;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::error::Elapsed;
use tokio::time::Duration;
use tonic::Status;

pub(crate) struct ReplicaConfig<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) write_ahead_log: WriteAheadLog<L>,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) snapshot_store: SnapshotStore,
    pub(crate) pending_commands: PendingCommands,
    pub(crate) actor_client: WeakActorClient,
    // Dropped with the replica, which stops the RPC server.
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
}

/// Replica is the raft state machine of one cluster member. Every method runs on the actor's
/// event loop, so none of them may block on the network; outbound RPCs are spawned and their
/// replies come back as events.
pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    wal: WriteAheadLog<L>,
    snapshot_store: SnapshotStore,
    pending_commands: PendingCommands,
    actor_client: WeakActorClient,
    append_entries_timeout: Duration,
    max_entries_per_append: usize,
    // Index of the latest configuration entry appended by us as leader (or found uncommitted in our
    // log when we became leader). While it's uncommitted, no other change may be proposed.
    pending_config_index: Option<Index>,
    _server_shutdown_handle: Option<RpcServerShutdownHandle>,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(config: ReplicaConfig<L>) -> (Self, ElectionStateChangeListener) {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        let (election_state, listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                leader_heartbeat_duration: config.leader_heartbeat_duration,
                follower_min_timeout: config.follower_min_timeout,
                follower_max_timeout: config.follower_max_timeout,
            },
            config.actor_client.clone(),
        );

        let replica = Replica {
            logger: config.logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state,
            wal: config.write_ahead_log,
            snapshot_store: config.snapshot_store,
            pending_commands: config.pending_commands,
            actor_client: config.actor_client,
            append_entries_timeout: config.append_entries_timeout,
            max_entries_per_append: config.max_entries_per_append.max(1),
            pending_config_index: None,
            _server_shutdown_handle: config.server_shutdown_handle,
        };

        (replica, listener)
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        // Leader check
        match self.election_state.current_state() {
            ElectionStateSnapshot::Leader => { /* carry on */ }
            ElectionStateSnapshot::Follower(leader_id) => {
                return match self.cluster_tracker.metadata(&leader_id) {
                    Some(leader) => Err(EnqueueForReplicationError::LeaderRedirect(LeaderRedirectInfo {
                        replica_id: leader_id,
                        address: leader.address().to_string(),
                    })),
                    None => Err(EnqueueForReplicationError::NoLeader),
                };
            }
            ElectionStateSnapshot::Candidate | ElectionStateSnapshot::FollowerNoLeader => {
                return Err(EnqueueForReplicationError::NoLeader);
            }
        }

        if input.kind == EntryKind::Configuration && self.has_configuration_change_in_flight() {
            return Err(EnqueueForReplicationError::ConflictingChangeInFlight);
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let appended_index = self
            .wal
            .append(WriteAheadLogEntry {
                term,
                kind: input.kind,
                data: input.data,
            })
            .map_err(EnqueueForReplicationError::LocalIoError)?;

        if input.kind == EntryKind::Configuration {
            self.pending_config_index.replace(appended_index);
        }
        if let Some(waiter) = input.waiter {
            self.pending_commands.register(appended_index, term, waiter);
        }

        // Single member clusters commit right here.
        self.advance_leader_commit_index();
        self.replicate_to_all_peers();

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: appended_index,
        })
    }

    fn has_configuration_change_in_flight(&self) -> bool {
        match (self.pending_config_index, self.wal.commit_index()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(pending), Some(committed)) => pending > committed,
        }
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // A replica outside the configuration (removed, or not yet joined) must not disrupt us.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            slog::info!(
                self.logger,
                "Not granting vote. Candidate {:?} is not a member.",
                input.candidate_id
            );
            return Ok(RequestVoteOutput {
                vote_granted: false,
                current_term,
            });
        }

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Ok(RequestVoteOutput {
                vote_granted: false,
                current_term,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(RequestVoteError::LocalIoError)?;
        if increased {
            self.election_state.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }
        let current_term = input.candidate_term;

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput {
                    vote_granted: false,
                    current_term,
                });
            }
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput {
                vote_granted: false,
                current_term,
            });
        }

        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RequestVoteError::LocalIoError)?;

        let vote_granted = if cas_success {
            true
        } else {
            // Candidate retried. Grant again if the vote we stored is for them.
            match self.local_state.voted_for_current_term() {
                (reread_term, Some(reread_voted_for)) => {
                    reread_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id
                }
                _ => false,
            }
        };

        if vote_granted {
            slog::info!(self.logger, "Voted for {:?} in term {:?}.", input.candidate_id, current_term);
            // Granting a vote counts as hearing from a would-be leader.
            self.election_state.reset_timeout_if_follower();
        }

        Ok(RequestVoteOutput {
            vote_granted,
            current_term,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.wal.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                (candidate_term, candidate_index) >= (my_term, my_index)
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();

        if let RequestVoteResult::VoteNotGranted { peer_term } = reply.result {
            if peer_term > current_term {
                self.step_down_for_newer_term(peer_term);
                return;
            }
        }

        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                if !self.cluster_tracker.contains_member(&reply.peer_id) {
                    slog::warn!(self.logger, "Ignoring vote from non-member {:?}", reply.peer_id);
                    return;
                }

                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::debug!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.cluster_tracker.num_voting_replicas(),
                    reply.term,
                );

                if num_votes_received >= self.cluster_tracker.quorum_size() {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted { .. } => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::Failure => {
                slog::debug!(self.logger, "No vote from {:?} for term {:?}", reply.peer_id, reply.term);
            }
        }
    }

    fn become_leader(&mut self, term: Term) {
        let latest_index = self.wal.latest_entry().map(|(_, index)| index);
        self.election_state
            .transition_to_leader(term, self.cluster_tracker.peer_ids(), latest_index);
        slog::info!(self.logger, "Won election for term {:?}. Log ends at {:?}.", term, latest_index);

        // A change appended by a previous leader may still be in our log. It counts as in flight.
        self.pending_config_index = match self.find_uncommitted_configuration_entry() {
            Ok(index) => index,
            Err(e) => {
                slog::error!(self.logger, "Failed to scan log for configuration entries: {:?}", e);
                latest_index
            }
        };

        // > a leader must have the latest information on which entries are committed ... Raft
        // > handles this by having each leader commit a blank no-op entry into the log at the start
        // > of its term.
        let no_op = WriteAheadLogEntry {
            term,
            kind: EntryKind::Data,
            data: Vec::new(),
        };
        if let Err(e) = self.wal.append(no_op) {
            slog::error!(self.logger, "Failed to append no-op as new leader: {:?}", e);
        }

        self.advance_leader_commit_index();
    }

    fn find_uncommitted_configuration_entry(&self) -> Result<Option<Index>, StorageError> {
        let last_index = match self.wal.latest_entry() {
            Some((_, index)) => index,
            None => return Ok(None),
        };
        let from = match self.wal.commit_index() {
            Some(ci) => ci.plus(1),
            None => self.wal.first_index(),
        };
        if from > last_index {
            return Ok(None);
        }

        let mut found = None;
        let mut index = from;
        for entry in self.wal.read_range(from, last_index)? {
            if entry.kind == EntryKind::Configuration {
                found = Some(index);
            }
            index = index.plus(1);
        }

        Ok(found)
    }

    fn step_down_for_newer_term(&mut self, new_term: Term) {
        match self.local_state.store_term_if_increased(new_term) {
            Ok(true) => {
                self.election_state.transition_to_follower(None);
                slog::info!(
                    self.logger,
                    "Observed newer term {:?}. Transitioned to follower.",
                    new_term
                );
            }
            Ok(false) => {}
            Err(e) => slog::error!(self.logger, "Failed to persist term {:?}: {:?}", new_term, e),
        }
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.observe_leader(input.leader_term, &input.leader_id)
            .map_err(|e| match e {
                ObserveLeaderError::TermOutOfDate(info) => AppendEntriesError::ClientTermOutOfDate(info),
                ObserveLeaderError::Io(e) => AppendEntriesError::ServerIoError(e),
            })?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            match self.wal.term_at(leader_prev_entry_index) {
                Ok(Some(my_term)) if my_term == leader_prev_entry_term => { /* match */ }
                Ok(_) => {
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                        last_log_entry_index: self.wal.latest_entry().map(|(_, index)| index),
                    })
                }
                // Compacted entries are committed, and committed entries match the leader's.
                Err(StorageError::Compacted(_)) => {}
                Err(e) => return Err(AppendEntriesError::ServerIoError(e)),
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let snapshot_index = self.wal.snapshot_point().map(|(_, index)| index);
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let mut to_append = Vec::new();
        for new_entry in input.new_entries {
            let index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);

            if !to_append.is_empty() {
                to_append.push(new_entry);
                continue;
            }
            if matches!(snapshot_index, Some(si) if index <= si) {
                continue;
            }

            match self.wal.term_at(index).map_err(AppendEntriesError::ServerIoError)? {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => {}
                // 3. (delete)
                Some(_) => {
                    slog::info!(self.logger, "Truncating conflicting log suffix from {:?}", index);
                    self.wal.truncate(index).map_err(AppendEntriesError::ServerIoError)?;
                    to_append.push(new_entry);
                }
                None => to_append.push(new_entry),
            }
        }
        self.wal
            .append_all(to_append)
            .map_err(AppendEntriesError::ServerIoError)?;

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            let new_commit_index = std::cmp::min(leader_commit_index, index_of_last_new_entry);
            if matches!(self.wal.latest_entry(), Some((_, latest)) if latest >= new_commit_index) {
                self.wal.ratchet_fwd_commit_index(new_commit_index);
            }
        }

        // Durable before we ack, so a restart never forgets a configuration it acted on.
        self.persist_commit_index()
            .map_err(AppendEntriesError::ServerIoError)?;

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.dispatch_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.observe_leader(input.leader_term, &input.leader_id)
            .map_err(|e| match e {
                ObserveLeaderError::TermOutOfDate(info) => InstallSnapshotError::ClientTermOutOfDate(info),
                ObserveLeaderError::Io(e) => InstallSnapshotError::ServerIoError(e),
            })?;

        let last_included_index = input.metadata.last_included_index;
        if matches!(self.wal.last_dispatched_index(), Some(d) if d >= last_included_index) {
            slog::info!(
                self.logger,
                "Already applied through {:?}, ignoring snapshot through {:?}",
                self.wal.last_dispatched_index(),
                last_included_index
            );
            return Ok(InstallSnapshotOutput {});
        }

        // Save first. If we crash after this, we restart from the snapshot and drop the stale log.
        self.snapshot_store
            .save(Snapshot {
                metadata: input.metadata.clone(),
                data: input.data.clone(),
            })
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.wal
            .install_snapshot(&input.metadata, input.data)
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.cluster_tracker.reset_membership(input.metadata.membership);
        self.pending_config_index = None;

        slog::info!(
            self.logger,
            "Installed snapshot through {:?} (term {:?}) from {:?}",
            last_included_index,
            input.metadata.last_included_term,
            input.leader_id
        );

        Ok(InstallSnapshotOutput {})
    }

    /// Common prologue of leader-to-follower RPCs.
    fn observe_leader(&mut self, leader_term: Term, leader_id: &ReplicaId) -> Result<(), ObserveLeaderError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if leader_term < current_term {
            return Err(ObserveLeaderError::TermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(leader_term)
            .map_err(ObserveLeaderError::Io)?;
        if increased || self.election_state.is_candidate() || self.election_state.is_leader() {
            if self.election_state.is_leader() && !increased {
                slog::error!(
                    self.logger,
                    "Two leaders in term {:?}: us and {:?}. Stepping down.",
                    leader_term,
                    leader_id
                );
            }
            self.election_state.transition_to_follower(Some(leader_id.clone()));
        } else {
            self.election_state.set_leader_if_unknown(leader_id);
        }

        self.election_state.reset_timeout_if_follower();

        Ok(())
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.descriptor.peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        // 1. Check for stale term rejection
        let peer_log_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if new_term > self.local_state.current_term() {
                    self.step_down_for_newer_term(new_term);
                    return;
                }
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { peer_last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer log ends at {:?}", peer_last_log_index);
                PeerStateUpdate::PeerLogBehind { peer_last_log_index }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::debug!(logger, "AE failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => PeerStateUpdate::Success {
                previous_log_entry: reply.descriptor.previous_log_entry_index,
                num_entries_replicated: reply.descriptor.num_log_entries,
            },
        };

        let descriptor = reply.descriptor;
        self.update_peer_progress(
            &logger,
            descriptor.peer_id,
            descriptor.term,
            descriptor.seq_no,
            peer_log_update,
        );
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.peer_id), "SeqNo" => reply.seq_no));

        let peer_log_update = match reply.result {
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) => {
                if new_term > self.local_state.current_term() {
                    self.step_down_for_newer_term(new_term);
                    return;
                }
                PeerStateUpdate::OtherError
            }
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "InstallSnapshot failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => {
                slog::info!(logger, "Peer installed snapshot through {:?}", reply.last_included_index);
                PeerStateUpdate::SnapshotInstalled {
                    last_included_index: reply.last_included_index,
                }
            }
        };

        self.update_peer_progress(&logger, reply.peer_id, reply.term, reply.seq_no, peer_log_update);
    }

    fn update_peer_progress(
        &mut self,
        logger: &slog::Logger,
        peer_id: ReplicaId,
        term: Term,
        seq_no: u64,
        update: PeerStateUpdate,
    ) {
        if self.local_state.current_term() != term {
            slog::info!(
                logger,
                "Received reply for outdated term {:?}, but we're on term {:?}",
                term,
                self.local_state.current_term()
            );
            return;
        }

        // Retrying right away after a plain failure would spin; wait for the heartbeat instead.
        let retry_now = !matches!(update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let next_index = match self.election_state.leader_state_mut() {
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
            Some(leader_state) => match leader_state.peer_state_mut(&peer_id) {
                None => {
                    slog::info!(logger, "Peer {:?} is no longer tracked", peer_id);
                    return;
                }
                Some(peer_state) => {
                    peer_state.handle_append_entries_result(logger, seq_no, update);
                    peer_state.next_and_previous_log_index().0
                }
            },
        };

        // 3. Check for majority replication and apply new commits.
        self.advance_leader_commit_index();

        // 4. Keep going while the peer is behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        let peer_is_behind = matches!(self.wal.latest_entry(), Some((_, last)) if last >= next_index);
        if retry_now && peer_is_behind {
            if let Some(peer) = self.cluster_tracker.peer(&peer_id).cloned() {
                self.replicate_to_peer(peer, term);
            }
        }
    }

    /// Ratchets the commit index forward as far as the quorum allows, applying committed
    /// configuration changes as they're reached. A change can shift the quorum, hence the loop.
    fn advance_leader_commit_index(&mut self) {
        let current_term = self.local_state.current_term();
        loop {
            let matched_indexes = match self.election_state.leader_state() {
                None => return,
                Some(leader_state) => {
                    let my_latest_index = self.wal.latest_entry().map(|(_, index)| index);
                    self.cluster_tracker
                        .members()
                        .iter()
                        .map(|member| {
                            if member.replica_id() == &self.my_replica_id {
                                my_latest_index
                            } else {
                                leader_state.matched_index(member.replica_id())
                            }
                        })
                        .collect()
                }
            };

            let tentative_new_commit_index =
                match get_cluster_commit_index(matched_indexes, self.cluster_tracker.quorum_size()) {
                    Some(index) => index,
                    None => return,
                };

            // See also:
            // > Figure 8: A time sequence showing why a leader cannot determine
            // > commitment using log entries from older terms.
            match self
                .wal
                .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
            {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    slog::warn!(
                        self.logger,
                        "IO failure while confirming new commit index {:?}: {:?}",
                        tentative_new_commit_index,
                        e
                    );
                    return;
                }
            }

            if !self.dispatch_committed_entries() {
                return;
            }
        }
    }

    /// Republishes entries that were committed before a restart but aren't covered by the
    /// snapshot, and applies the membership changes among them. Runs once, before the actor
    /// handles any event, so elections and votes already see the recovered configuration.
    pub(crate) fn replay_committed_entries(&mut self) -> Result<(), StorageError> {
        let configuration_entries = self.wal.dispatch_committed_entries()?;
        for (index, data) in configuration_entries {
            self.apply_configuration_entry(index, &data);
        }

        slog::info!(
            self.logger,
            "Recovered through commit index {:?}. Members: {:?}",
            self.wal.commit_index(),
            self.cluster_tracker.members()
        );
        Ok(())
    }

    fn persist_commit_index(&mut self) -> Result<(), StorageError> {
        if let Some(commit_index) = self.wal.commit_index() {
            self.local_state.store_commit_index_if_increased(commit_index)?;
        }
        Ok(())
    }

    /// Publishes newly committed entries to the applier. Returns true if membership changed.
    fn dispatch_committed_entries(&mut self) -> bool {
        if let Err(e) = self.persist_commit_index() {
            slog::error!(
                self.logger,
                "Failed to persist commit index {:?}: {:?}",
                self.wal.commit_index(),
                e
            );
        }

        let configuration_entries = match self.wal.dispatch_committed_entries() {
            Ok(entries) => entries,
            Err(e) => {
                slog::error!(self.logger, "Failed to read committed entries: {:?}", e);
                return false;
            }
        };

        let mut membership_changed = false;
        for (index, data) in configuration_entries {
            membership_changed |= self.apply_configuration_entry(index, &data);
        }

        membership_changed
    }

    fn apply_configuration_entry(&mut self, index: Index, data: &[u8]) -> bool {
        if matches!(self.pending_config_index, Some(pending) if pending <= index) {
            self.pending_config_index = None;
        }

        let change = match MembershipChange::decode(data) {
            Ok(change) => change,
            Err(e) => {
                slog::error!(self.logger, "Undecodable configuration entry at {:?}: {:?}", index, e);
                return false;
            }
        };
        if !self.cluster_tracker.apply_change(&change) {
            return false;
        }
        slog::info!(
            self.logger,
            "Applied configuration change at {:?}: {:?}. Members: {:?}",
            index,
            change,
            self.cluster_tracker.members()
        );

        match change {
            MembershipChange::Add(metadata) => {
                if metadata.replica_id() != &self.my_replica_id {
                    let latest_index = self.wal.latest_entry().map(|(_, index)| index);
                    self.election_state
                        .add_peer_if_leader(metadata.replica_id().clone(), latest_index);
                }
            }
            MembershipChange::Remove(replica_id) => {
                if replica_id == self.my_replica_id {
                    if self.election_state.is_leader() {
                        slog::info!(self.logger, "Removed from the cluster. Stepping down.");
                    }
                    self.election_state.transition_to_follower(None);
                } else {
                    self.election_state.remove_peer_if_leader(&replica_id);
                }
            }
        }

        true
    }

    fn replicate_to_all_peers(&mut self) {
        let current_term = self.local_state.current_term();
        let peers: Vec<Peer> = self.cluster_tracker.iter_peers().cloned().collect();
        for peer in peers {
            self.replicate_to_peer(peer, current_term);
        }
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        let peer = match self.cluster_tracker.peer(&tick.peer_id) {
            Some(peer) => peer.clone(),
            None => {
                slog::debug!(self.logger, "Peer {:?} left the configuration", tick.peer_id);
                return;
            }
        };

        self.replicate_to_peer(peer, current_term);
    }

    fn replicate_to_peer(&mut self, peer: Peer, current_term: Term) {
        let peer_id = peer.metadata.replica_id().clone();
        match self.try_replicate_to_peer(peer, current_term) {
            Ok(_) => {}
            Err(HandleLeaderTimerError::NoLongerLeader) => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.")
            }
            Err(HandleLeaderTimerError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {:?} still outstanding", peer_id)
            }
            Err(HandleLeaderTimerError::DiskRead(index, e)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, e);
            }
            Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "Wtf! LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
            Err(HandleLeaderTimerError::MissingSnapshot(index)) => {
                slog::error!(
                    self.logger,
                    "Peer {:?} needs entries before {:?}, but we have no snapshot to send.",
                    peer_id,
                    index
                );
            }
            Err(HandleLeaderTimerError::LeaderStateMissingPeer {
                leader_state_tracker_peers,
            }) => {
                slog::error!(
                    self.logger,
                    "Wtf. Peer {:?} is present in ClusterTracker but missing in LeaderStateTracker. LeaderStateTracker peers: [{:?}]",
                    peer_id,
                    leader_state_tracker_peers,
                )
            }
        }
    }

    fn try_replicate_to_peer(&mut self, peer: Peer, current_term: Term) -> Result<(), HandleLeaderTimerError> {
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(HandleLeaderTimerError::NoLongerLeader)?;
        let peer_state = match leader_state.peer_state_mut(peer.metadata.replica_id()) {
            Some(ps) => ps,
            None => {
                return Err(HandleLeaderTimerError::LeaderStateMissingPeer {
                    leader_state_tracker_peers: leader_state.peer_ids(),
                })
            }
        };

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. We still batch log entries.
        if peer_state.has_outstanding_request() {
            return Err(HandleLeaderTimerError::PeerConcurrencyThrottle);
        }

        let (next_index, _) = peer_state.next_and_previous_log_index();
        if next_index < self.wal.first_index() {
            // The entries the peer needs have been compacted. Send the snapshot instead.
            let snapshot = self
                .snapshot_store
                .latest()
                .cloned()
                .ok_or(HandleLeaderTimerError::MissingSnapshot(next_index))?;
            let seq_no = peer_state.next_seq_no();
            peer_state.reset_heartbeat_timer();

            let last_included_index = snapshot.metadata.last_included_index;
            let proto_request = leader_timer_handler::new_install_snapshot_request(
                current_term,
                self.my_replica_id.clone(),
                snapshot,
            );
            tokio::task::spawn(Self::call_peer_install_snapshot(
                self.logger.clone(),
                peer.client,
                proto_request,
                self.append_entries_timeout,
                self.actor_client.clone(),
                InstallSnapshotReplyFromPeer {
                    peer_id: peer.metadata.replica_id().clone(),
                    term: current_term,
                    seq_no,
                    last_included_index,
                    result: Ok(()),
                },
            ));

            return Ok(());
        }

        let (proto_request, descriptor) = leader_timer_handler::new_append_entries_request(
            current_term,
            self.my_replica_id.clone(),
            peer.metadata.replica_id().clone(),
            peer_state,
            &self.wal,
            self.max_entries_per_append,
        )?;

        tokio::task::spawn(Self::call_peer_append_entries(
            self.logger.clone(),
            peer.client,
            proto_request,
            self.append_entries_timeout,
            self.actor_client.clone(),
            descriptor,
        ));

        peer_state.reset_heartbeat_timer();

        Ok(())
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        rpc_request: ProtoAppendEntriesReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        slog::trace!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.append_entries(rpc_request)).await;
        slog::trace!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_input = AppendEntriesReplyFromPeer {
            descriptor,
            result: Self::convert_append_entries_rpc_reply(rpc_reply),
        };

        let _ = callback.notify_append_entries_reply_from_peer(callback_input).await;
    }

    fn convert_append_entries_rpc_reply(
        rpc_reply: Result<Result<ProtoAppendEntriesResult, Status>, Elapsed>,
    ) -> Result<(), AppendEntriesReplyFromPeerError> {
        match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
                Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                    Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                        AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                            "Explicit server fault: {:?}",
                            payload.message
                        )),
                    ),
                    Some(proto_append_entries_error::Err::StaleTerm(payload)) => {
                        Err(AppendEntriesReplyFromPeerError::StaleTerm {
                            new_term: Term::new(payload.current_term),
                        })
                    }
                    Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                        Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                            peer_last_log_index: Index::from_u64(payload.last_log_entry_index),
                        })
                    }
                    None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                        "Malformed AppendEntries Err".into(),
                    )),
                },
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed AppendEntries Result".into(),
                )),
            },
            Ok(Err(rpc_status)) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                "Un-modeled failure from AppendEntries RPC call: {:?}",
                rpc_status
            ))),
            Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        }
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        rpc_request: ProtoInstallSnapshotReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        mut reply: InstallSnapshotReplyFromPeer,
    ) {
        slog::debug!(
            logger,
            "ClientWire - InstallSnapshot through {:?} to {:?}",
            reply.last_included_index,
            reply.peer_id
        );
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.install_snapshot(rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        reply.result = Self::convert_install_snapshot_rpc_reply(rpc_reply);
        let _ = callback.notify_install_snapshot_reply_from_peer(reply).await;
    }

    fn convert_install_snapshot_rpc_reply(
        rpc_reply: Result<Result<ProtoInstallSnapshotResult, Status>, Elapsed>,
    ) -> Result<(), InstallSnapshotReplyFromPeerError> {
        match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(()),
                Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
                    Some(proto_install_snapshot_error::Err::ServerFault(payload)) => Err(
                        InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
                            "Explicit server fault: {:?}",
                            payload.message
                        )),
                    ),
                    Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => {
                        Err(InstallSnapshotReplyFromPeerError::StaleTerm {
                            new_term: Term::new(payload.current_term),
                        })
                    }
                    None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                        "Malformed InstallSnapshot Err".into(),
                    )),
                },
                None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                    "Malformed InstallSnapshot Result".into(),
                )),
            },
            Ok(Err(rpc_status)) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
                "Un-modeled failure from InstallSnapshot RPC call: {:?}",
                rpc_status
            ))),
            Err(_timeout) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                "Timed out calling InstallSnapshot".into(),
            )),
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        if self.election_state.is_leader() {
            return;
        }
        if !self.cluster_tracker.i_am_member() {
            slog::debug!(self.logger, "Not a voting member. Not starting an election.");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist new term. Not starting an election: {:?}", e);
                return;
            }
        };
        let num_votes = self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if num_votes >= self.cluster_tracker.quorum_size() {
            self.become_leader(new_term);
            return;
        }

        for peer in self.cluster_tracker.iter_peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                peer.client.clone(),
                peer.metadata.replica_id().clone(),
                self.new_request_vote_request(new_term),
                self.append_entries_timeout,
                self.actor_client.clone(),
                new_term,
            ));
        }
    }

    fn new_request_vote_request(&self, term: Term) -> ProtoRequestVoteReq {
        let (last_log_entry_term, last_log_entry_index) = match self.wal.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        ProtoRequestVoteReq {
            client_node_id: self.my_replica_id.clone().into_inner(),
            term: term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        peer_id: ReplicaId,
        rpc_request: ProtoRequestVoteReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        term: Term,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.request_vote(rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_result = match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                    if success_reply.vote_granted {
                        RequestVoteResult::VoteGranted
                    } else {
                        RequestVoteResult::VoteNotGranted {
                            peer_term: Term::new(success_reply.current_term),
                        }
                    }
                }
                Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                    Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                        slog::warn!(logger, "RequestVote Service Fault: {:?}", fault.message);
                        RequestVoteResult::Failure
                    }
                    None => RequestVoteResult::Failure,
                },
                None => RequestVoteResult::Failure,
            },
            Ok(Err(rpc_status)) => {
                slog::debug!(logger, "Un-modeled failure from RequestVote RPC call: {:?}", rpc_status);
                RequestVoteResult::Failure
            }
            Err(_timeout) => RequestVoteResult::Failure,
        };

        let callback_input = RequestVoteReplyFromPeer {
            peer_id,
            term,
            result: callback_result,
        };

        let _ = callback.notify_request_vote_reply_from_peer(callback_input).await;
    }

    /// Persists a snapshot taken by the applier, then drops the log prefix it covers.
    pub(crate) fn handle_snapshot_created(&mut self, snapshot: Snapshot) {
        let last_included_index = snapshot.metadata.last_included_index;
        let last_included_term = snapshot.metadata.last_included_term;
        if matches!(self.wal.snapshot_point(), Some((_, si)) if si >= last_included_index) {
            slog::debug!(self.logger, "Already have a snapshot through {:?}", last_included_index);
            return;
        }

        if let Err(e) = self.snapshot_store.save(snapshot) {
            slog::error!(self.logger, "Failed to save snapshot through {:?}: {:?}", last_included_index, e);
            return;
        }
        if let Err(e) = self.wal.compact_through(last_included_index, last_included_term) {
            slog::error!(self.logger, "Failed to compact log through {:?}: {:?}", last_included_index, e);
        }
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            replica_id: self.my_replica_id.clone(),
            term: self.local_state.current_term(),
            election_state: self.election_state.current_state(),
            commit_index: self.wal.commit_index(),
            last_log_index: self.wal.latest_entry().map(|(_, index)| index),
            first_log_index: self.wal.first_index(),
            snapshot_index: self.wal.snapshot_point().map(|(_, index)| index),
            members: self.cluster_tracker.members(),
        }
    }
}

enum ObserveLeaderError {
    TermOutOfDate(TermOutOfDateInfo),
    Io(StorageError),
}

enum HandleLeaderTimerError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    DiskRead(Index, StorageError),
    UnexpectedMissingLogEntry(Index),
    MissingSnapshot(Index),
    LeaderStateMissingPeer {
        leader_state_tracker_peers: HashSet<ReplicaId>,
    },
}

/// Given the matched index of every member (the leader's own being its last log index), returns
/// the highest index stored on a quorum of them.
fn get_cluster_commit_index(mut matched_indexes: Vec<Option<Index>>, quorum_size: usize) -> Option<Index> {
    // Descending. `None` sorts lowest.
    matched_indexes.sort_by(|a, b| b.cmp(a));

    match quorum_size.checked_sub(1) {
        Some(quorum_idx) => matched_indexes.get(quorum_idx).copied().flatten(),
        None => None,
    }
}

mod leader_timer_handler {
    use crate::commitlog::{Index, Log, StorageError};
    use crate::grpc::{ProtoAppendEntriesReq, ProtoInstallSnapshotReq, ProtoLogEntry};
    use crate::replica::election::PeerState;
    use crate::replica::membership::to_proto_member;
    use crate::replica::replica::HandleLeaderTimerError;
    use crate::replica::replica_api::AppendEntriesReplyFromPeerDescriptor;
    use crate::replica::snapshot::Snapshot;
    use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
    use crate::replica::{ReplicaId, Term};

    pub(super) fn new_append_entries_request<L>(
        current_term: Term,
        my_id: ReplicaId,
        peer_id: ReplicaId,
        peer_state: &mut PeerState,
        wal: &WriteAheadLog<L>,
        max_entries: usize,
    ) -> Result<(ProtoAppendEntriesReq, AppendEntriesReplyFromPeerDescriptor), HandleLeaderTimerError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let opt_previous_log_entry_metadata = match opt_previous_index {
            None => None,
            Some(previous_index) => match wal.term_at(previous_index) {
                Ok(Some(term)) => Some((term, previous_index)),
                Ok(None) => return Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(previous_index)),
                Err(StorageError::Compacted(_)) => {
                    return Err(HandleLeaderTimerError::MissingSnapshot(previous_index));
                }
                Err(e) => return Err(HandleLeaderTimerError::DiskRead(previous_index, e)),
            },
        };

        let new_entries = match wal.latest_entry() {
            Some((_, last_index)) if last_index >= next_index => {
                let batch_end = std::cmp::min(last_index, next_index.plus(max_entries as u64 - 1));
                wal.read_range(next_index, batch_end)
                    .map_err(|e| HandleLeaderTimerError::DiskRead(next_index, e))?
            }
            _ => Vec::new(),
        };

        let seq_no = peer_state.next_seq_no();
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id,
            term: current_term,
            seq_no,
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        };

        let proto_request = build_append_entries_request(
            current_term,
            my_id,
            opt_previous_log_entry_metadata,
            wal.commit_index(),
            new_entries,
        );

        Ok((proto_request, descriptor))
    }

    // This is the infallible parts of creating the request object.
    fn build_append_entries_request(
        current_term: Term,
        my_id: ReplicaId,
        previous_log_entry_metadata: Option<(Term, Index)>,
        commit_index: Option<Index>,
        new_entries: Vec<WriteAheadLogEntry>,
    ) -> ProtoAppendEntriesReq {
        let commit_index_u64 = match commit_index {
            None => 0,
            Some(ci) => ci.as_u64(),
        };

        let (previous_log_entry_term_u64, previous_log_entry_index_u64) = match previous_log_entry_metadata {
            None => (0, 0),
            Some((term, idx)) => (term.as_u64(), idx.as_u64()),
        };

        let new_entries = new_entries
            .into_iter()
            .map(|entry| ProtoLogEntry {
                term: entry.term.as_u64(),
                kind: entry.kind.as_u8() as u32,
                data: entry.data,
            })
            .collect();

        ProtoAppendEntriesReq {
            client_node_id: my_id.into_inner(),
            term: current_term.as_u64(),
            commit_index: commit_index_u64,
            previous_log_entry_term: previous_log_entry_term_u64,
            previous_log_entry_index: previous_log_entry_index_u64,
            new_entries,
        }
    }

    pub(super) fn new_install_snapshot_request(
        current_term: Term,
        my_id: ReplicaId,
        snapshot: Snapshot,
    ) -> ProtoInstallSnapshotReq {
        ProtoInstallSnapshotReq {
            client_node_id: my_id.into_inner(),
            term: current_term.as_u64(),
            last_included_index: snapshot.metadata.last_included_index.as_u64(),
            last_included_term: snapshot.metadata.last_included_term.as_u64(),
            membership: snapshot.metadata.membership.iter().map(to_proto_member).collect(),
            data: snapshot.data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::membership::to_proto_member;
    use crate::replica::{ReplicaMetadata, SnapshotMetadata};
    use bytes::Bytes;

    fn opt_index(v: u64) -> Option<Index> {
        Index::from_u64(v)
    }

    #[test]
    fn test_commit_checker_logic() {
        // `matches` includes the leader itself.
        fn run(expected: u64, matches: Vec<u64>) {
            let quorum_size = crate::replica::peers::quorum_size(matches.len());
            let matches = matches.into_iter().map(opt_index).collect();

            assert_eq!(opt_index(expected), get_cluster_commit_index(matches, quorum_size));
        }

        // 1-cluster
        run(0, vec![0]);
        run(4, vec![4]);

        // 3-cluster
        run(0, vec![9, 0, 0]);
        run(9, vec![9, 0, 9]);
        run(8, vec![9, 8, 9]);

        // 4-cluster
        run(0, vec![9, 0, 0, 0]);
        run(0, vec![9, 0, 0, 9]);
        run(8, vec![9, 0, 8, 9]);
        run(8, vec![9, 7, 8, 9]);

        // 5-cluster
        run(0, vec![9, 0, 0, 0, 0]);
        run(0, vec![9, 0, 0, 0, 9]);
        run(8, vec![9, 0, 0, 8, 9]);
        run(8, vec![9, 0, 7, 8, 9]);
        run(8, vec![9, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9, 9]);
    }

    #[test]
    fn no_members_means_no_commit() {
        assert_eq!(get_cluster_commit_index(vec![], 1), None);
    }

    #[test]
    fn install_snapshot_request_carries_membership() {
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: Index::new(7),
                last_included_term: Term::new(2),
                membership: vec![ReplicaMetadata::new(ReplicaId::new("node-1"), "127.0.0.1:7001".into())],
            },
            data: Bytes::from_static(b"{}"),
        };

        let request = leader_timer_handler::new_install_snapshot_request(Term::new(3), ReplicaId::new("node-1"), snapshot);
        assert_eq!(request.term, 3);
        assert_eq!(request.last_included_index, 7);
        assert_eq!(request.last_included_term, 2);
        assert_eq!(request.membership.len(), 1);
        assert_eq!(
            request.membership[0],
            to_proto_member(&ReplicaMetadata::new(ReplicaId::new("node-1"), "127.0.0.1:7001".into()))
        );
    }
}
