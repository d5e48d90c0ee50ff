use crate::commitlog;
use crate::replica;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

/// Raised when the replica actor is gone (shut down or crashed).
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("Replica actor has exited")]
pub(crate) struct ActorExited;

// v1 Design choice: Disk interaction is synchronous inside the actor. Outbound RPCs are spawned
//                   and report back as events.
pub(crate) enum Event {
    // Leader: Write to disk, register the waiter, nudge peers.
    // Candidate: Reject request.
    // Follower: Redirect.
    EnqueueForReplication(
        replica::EnqueueForReplicationInput,
        Callback<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError>,
    ),

    // All states: Grant vote if applicable (includes write to disk). Step down on newer term.
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Candidate: Count vote. Transition to leader on quorum.
    // Leader/Follower: discard (after term check)
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader/Candidate: Step down if applicable, then same as follower.
    // Follower: Reconcile log, write to disk, respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Leader: Update peer progress. Advance commit index.
    // Candidate/Follower: discard
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Follower: Replace log prefix and state with the leader's snapshot.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),

    // Leader: Update peer progress.
    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Leader: Send AppendEntries (or InstallSnapshot) to the peer.
    // Candidate/Follower: discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: discard
    // Candidate/Follower: Start a new election.
    FollowerTimeout,

    // All states: Persist the applier's snapshot, then compact the log.
    SnapshotCreated(replica::Snapshot),

    Status(oneshot::Sender<replica::ReplicaStatus>),

    Shutdown,
}

impl Event {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Event::EnqueueForReplication(_, _) => "EnqueueForReplication",
            Event::RequestVote(_, _) => "RequestVote",
            Event::RequestVoteReplyFromPeer(_) => "RequestVoteReplyFromPeer",
            Event::AppendEntries(_, _) => "AppendEntries",
            Event::AppendEntriesReplyFromPeer(_) => "AppendEntriesReplyFromPeer",
            Event::InstallSnapshot(_, _) => "InstallSnapshot",
            Event::InstallSnapshotReplyFromPeer(_) => "InstallSnapshotReplyFromPeer",
            Event::LeaderTimer(_) => "LeaderTimer",
            Event::FollowerTimeout => "FollowerTimeout",
            Event::SnapshotCreated(_) => "SnapshotCreated",
            Event::Status(_) => "Status",
            Event::Shutdown => "Shutdown",
        }
    }
}

pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

/// ActorClient keeps the replica actor alive. Held by the public client handle.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// WeakActorClient does not keep the actor alive. Held by timers, spawned RPC tasks, the applier,
/// and the RPC server, so that dropping the client handle is enough to stop the replica.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: replica::EnqueueForReplicationInput,
    ) -> Result<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| replica::EnqueueForReplicationError::ActorExited)?;

        rx.await
            .unwrap_or(Err(replica::EnqueueForReplicationError::ActorExited))
    }

    pub(crate) async fn status(&self) -> Result<replica::ReplicaStatus, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Status(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.send(Event::Shutdown).await;
        // Wait for the actor to drop its receiver so callers know the replica is gone.
        self.sender.closed().await;
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| replica::RequestVoteError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| replica::AppendEntriesError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::InstallSnapshot(input, Callback(tx)))
            .await
            .map_err(|_| replica::InstallSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::InstallSnapshotError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        reply: replica::InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }

    pub(crate) async fn leader_timer(&self, tick: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn follower_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::FollowerTimeout).await
    }

    pub(crate) async fn snapshot_created(&self, snapshot: replica::Snapshot) -> Result<(), ActorExited> {
        self.send(Event::SnapshotCreated(snapshot)).await
    }

    /// Stops the replica from the inside, e.g. after its applied state turned out unusable.
    pub(crate) async fn shutdown(&self) -> Result<(), ActorExited> {
        self.send(Event::Shutdown).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| ActorExited),
            None => Err(ActorExited),
        }
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L>,
}

impl<L> ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Event::Shutdown = event {
                slog::info!(self.logger, "Shutdown requested.");
                break;
            }
            self.handle_event(event);
        }

        slog::info!(self.logger, "Replica event loop exiting.");
        // Dropping the receiver (and the replica) here closes the channel, stops timers, and
        // stops the RPC server.
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come back as an event to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                let result = self.replica.handle_enqueue_for_replication(input);
                callback.send(result);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::FollowerTimeout => {
                self.replica.handle_follower_timeout();
            }
            Event::SnapshotCreated(snapshot) => {
                self.replica.handle_snapshot_created(snapshot);
            }
            Event::Status(callback) => {
                let _ = callback.send(self.replica.status());
            }
            Event::Shutdown => {}
        }
    }
}
