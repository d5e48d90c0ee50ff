use crate::replica::election::timers::shared::SharedOption;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::{actor, replica};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// LeaderTimerHandle drives heartbeats to one peer while we lead a given term. Dropping the
/// handle stops the task.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: SharedOption<Instant>,
    clock: C,
}

struct LeaderTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    event: replica::LeaderTimerTick,
    clock: C,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
    ) -> Self {
        let (task, handle) = LeaderTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> LeaderTimerHandle<C> {
    /// Pushes the next heartbeat out by a full period. Called whenever we've just sent the peer
    /// an AppendEntries or InstallSnapshot for another reason.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        self.next_heartbeat_time
            .replace(self.clock.now() + self.heartbeat_duration);
    }
}

impl<C: Clock + Send + Sync + 'static> LeaderTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
        clock: C,
    ) -> (Self, LeaderTimerHandle<C>) {
        let next_heartbeat_time = SharedOption::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: next_heartbeat_time.clone(),
            clock: clock.clone(),
        });

        let task = LeaderTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time,
            actor_client,
            event: replica::LeaderTimerTick { peer_id, term },
            clock,
        };

        (task, LeaderTimerHandle { shared })
    }

    async fn run(mut self) {
        // The slot starts empty, so the first pass fires immediately. A newly elected leader (or a
        // newly added member) gets contacted right away instead of one heartbeat later.
        loop {
            if let Some(wake_time) = self.next_heartbeat_time.take() {
                // Something reset the deadline since we last looked. Sleep until it.
                self.clock.sleep_until(wake_time).await;
                continue;
            }

            // Deadline passed with no reset. If the handle is gone we're no longer leader for
            // this term.
            let shared = match self.weak_shared.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            let _ = self.actor_client.leader_timer(self.event.clone()).await;
            shared.reset_heartbeat_timer();
        }
    }
}
