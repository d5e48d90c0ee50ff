use crate::actor;
use crate::replica::election::timers::shared::{self, SharedOption};
use crate::replica::election::timers::time::{Clock, RealClock};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// Owned by the replica while it is a follower (or candidate). Every `reset_timeout()` pushes the
/// election deadline to a fresh random point. Dropping the handle ends the task.
pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    deadline: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _stopper: shared::Stopper,
}

struct FollowerTimerTask<C: Clock> {
    deadline: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: shared::StopCheck,
    // Minimum gap between two consecutive timeouts sent to the actor, so a candidate whose
    // election stalls doesn't spin.
    retry_backoff: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = FollowerTimerTask::new(min_timeout..=max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> FollowerTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        let jitter = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.deadline.replace(self.clock.now() + jitter);
    }
}

impl<C: Clock + Send + Sync + 'static> FollowerTimerTask<C> {
    fn new(
        timeout_range: RangeInclusive<Duration>,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, FollowerTimerHandle<C>) {
        let deadline = SharedOption::new();
        let (stopper, stop_check) = shared::stop_signal();

        let task = FollowerTimerTask {
            deadline: deadline.clone(),
            actor_client,
            clock: clock.clone(),
            stop_check,
            retry_backoff: *timeout_range.start(),
        };
        let handle = FollowerTimerHandle {
            deadline,
            timeout_range,
            clock,
            _stopper: stopper,
        };

        // Seed a deadline before the task first looks, otherwise it would time out on the spot.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        while !self.stop_check.should_stop() {
            if let Some(deadline) = self.deadline.take() {
                self.clock.sleep_until(deadline).await;
                continue;
            }

            // Slept through a deadline with no reset: nobody heard from a leader. The actor may
            // have an AppendEntries queued ahead of this, in which case it ignores the timeout.
            if self.actor_client.follower_timeout().await.is_err() {
                return;
            }
            self.clock.sleep(self.retry_backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::test_utils::TestUtilActor;
    use crate::replica::election::timers::time;

    fn fixed(timeout: Duration) -> RangeInclusive<Duration> {
        timeout..=timeout
    }

    #[tokio::test]
    async fn timeout_fires_only_after_resets_stop() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) = FollowerTimerTask::new(fixed(timeout), strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());
        actor.assert_no_event().await;

        // Heartbeats keep arriving every half period.
        for _ in 0..6 {
            clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.assert_no_event().await;
        assert_eq!(clock_controller.elapsed_time(), timeout * 3);

        // Last reset was at T=3.0, so the deadline is T=4.0 exactly.
        let one_ns = Duration::from_nanos(1);
        clock_controller.advance(timeout - one_ns);
        actor.assert_no_event().await;

        clock_controller.advance(one_ns);
        actor.assert_follower_timeout_event().await;
    }

    #[tokio::test]
    async fn repeats_timeout_after_backoff_while_handle_alive() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        let (timer_task, _timer_handle) = FollowerTimerTask::new(fixed(timeout), strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());

        clock_controller.advance(timeout);
        actor.assert_follower_timeout_event().await;

        // A stalled candidate keeps getting nudged, one backoff period apart.
        clock_controller.advance(timeout / 2);
        actor.assert_no_event().await;
        clock_controller.advance(timeout / 2);
        actor.assert_follower_timeout_event().await;
    }

    #[tokio::test]
    async fn dropping_handle_stops_task() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) = FollowerTimerTask::new(fixed(timeout), strong_actor_client.weak(), mock_clock);
        let join_handle = tokio::task::spawn(timer_task.run());
        drop(timer_handle);

        clock_controller.advance(timeout * 2);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn reset_after_timeout_rearms_timer() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) = FollowerTimerTask::new(fixed(timeout), strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());

        // An AppendEntries can land in the actor queue right behind a timeout.
        clock_controller.advance(timeout);
        actor.assert_follower_timeout_event().await;
        timer_handle.reset_timeout();

        for _ in 0..5 {
            clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.assert_no_event().await;
    }
}
