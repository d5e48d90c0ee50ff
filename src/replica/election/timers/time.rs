use tokio::time::{Duration, Instant};

/// Clock lets the timer tasks run against tokio time in production and a hand-cranked clock in
/// tests.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use mock::mocked_clock;

#[cfg(test)]
mod mock {
    use super::*;
    use tokio::sync::watch;

    pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
        let start = Instant::now();
        let (tx, rx) = watch::channel(start);

        (MockClock { current_time: rx }, MockClockController { current_time: tx, start })
    }

    /// Time only moves when the paired controller says so.
    #[derive(Clone)]
    pub(crate) struct MockClock {
        current_time: watch::Receiver<Instant>,
    }

    #[async_trait::async_trait]
    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current_time.borrow()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            while *self.current_time.borrow() < deadline {
                if self.current_time.changed().await.is_err() {
                    // Controller is gone, time will never reach the deadline.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub(crate) struct MockClockController {
        current_time: watch::Sender<Instant>,
        start: Instant,
    }

    impl MockClockController {
        pub(crate) fn elapsed_time(&self) -> Duration {
            *self.current_time.borrow() - self.start
        }

        /// Sleepers only learn that `now` is at or past their deadline. Advancing in one big leap
        /// wakes them once, well after the deadline, so advance in steps smaller than what the
        /// test wants to observe.
        pub(crate) fn advance(&mut self, duration: Duration) {
            let new_now = *self.current_time.borrow() + duration;
            let _ = self.current_time.send(new_now);
        }
    }
}
