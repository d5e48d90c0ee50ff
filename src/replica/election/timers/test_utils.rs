use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stands in for the replica actor's queue so timer tests can see what the tasks emit.
pub(super) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl TestUtilActor {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    async fn recv(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Actor queue closed")
    }

    pub(super) async fn assert_leader_heartbeat_event(&mut self, expected: LeaderTimerTick) {
        match self.recv().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Unexpected event: {}", other.name()),
        }
    }

    pub(super) async fn assert_follower_timeout_event(&mut self) {
        match self.recv().await {
            Event::FollowerTimeout => {}
            other => panic!("Unexpected event: {}", other.name()),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        if let Ok(received) = tokio::time::timeout(self.quiet_period, self.rx.recv()).await {
            match received {
                Some(event) => panic!("Expected no event, got {}", event.name()),
                None => panic!("Actor queue closed"),
            }
        }
    }
}
