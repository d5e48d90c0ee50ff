use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs. Anything left as `None` gets a default that suits a LAN cluster.
#[derive(Clone, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// Number of applied entries between state machine snapshots.
    pub snapshot_threshold: Option<u64>,
    pub max_entries_per_append: Option<usize>,
    /// Number of read contexts that may be open at once.
    pub read_context_pool_size: Option<usize>,
    /// How long `submit()` waits for the command to be applied.
    pub command_timeout: Option<Duration>,
}

pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,
    pub read_context_pool_size: usize,
    pub command_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.snapshot_threshold == 0 {
            return Err("Snapshot threshold must be at least 1 entry");
        }
        if self.max_entries_per_append == 0 {
            return Err("AppendEntries batches must carry at least 1 entry");
        }
        if self.read_context_pool_size == 0 {
            return Err("Read context pool needs at least 1 slot");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(1000),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            read_context_pool_size: options.read_context_pool_size.unwrap_or(16),
            command_timeout: options.command_timeout.unwrap_or(Duration::from_secs(5)),
        };

        values.validate()?;
        Ok(values)
    }
}
