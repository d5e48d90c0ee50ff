//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod errors;
mod event_bus;
mod options;
mod topology;
mod types;
mod wiring;

pub use client::ConnectionStringFilter;
pub use client::PendingCommand;
pub use client::RaftClient;
pub use errors::ReadError;
pub use errors::SubmitError;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use topology::ClusterTopology;
pub use topology::TopologyManager;
pub use types::CommitResult;
pub use types::ContextPoolStats;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use types::RaftStatus;
pub use types::ReadMode;
pub use wiring::try_create_raft_client;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
pub use wiring::RaftTransport;
