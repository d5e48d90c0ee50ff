mod actor;
mod api;
mod commitlog;
mod context;
mod replica;
mod server;
mod state_machine;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_raft_client;
pub use api::ClusterTopology;
pub use api::CommitResult;
pub use api::ConnectionStringFilter;
pub use api::ContextPoolStats;
pub use api::PendingCommand;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftElectionState;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftOptions;
pub use api::RaftStatus;
pub use api::RaftTransport;
pub use api::ReadError;
pub use api::ReadMode;
pub use api::SubmitError;
pub use api::TopologyManager;
pub use commitlog::StorageError;
pub use server::LocalNetwork;
pub use state_machine::ApplyError;
pub use state_machine::Command;
pub use state_machine::CommandOutput;
pub use state_machine::CommandValidationError;
pub use state_machine::ConnectionString;
pub use state_machine::ConnectionStringKind;
pub use state_machine::DatabaseRecord;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
