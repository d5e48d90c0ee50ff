mod applier;
mod command;
mod pending;
mod state;

pub use command::Command;
pub use command::CommandValidationError;
pub use command::ConnectionString;
pub use command::ConnectionStringKind;
pub use state::ApplyError;
pub use state::CommandOutput;
pub use state::DatabaseRecord;

pub(crate) use applier::StateMachineApplier;
pub(crate) use pending::CommandOutcome;
pub(crate) use pending::CommandWaiter;
pub(crate) use pending::PendingCommands;
pub(crate) use state::ClusterState;
