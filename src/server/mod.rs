mod local;
mod server;
mod shutdown;

pub use local::LocalNetwork;
pub(crate) use local::LocalPeerConnector;
pub(crate) use server::RpcServer;
pub(crate) use shutdown::shutdown_signal;
pub(crate) use shutdown::RpcServerShutdownHandle;
pub(crate) use shutdown::RpcServerShutdownSignal;
