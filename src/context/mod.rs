mod pool;

pub(crate) use pool::AppliedState;
pub(crate) use pool::ContextPool;
pub(crate) use pool::PoolStats;
pub(crate) use pool::ReadContext;
pub(crate) use pool::WriteContext;
