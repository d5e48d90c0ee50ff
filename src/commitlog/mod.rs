mod error;
mod in_memory;
mod log;
mod storage;

pub use error::StorageError;
pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
pub use storage::FileLog;
