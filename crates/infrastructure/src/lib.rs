pub mod database;
pub mod lock;
pub mod memory_store;
pub mod ssh;

pub use database::SqliteStore;
pub use lock::{MemoryLock, RedisLock};
pub use memory_store::InMemoryStore;
pub use ssh::{SshChannel, SshSession};
