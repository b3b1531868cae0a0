pub mod memory_lock;
pub mod redis_lock;

pub use memory_lock::MemoryLock;
pub use redis_lock::RedisLock;
