// src/storage/mod.rs

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemoryStore;
pub use redis::{create_pool, RedisStore};
pub use traits::CounterStore;
