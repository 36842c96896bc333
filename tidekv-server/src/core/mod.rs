pub mod engine;
pub mod error;
pub mod kv_store;
pub mod types;

pub use engine::StoreEngine;
pub use error::TideError;
pub use kv_store::KVStore;
pub use types::{KVConfig, KVStats, KeyRecord, StoredValue};
