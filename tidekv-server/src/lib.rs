pub mod config;
pub mod core;
pub mod oplog;
pub mod persistence;
pub mod protocol;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::{KVConfig, KVStore, StoreEngine, TideError};
pub use oplog::{OplogConfig, OplogEntry, OplogStore};
pub use protocol::{Request, Response};
pub use replication::{NodeRole, ReplicaState, ReplicationConfig, ReplicationSupervisor};
pub use server::{AppState, Node, create_router};
