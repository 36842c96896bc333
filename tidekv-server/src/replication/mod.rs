/// Replication module - Master-Slave log shipping
///
/// Design inspired by Redis Replication:
/// - 1 Master node (accepts writes)
/// - N Slave nodes (read-only)
/// - Async replication (non-blocking)
/// - `SLAVEOF host:port` / `SLAVEOF NO ONE` role switches
///
/// Features:
/// - Full sync on first connect (snapshot + oplog position)
/// - Resume from the persisted cursor on reconnect, even across master restarts
/// - Entries keep the master's sequence numbers on every slave
/// - Heartbeats, acks and exponential reconnect backoff
pub mod config;
pub mod cursor;
pub mod master;
pub mod replica;
pub mod supervisor;
pub mod sync;
pub mod types;

pub use config::ReplicationConfig;
pub use cursor::{CursorStore, ReplicationCursor};
pub use master::MasterReplicator;
pub use replica::SlaveReplicator;
pub use supervisor::ReplicationSupervisor;
pub use types::{
    NodeRole, ReplicaInfo, ReplicaState, ReplicationCommand, ReplicationError, ReplicationResult,
    ReplicationStats,
};

#[cfg(test)]
mod tests;
