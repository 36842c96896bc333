//! Operation log
//!
//! Every state mutation is recorded as a sequence-numbered `OplogEntry`
//! before it becomes visible. The log is the source for:
//! - `GETOP` range reads
//! - crash recovery (replayed on top of the latest checkpoint)
//! - replication (replicas tail it and mirror it under the same numbering)
pub mod segment;
pub mod store;
pub mod translator;
pub mod types;

pub use store::OplogStore;
pub use translator::{CommandTranslator, Mutation};
pub use types::{
    FsyncMode, OplogCommand, OplogConfig, OplogDraft, OplogEntry, OplogError, OplogInfo,
    RangeRead,
};
