//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `source` - Location source trait, fix channel and liveness stamp
//! - `replay` - Location source replaying a JSONL fix file
//! - `store` - Key-value storage backends (file, memory)
//! - `persistence` - Trace snapshots, forced writes and restore
//! - `polyline` - Encoded polyline format
//! - `egress` - Finished trips to file (JSONL format)

pub mod egress;
pub mod persistence;
pub mod polyline;
pub mod replay;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use egress::TripEgress;
pub use persistence::{PersistenceWarning, RestoreSource, TracePersistence};
pub use replay::ReplaySource;
pub use source::{call_with_timeout, fix_channel, FixSender, LocationSource, SourceError, SourceLiveness};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
