//! Object store service for ostore.
//!
//! [`StoreService`] answers protocol requests arriving through the
//! transport. It keeps chunks and object records in a [`ChunkBackend`]
//! (in memory or on the filesystem), installs revisions one at a time, and
//! tracks which revisions are still needed so that superseded, deleted and
//! abandoned chunks are reclaimed by [`ChunkReclaimer`] once nothing holds
//! them.

pub mod backend;
pub mod config;
pub mod error;
pub mod fs;
pub mod memory;
pub mod reclaim;
pub mod service;

pub use backend::{ChunkBackend, ObjectRecord};
pub use config::{RetentionPolicy, ServerConfig};
pub use error::{BackendError, BackendResult, ServerError, ServerResult};
pub use fs::FsBackend;
pub use memory::InMemoryBackend;
pub use reclaim::{ChunkReclaimer, ReclaimReport};
pub use service::{MaintenanceReport, StoreService};
