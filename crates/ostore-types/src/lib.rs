//! Foundation types for ostore.
//!
//! This crate provides the identity, naming and descriptor types shared by the
//! client, the wire protocol and the server. Every other ostore crate depends
//! on `ostore-types`.
//!
//! # Key Types
//!
//! - [`BucketName`] / [`ObjectName`]: validated namespace and object keys
//! - [`RevisionId`]: UUID v7 identifier of a single upload attempt
//! - [`ChunkKey`]: address of one chunk within a revision
//! - [`Digest`]: algorithm-tagged content digest
//! - [`ObjectMetadata`]: descriptor record stored alongside the chunks
//! - [`ByteSize`]: human-readable size (`10K`, `4MiB`, `1g`)

pub mod digest;
pub mod error;
pub mod metadata;
pub mod name;
pub mod revision;
pub mod size;

pub use digest::{Digest, DigestAlgorithm};
pub use error::TypeError;
pub use metadata::{ObjectHeaders, ObjectMetadata};
pub use name::{BucketName, ObjectName};
pub use revision::{ChunkKey, RevisionId};
pub use size::ByteSize;
