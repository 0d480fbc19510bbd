use bytes::Bytes;
use ostore_types::{BucketName, ObjectMetadata, ObjectName, RevisionId};
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkHeader;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Error classes a service reply can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed request: bad name, out-of-order chunk, inconsistent metadata.
    BadRequest,
    /// No such bucket, object or revision.
    NotFound,
    /// The object exists and overwrite is not allowed.
    AlreadyExists,
    /// The read lease expired; the revision may already be reclaimed.
    LeaseExpired,
    /// Backend failure.
    Internal,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::LeaseExpired => 410,
            Self::Internal => 500,
        }
    }
}

/// All message types in the ostore protocol.
///
/// Chunk-carrying variants (`PutChunk`, `ChunkData`) are framed as a raw
/// [`ChunkHeader`] followed by the payload; everything else is bincode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StoreMessage {
    CreateBucket { bucket: BucketName },
    BucketCreated { bucket: BucketName, created: bool },
    BucketStatus { bucket: BucketName },
    BucketInfo { bucket: BucketName, objects: u64, total_size: u64 },
    ListBuckets,
    Buckets { buckets: Vec<BucketName> },

    /// Write one chunk. The bucket is taken from the chunk subject.
    PutChunk { header: ChunkHeader, payload: Bytes },
    ChunkAck { revision_id: RevisionId, index: u32 },
    /// Install `meta` as the new current revision of its object.
    CommitObject { meta: ObjectMetadata, allow_overwrite: bool },
    Committed { meta: ObjectMetadata },
    /// Discard the chunks of an unfinished upload.
    AbortUpload { bucket: BucketName, revision_id: RevisionId },

    /// Resolve and pin a revision for reading (`None` = current).
    OpenObject { bucket: BucketName, name: ObjectName, revision: Option<u64> },
    ObjectOpened { meta: ObjectMetadata, lease: u64 },
    GetChunk { bucket: BucketName, revision_id: RevisionId, index: u32, lease: u64 },
    ChunkData { header: ChunkHeader, payload: Bytes },
    ReleaseLease { bucket: BucketName, lease: u64 },

    GetInfo { bucket: BucketName, name: ObjectName },
    Info { meta: ObjectMetadata },
    ListRevisions { bucket: BucketName, name: ObjectName },
    Revisions { current: ObjectMetadata, retained: Vec<ObjectMetadata> },
    /// Current revisions in commit order, strictly after cursor `after`.
    ListObjects { bucket: BucketName, after: Option<u64>, limit: u32 },
    /// `last` is the commit seq of the final entry, the cursor to resume
    /// from; `more` is set when entries follow it.
    ObjectPage { entries: Vec<ObjectMetadata>, last: Option<u64>, more: bool },
    DeleteObject { bucket: BucketName, name: ObjectName },
    Deleted { meta: ObjectMetadata },

    /// Generic acknowledgment for aborts and lease releases.
    Ack,
    Error { code: ErrorCode, message: String },
}

impl StoreMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::CreateBucket { .. } => 1,
            Self::BucketCreated { .. } => 2,
            Self::BucketStatus { .. } => 3,
            Self::BucketInfo { .. } => 4,
            Self::ListBuckets => 5,
            Self::Buckets { .. } => 6,
            Self::PutChunk { .. } => 10,
            Self::ChunkAck { .. } => 11,
            Self::CommitObject { .. } => 12,
            Self::Committed { .. } => 13,
            Self::AbortUpload { .. } => 14,
            Self::OpenObject { .. } => 20,
            Self::ObjectOpened { .. } => 21,
            Self::GetChunk { .. } => 22,
            Self::ChunkData { .. } => 23,
            Self::ReleaseLease { .. } => 24,
            Self::GetInfo { .. } => 30,
            Self::Info { .. } => 31,
            Self::ListRevisions { .. } => 32,
            Self::Revisions { .. } => 33,
            Self::ListObjects { .. } => 34,
            Self::ObjectPage { .. } => 35,
            Self::DeleteObject { .. } => 36,
            Self::Deleted { .. } => 37,
            Self::Ack => 254,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CreateBucket { .. } => "CreateBucket",
            Self::BucketCreated { .. } => "BucketCreated",
            Self::BucketStatus { .. } => "BucketStatus",
            Self::BucketInfo { .. } => "BucketInfo",
            Self::ListBuckets => "ListBuckets",
            Self::Buckets { .. } => "Buckets",
            Self::PutChunk { .. } => "PutChunk",
            Self::ChunkAck { .. } => "ChunkAck",
            Self::CommitObject { .. } => "CommitObject",
            Self::Committed { .. } => "Committed",
            Self::AbortUpload { .. } => "AbortUpload",
            Self::OpenObject { .. } => "OpenObject",
            Self::ObjectOpened { .. } => "ObjectOpened",
            Self::GetChunk { .. } => "GetChunk",
            Self::ChunkData { .. } => "ChunkData",
            Self::ReleaseLease { .. } => "ReleaseLease",
            Self::GetInfo { .. } => "GetInfo",
            Self::Info { .. } => "Info",
            Self::ListRevisions { .. } => "ListRevisions",
            Self::Revisions { .. } => "Revisions",
            Self::ListObjects { .. } => "ListObjects",
            Self::ObjectPage { .. } => "ObjectPage",
            Self::DeleteObject { .. } => "DeleteObject",
            Self::Deleted { .. } => "Deleted",
            Self::Ack => "Ack",
            Self::Error { .. } => "Error",
        }
    }

    /// Shorthand for an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
