use ostore_types::{BucketName, ChunkKey, ObjectMetadata, ObjectName, RevisionId};
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;

/// Everything the service keeps about one object name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Position of the last commit in the bucket's commit order.
    pub seq: u64,
    pub current: ObjectMetadata,
    /// Superseded revisions still readable, newest first.
    #[serde(default)]
    pub retained: Vec<ObjectMetadata>,
}

impl ObjectRecord {
    pub fn bucket(&self) -> &BucketName {
        &self.current.bucket
    }

    pub fn name(&self) -> &ObjectName {
        &self.current.name
    }

    /// Find a revision by number among the current and retained ones.
    pub fn revision(&self, revision: u64) -> Option<&ObjectMetadata> {
        std::iter::once(&self.current)
            .chain(&self.retained)
            .find(|m| m.revision == revision)
    }

    /// Revision ids whose chunks this record keeps alive.
    pub fn revision_ids(&self) -> impl Iterator<Item = RevisionId> + '_ {
        std::iter::once(&self.current)
            .chain(&self.retained)
            .map(|m| m.revision_id)
    }
}

/// Storage behind the object store service.
///
/// Implementations must satisfy:
/// - `write_chunk` is durable once it returns; rewriting a key replaces it.
/// - `write_record` replaces the record atomically: readers see the old
///   record or the new one, never a mix.
/// - Chunks are never interpreted, only stored under their key.
/// - All I/O errors are propagated, never silently ignored.
pub trait ChunkBackend: Send + Sync {
    /// Create a bucket. Returns `false` if it already existed.
    fn create_bucket(&self, bucket: &BucketName) -> BackendResult<bool>;

    fn bucket_exists(&self, bucket: &BucketName) -> BackendResult<bool>;

    /// All buckets, sorted by name.
    fn list_buckets(&self) -> BackendResult<Vec<BucketName>>;

    /// Store a chunk payload, creating the bucket if needed.
    fn write_chunk(&self, bucket: &BucketName, key: &ChunkKey, data: &[u8]) -> BackendResult<()>;

    /// Returns `Ok(None)` if the chunk does not exist.
    fn read_chunk(&self, bucket: &BucketName, key: &ChunkKey) -> BackendResult<Option<Vec<u8>>>;

    /// Delete every chunk of a revision. Returns the number removed.
    fn delete_revision(&self, bucket: &BucketName, revision: &RevisionId) -> BackendResult<usize>;

    /// Revisions that currently have chunks stored in the bucket.
    fn chunk_revisions(&self, bucket: &BucketName) -> BackendResult<Vec<RevisionId>>;

    fn read_record(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
    ) -> BackendResult<Option<ObjectRecord>>;

    /// Atomically replace the record of `record.name()`.
    fn write_record(&self, record: &ObjectRecord) -> BackendResult<()>;

    /// Delete a record. Returns `true` if it existed.
    fn delete_record(&self, bucket: &BucketName, name: &ObjectName) -> BackendResult<bool>;

    /// All records in a bucket, in no particular order.
    fn list_records(&self, bucket: &BucketName) -> BackendResult<Vec<ObjectRecord>>;
}
