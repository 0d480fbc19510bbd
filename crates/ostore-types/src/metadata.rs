use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::name::{BucketName, ObjectName};
use crate::revision::RevisionId;

/// User-supplied headers attached to an object. Sorted for stable encoding.
pub type ObjectHeaders = BTreeMap<String, String>;

/// Descriptor of one committed (or about-to-be-committed) object revision.
///
/// Invariants for a committed record:
/// - `digest` is the hash of the concatenation of all chunk payloads in order
/// - `size` is the sum of the chunk lengths
/// - `chunk_count` is `ceil(size / chunk_size)` (0 for an empty object)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub bucket: BucketName,
    pub name: ObjectName,
    /// Total payload size in bytes.
    pub size: u64,
    pub digest: Digest,
    pub chunk_count: u32,
    /// Maximum chunk size used when the object was written.
    pub chunk_size: u32,
    /// Monotonic per-object revision number; 0 until the server commits it.
    pub revision: u64,
    /// Upload attempt that owns the chunks of this revision.
    pub revision_id: RevisionId,
    /// When revision 1 of this object was committed.
    pub created_at: DateTime<Utc>,
    /// When this revision was committed.
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: ObjectHeaders,
}

impl ObjectMetadata {
    /// Expected payload length of the chunk at `index`, or `None` if the
    /// index is past the last chunk or the descriptor cannot hold it.
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        let chunk_size = u64::from(self.chunk_size);
        let start = u64::from(index).checked_mul(chunk_size)?;
        let remaining = self.size.checked_sub(start)?;
        Some(remaining.min(chunk_size))
    }

    /// Check the size/count/chunk-size relation.
    pub fn is_consistent(&self) -> bool {
        if self.chunk_size == 0 {
            return self.size == 0 && self.chunk_count == 0;
        }
        let expected = self.size.div_ceil(u64::from(self.chunk_size));
        expected == u64::from(self.chunk_count)
    }
}
