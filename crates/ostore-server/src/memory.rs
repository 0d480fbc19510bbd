use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use ostore_types::{BucketName, ChunkKey, ObjectName, RevisionId};

use crate::backend::{ChunkBackend, ObjectRecord};
use crate::error::BackendResult;

#[derive(Default)]
struct BucketData {
    chunks: HashMap<ChunkKey, Vec<u8>>,
    records: HashMap<ObjectName, ObjectRecord>,
}

/// In-memory backend.
///
/// Intended for tests and embedding. Buckets are held behind a single
/// `RwLock`; chunks and records are cloned on read/write.
pub struct InMemoryBackend {
    buckets: RwLock<BTreeMap<BucketName, BucketData>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of chunks stored across all buckets.
    pub fn chunk_count(&self) -> usize {
        self.buckets
            .read()
            .expect("lock poisoned")
            .values()
            .map(|b| b.chunks.len())
            .sum()
    }

    /// Total chunk bytes across all buckets.
    pub fn chunk_bytes(&self) -> u64 {
        self.buckets
            .read()
            .expect("lock poisoned")
            .values()
            .flat_map(|b| b.chunks.values())
            .map(|c| c.len() as u64)
            .sum()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkBackend for InMemoryBackend {
    fn create_bucket(&self, bucket: &BucketName) -> BackendResult<bool> {
        let mut map = self.buckets.write().expect("lock poisoned");
        if map.contains_key(bucket) {
            return Ok(false);
        }
        map.insert(bucket.clone(), BucketData::default());
        Ok(true)
    }

    fn bucket_exists(&self, bucket: &BucketName) -> BackendResult<bool> {
        Ok(self.buckets.read().expect("lock poisoned").contains_key(bucket))
    }

    fn list_buckets(&self) -> BackendResult<Vec<BucketName>> {
        Ok(self
            .buckets
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect())
    }

    fn write_chunk(&self, bucket: &BucketName, key: &ChunkKey, data: &[u8]) -> BackendResult<()> {
        let mut map = self.buckets.write().expect("lock poisoned");
        map.entry(bucket.clone())
            .or_default()
            .chunks
            .insert(*key, data.to_vec());
        Ok(())
    }

    fn read_chunk(&self, bucket: &BucketName, key: &ChunkKey) -> BackendResult<Option<Vec<u8>>> {
        let map = self.buckets.read().expect("lock poisoned");
        Ok(map.get(bucket).and_then(|b| b.chunks.get(key)).cloned())
    }

    fn delete_revision(&self, bucket: &BucketName, revision: &RevisionId) -> BackendResult<usize> {
        let mut map = self.buckets.write().expect("lock poisoned");
        let Some(data) = map.get_mut(bucket) else {
            return Ok(0);
        };
        let before = data.chunks.len();
        data.chunks.retain(|key, _| key.revision != *revision);
        Ok(before - data.chunks.len())
    }

    fn chunk_revisions(&self, bucket: &BucketName) -> BackendResult<Vec<RevisionId>> {
        let map = self.buckets.read().expect("lock poisoned");
        let mut revs: Vec<RevisionId> = map
            .get(bucket)
            .map(|b| b.chunks.keys().map(|k| k.revision).collect())
            .unwrap_or_default();
        revs.sort();
        revs.dedup();
        Ok(revs)
    }

    fn read_record(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
    ) -> BackendResult<Option<ObjectRecord>> {
        let map = self.buckets.read().expect("lock poisoned");
        Ok(map.get(bucket).and_then(|b| b.records.get(name)).cloned())
    }

    fn write_record(&self, record: &ObjectRecord) -> BackendResult<()> {
        let mut map = self.buckets.write().expect("lock poisoned");
        map.entry(record.bucket().clone())
            .or_default()
            .records
            .insert(record.name().clone(), record.clone());
        Ok(())
    }

    fn delete_record(&self, bucket: &BucketName, name: &ObjectName) -> BackendResult<bool> {
        let mut map = self.buckets.write().expect("lock poisoned");
        Ok(map
            .get_mut(bucket)
            .map(|b| b.records.remove(name).is_some())
            .unwrap_or(false))
    }

    fn list_records(&self, bucket: &BucketName) -> BackendResult<Vec<ObjectRecord>> {
        let map = self.buckets.read().expect("lock poisoned");
        Ok(map
            .get(bucket)
            .map(|b| b.records.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{bucket, exercise_backend};

    #[test]
    fn satisfies_backend_contract() {
        exercise_backend(&InMemoryBackend::new());
    }

    #[test]
    fn counts_chunks_and_bytes() {
        let backend = InMemoryBackend::new();
        let rev = RevisionId::new();
        backend.write_chunk(&bucket(), &ChunkKey::new(rev, 0), b"abcd").unwrap();
        backend.write_chunk(&bucket(), &ChunkKey::new(rev, 1), b"ef").unwrap();
        assert_eq!(backend.chunk_count(), 2);
        assert_eq!(backend.chunk_bytes(), 6);
        // Writing a chunk creates its bucket.
        assert!(backend.bucket_exists(&bucket()).unwrap());
    }
}
