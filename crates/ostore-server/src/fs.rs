use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use ostore_crypto::digest_of;
use ostore_types::{BucketName, ChunkKey, DigestAlgorithm, ObjectName, RevisionId};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::backend::{ChunkBackend, ObjectRecord};
use crate::error::{BackendError, BackendResult};

const CHUNKS_DIR: &str = "chunks";
const META_DIR: &str = "meta";
const RECORD_EXT: &str = "json";

/// Filesystem backend.
///
/// ```text
/// <root>/<bucket>/chunks/<revision id>/<index:08>
/// <root>/<bucket>/meta/<sha-256 of object name>.json
/// ```
///
/// Record files are named by the hex digest of the object name so every
/// valid name fits a 255-byte file name; the name itself is read back from
/// the record.
///
/// Every file is written to a temporary sibling, synced, then renamed into
/// place, so a crash never leaves a torn chunk or record behind.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> BackendResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened filesystem backend");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &BucketName) -> PathBuf {
        self.root.join(bucket.as_str())
    }

    fn revision_dir(&self, bucket: &BucketName, revision: &RevisionId) -> PathBuf {
        self.bucket_dir(bucket)
            .join(CHUNKS_DIR)
            .join(revision.to_simple())
    }

    fn chunk_path(&self, bucket: &BucketName, key: &ChunkKey) -> PathBuf {
        self.revision_dir(bucket, &key.revision)
            .join(format!("{:08}", key.index))
    }

    fn record_path(&self, bucket: &BucketName, name: &ObjectName) -> PathBuf {
        self.bucket_dir(bucket)
            .join(META_DIR)
            .join(format!("{}.{RECORD_EXT}", record_file_stem(name)))
    }

    fn ensure_bucket(&self, bucket: &BucketName) -> BackendResult<()> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(dir.join(CHUNKS_DIR))?;
        fs::create_dir_all(dir.join(META_DIR))?;
        Ok(())
    }

    fn read_record_file(path: &Path) -> BackendResult<ObjectRecord> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| BackendError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

fn record_file_stem(name: &ObjectName) -> String {
    digest_of(DigestAlgorithm::Sha256, name.as_str().as_bytes()).to_hex()
}

/// Write `data` to `path` through a synced temporary file in the same directory.
fn write_atomic(path: &Path, data: &[u8]) -> BackendResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BackendError::Io(std::io::Error::new(ErrorKind::InvalidInput, "no parent")))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BackendError::Io(e.error))?;
    Ok(())
}

fn read_optional(path: &Path) -> BackendResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Entries of a directory; a missing directory is empty.
fn dir_entries(dir: &Path) -> BackendResult<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect::<Result<Vec<_>, _>>()?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

impl ChunkBackend for FsBackend {
    fn create_bucket(&self, bucket: &BucketName) -> BackendResult<bool> {
        let existed = self.bucket_dir(bucket).is_dir();
        self.ensure_bucket(bucket)?;
        Ok(!existed)
    }

    fn bucket_exists(&self, bucket: &BucketName) -> BackendResult<bool> {
        Ok(self.bucket_dir(bucket).is_dir())
    }

    fn list_buckets(&self) -> BackendResult<Vec<BucketName>> {
        let mut buckets = Vec::new();
        for entry in dir_entries(&self.root)? {
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match BucketName::new(name) {
                Ok(b) => buckets.push(b),
                Err(e) => warn!(error = %e, "skipping foreign directory in store root"),
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    fn write_chunk(&self, bucket: &BucketName, key: &ChunkKey, data: &[u8]) -> BackendResult<()> {
        self.ensure_bucket(bucket)?;
        write_atomic(&self.chunk_path(bucket, key), data)
    }

    fn read_chunk(&self, bucket: &BucketName, key: &ChunkKey) -> BackendResult<Option<Vec<u8>>> {
        read_optional(&self.chunk_path(bucket, key))
    }

    fn delete_revision(&self, bucket: &BucketName, revision: &RevisionId) -> BackendResult<usize> {
        let dir = self.revision_dir(bucket, revision);
        let count = dir_entries(&dir)?.len();
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn chunk_revisions(&self, bucket: &BucketName) -> BackendResult<Vec<RevisionId>> {
        let mut revs = Vec::new();
        for entry in dir_entries(&self.bucket_dir(bucket).join(CHUNKS_DIR))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match RevisionId::parse(&name) {
                Ok(rev) => revs.push(rev),
                Err(_) => warn!(entry = %name, "skipping unknown entry in chunk directory"),
            }
        }
        revs.sort();
        Ok(revs)
    }

    fn read_record(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
    ) -> BackendResult<Option<ObjectRecord>> {
        let path = self.record_path(bucket, name);
        if !path.is_file() {
            return Ok(None);
        }
        Self::read_record_file(&path).map(Some)
    }

    fn write_record(&self, record: &ObjectRecord) -> BackendResult<()> {
        self.ensure_bucket(record.bucket())?;
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(record.bucket(), record.name()), &data)
    }

    fn delete_record(&self, bucket: &BucketName, name: &ObjectName) -> BackendResult<bool> {
        match fs::remove_file(self.record_path(bucket, name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_records(&self, bucket: &BucketName) -> BackendResult<Vec<ObjectRecord>> {
        let mut records = Vec::new();
        for entry in dir_entries(&self.bucket_dir(bucket).join(META_DIR))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                // Leftover temporary files from an interrupted write.
                continue;
            }
            records.push(Self::read_record_file(&path)?);
        }
        Ok(records)
    }
}
