use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ostore_protocol::{ChunkHeader, ErrorCode, StoreCodec, StoreMessage, Subject};
use ostore_transport::RequestHandler;
use ostore_types::{BucketName, ChunkKey, ObjectMetadata, ObjectName, RevisionId};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ChunkBackend, ObjectRecord};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::reclaim::{ChunkReclaimer, ReclaimReport};

/// Default page size when a list request asks for 0 entries.
const DEFAULT_LIST_PAGE: u32 = 256;

struct Upload {
    bucket: BucketName,
    /// Chunks received so far; the next expected index.
    received: u32,
    bytes: u64,
    /// The chunk flagged final has arrived.
    finished: bool,
    touched: Instant,
}

struct Lease {
    bucket: BucketName,
    revision_id: RevisionId,
    chunk_count: u32,
    expires: Instant,
}

#[derive(Default)]
struct ServiceState {
    uploads: HashMap<RevisionId, Upload>,
    leases: HashMap<u64, Lease>,
    /// Next commit sequence number per bucket.
    next_seq: HashMap<BucketName, u64>,
    /// Current objects of each bucket by commit sequence number.
    index: HashMap<BucketName, BTreeMap<u64, ObjectName>>,
}

/// Outcome of one maintenance pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub uploads_expired: usize,
    pub leases_expired: usize,
    pub reclaim: ReclaimReport,
}

/// The object store service: answers protocol requests over a backend.
///
/// Object records of a bucket are read and replaced only under that bucket's
/// install lock, so one revision install runs at a time per bucket and every
/// reader observes either the old current revision or the new one. The state
/// lock guards in-memory bookkeeping only and is never held across backend
/// I/O. Lock order: install, state, reclaimer.
pub struct StoreService {
    backend: Arc<dyn ChunkBackend>,
    reclaimer: ChunkReclaimer,
    config: ServerConfig,
    state: Mutex<ServiceState>,
    installs: Mutex<HashMap<BucketName, Arc<Mutex<()>>>>,
    next_lease: AtomicU64,
}

impl StoreService {
    /// Start a service over `backend`.
    ///
    /// Holds are rebuilt from the stored records, and chunks of revisions no
    /// record refers to (uploads interrupted by a crash) are queued for
    /// reclamation.
    pub fn open(backend: Arc<dyn ChunkBackend>, config: ServerConfig) -> ServerResult<Self> {
        let reclaimer = ChunkReclaimer::new();
        let mut next_seq = HashMap::new();
        let mut index = HashMap::new();
        let mut orphans = 0usize;
        for bucket in backend.list_buckets()? {
            let mut max_seq = 0;
            let mut order = BTreeMap::new();
            for record in backend.list_records(&bucket)? {
                max_seq = max_seq.max(record.seq);
                for rev in record.revision_ids() {
                    reclaimer.acquire(&bucket, rev);
                }
                order.insert(record.seq, record.current.name);
            }
            index.insert(bucket.clone(), order);
            for rev in backend.chunk_revisions(&bucket)? {
                if reclaimer.ref_count(&bucket, rev) == 0 {
                    reclaimer.enqueue_orphan(&bucket, rev);
                    orphans += 1;
                }
            }
            next_seq.insert(bucket, max_seq + 1);
        }
        info!(buckets = next_seq.len(), orphans, "store service opened");
        Ok(Self {
            backend,
            reclaimer,
            config,
            state: Mutex::new(ServiceState {
                next_seq,
                index,
                ..ServiceState::default()
            }),
            installs: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn reclaimer(&self) -> &ChunkReclaimer {
        &self.reclaimer
    }

    /// Uploads currently in progress.
    pub fn active_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Read leases currently open.
    pub fn active_leases(&self) -> usize {
        self.lock().leases.len()
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().expect("lock poisoned")
    }

    fn install_lock(&self, bucket: &BucketName) -> Arc<Mutex<()>> {
        let mut installs = self.installs.lock().expect("lock poisoned");
        Arc::clone(installs.entry(bucket.clone()).or_default())
    }

    /// Decode, dispatch and encode one request. Never fails: errors become
    /// [`StoreMessage::Error`] replies.
    pub fn handle_frame(&self, subject: &str, payload: &[u8]) -> Bytes {
        let reply = match self.dispatch_frame(subject, payload) {
            Ok(reply) => reply,
            Err(e) => {
                let code = e.code();
                if code == ErrorCode::Internal {
                    warn!(subject, error = %e, "request failed");
                } else {
                    debug!(subject, error = %e, "request rejected");
                }
                StoreMessage::error(code, e.to_string())
            }
        };
        StoreCodec::encode(&reply).unwrap_or_else(|e| {
            warn!(subject, error = %e, "reply encoding failed");
            StoreCodec::encode(&StoreMessage::error(ErrorCode::Internal, e.to_string()))
                .unwrap_or_default()
        })
    }

    fn dispatch_frame(&self, subject: &str, payload: &[u8]) -> ServerResult<StoreMessage> {
        let subject = Subject::parse(subject)?;
        let msg = StoreCodec::decode_exact(payload)?;
        self.dispatch(&subject, msg)
    }

    /// Route a decoded request.
    pub fn dispatch(&self, subject: &Subject, msg: StoreMessage) -> ServerResult<StoreMessage> {
        match msg {
            StoreMessage::CreateBucket { bucket } => {
                check_bucket(subject, &bucket)?;
                let created = self.backend.create_bucket(&bucket)?;
                if created {
                    info!(%bucket, "bucket created");
                }
                Ok(StoreMessage::BucketCreated { bucket, created })
            }
            StoreMessage::BucketStatus { bucket } => {
                check_bucket(subject, &bucket)?;
                self.bucket_status(bucket)
            }
            StoreMessage::ListBuckets => Ok(StoreMessage::Buckets {
                buckets: self.backend.list_buckets()?,
            }),
            StoreMessage::PutChunk { header, payload } => {
                let Subject::Chunk { bucket, revision } = subject else {
                    return Err(ServerError::BadRequest("chunk sent on a non-chunk subject".into()));
                };
                if header.revision_id != *revision {
                    return Err(ServerError::BadRequest(format!(
                        "chunk of {} sent on subject of {revision}",
                        header.revision_id
                    )));
                }
                self.put_chunk(bucket, header, &payload)
            }
            StoreMessage::CommitObject {
                meta,
                allow_overwrite,
            } => {
                check_object(subject, &meta.bucket, &meta.name)?;
                let meta = self.commit(meta, allow_overwrite)?;
                Ok(StoreMessage::Committed { meta })
            }
            StoreMessage::AbortUpload {
                bucket,
                revision_id,
            } => {
                check_bucket(subject, &bucket)?;
                self.abort(&bucket, revision_id);
                Ok(StoreMessage::Ack)
            }
            StoreMessage::OpenObject {
                bucket,
                name,
                revision,
            } => {
                check_object(subject, &bucket, &name)?;
                let (meta, lease) = self.open_object(&bucket, &name, revision)?;
                Ok(StoreMessage::ObjectOpened { meta, lease })
            }
            StoreMessage::GetChunk {
                bucket,
                revision_id,
                index,
                lease,
            } => {
                check_bucket(subject, &bucket)?;
                self.get_chunk(&bucket, revision_id, index, lease)
            }
            StoreMessage::ReleaseLease { bucket, lease } => {
                check_bucket(subject, &bucket)?;
                self.release_lease(lease);
                Ok(StoreMessage::Ack)
            }
            StoreMessage::GetInfo { bucket, name } => {
                check_object(subject, &bucket, &name)?;
                let record = self.record(&bucket, &name)?;
                Ok(StoreMessage::Info {
                    meta: record.current,
                })
            }
            StoreMessage::ListRevisions { bucket, name } => {
                check_object(subject, &bucket, &name)?;
                let record = self.record(&bucket, &name)?;
                Ok(StoreMessage::Revisions {
                    current: record.current,
                    retained: record.retained,
                })
            }
            StoreMessage::ListObjects {
                bucket,
                after,
                limit,
            } => {
                check_bucket(subject, &bucket)?;
                self.list_objects(&bucket, after, limit)
            }
            StoreMessage::DeleteObject { bucket, name } => {
                check_object(subject, &bucket, &name)?;
                let meta = self.delete(&bucket, &name)?;
                Ok(StoreMessage::Deleted { meta })
            }
            other => Err(ServerError::BadRequest(format!(
                "{} is not a request",
                other.type_name()
            ))),
        }
    }

    fn bucket_status(&self, bucket: BucketName) -> ServerResult<StoreMessage> {
        if !self.backend.bucket_exists(&bucket)? {
            return Err(ServerError::NotFound(format!("bucket {bucket}")));
        }
        let records = self.backend.list_records(&bucket)?;
        Ok(StoreMessage::BucketInfo {
            objects: records.len() as u64,
            total_size: records.iter().map(|r| r.current.size).sum(),
            bucket,
        })
    }

    fn put_chunk(
        &self,
        bucket: &BucketName,
        header: ChunkHeader,
        payload: &[u8],
    ) -> ServerResult<StoreMessage> {
        let rev = header.revision_id;
        let ack = StoreMessage::ChunkAck {
            revision_id: rev,
            index: header.index,
        };
        if payload.len() > self.config.max_chunk_size as usize {
            return Err(ServerError::BadRequest(format!(
                "chunk of {} bytes exceeds limit {}",
                payload.len(),
                self.config.max_chunk_size
            )));
        }
        {
            let mut state = self.lock();
            let upload = state.uploads.entry(rev).or_insert_with(|| {
                self.reclaimer.acquire(bucket, rev);
                debug!(%bucket, revision = %rev, "upload started");
                Upload {
                    bucket: bucket.clone(),
                    received: 0,
                    bytes: 0,
                    finished: false,
                    touched: Instant::now(),
                }
            });
            if upload.bucket != *bucket {
                return Err(ServerError::BadRequest(format!(
                    "revision {rev} belongs to bucket {}",
                    upload.bucket
                )));
            }
            upload.touched = Instant::now();
            if header.index < upload.received {
                // Redelivered chunk: already stored.
                return Ok(ack);
            }
            if upload.finished {
                return Err(ServerError::BadRequest(format!(
                    "chunk {} after final chunk of {rev}",
                    header.index
                )));
            }
            if header.index > upload.received {
                return Err(ServerError::BadRequest(format!(
                    "chunk {} out of order, expected {}",
                    header.index, upload.received
                )));
            }
        }

        self.backend.write_chunk(bucket, &header.key(), payload)?;

        let mut state = self.lock();
        match state.uploads.get_mut(&rev) {
            Some(upload) if upload.received == header.index => {
                upload.received += 1;
                upload.bytes += payload.len() as u64;
                upload.finished = header.is_final();
            }
            Some(_) => {}
            None => {
                // Aborted or expired while the chunk was being written.
                drop(state);
                self.reclaimer.enqueue_orphan(bucket, rev);
                return Err(ServerError::NotFound(format!("upload {rev}")));
            }
        }
        Ok(ack)
    }

    fn commit(&self, mut meta: ObjectMetadata, allow_overwrite: bool) -> ServerResult<ObjectMetadata> {
        if !meta.is_consistent() {
            return Err(ServerError::BadRequest(format!(
                "inconsistent metadata: {} bytes in {} chunks of {}",
                meta.size, meta.chunk_count, meta.chunk_size
            )));
        }
        let bucket = meta.bucket.clone();
        let rev = meta.revision_id;

        let install = self.install_lock(&bucket);
        let _install = install.lock().expect("lock poisoned");
        let existing = self.backend.read_record(&bucket, &meta.name)?;
        if let Some(record) = &existing {
            if record.current.revision_id == rev {
                debug!(%bucket, name = %meta.name, "commit redelivered");
                return Ok(record.current.clone());
            }
        }

        let seq = {
            let mut state = self.lock();
            match state.uploads.get(&rev) {
                Some(up) if up.bucket != bucket => {
                    return Err(ServerError::BadRequest(format!(
                        "revision {rev} belongs to bucket {}",
                        up.bucket
                    )));
                }
                Some(up)
                    if up.received == meta.chunk_count && up.finished && up.bytes == meta.size => {}
                None if meta.chunk_count == 0 => {}
                Some(up) => {
                    return Err(ServerError::BadRequest(format!(
                        "upload incomplete: {} of {} chunks, {} of {} bytes",
                        up.received, meta.chunk_count, up.bytes, meta.size
                    )));
                }
                None => return Err(ServerError::NotFound(format!("upload {rev}"))),
            }
            if existing.is_some() && !allow_overwrite {
                return Err(ServerError::AlreadyExists(format!("{bucket}/{}", meta.name)));
            }
            // Held from here on, so upload expiry during the write cannot
            // free the chunks being installed.
            self.reclaimer.acquire(&bucket, rev);
            let slot = state.next_seq.entry(bucket.clone()).or_insert(1);
            let seq = *slot;
            *slot += 1;
            seq
        };

        let now = Utc::now();
        meta.revision = existing.as_ref().map_or(1, |r| r.current.revision + 1);
        meta.created_at = existing.as_ref().map_or(now, |r| r.current.created_at);
        meta.modified_at = now;

        let replaced_seq = existing.as_ref().map(|r| r.seq);
        let mut retained = Vec::new();
        let mut dropped = Vec::new();
        if let Some(record) = existing {
            retained.push(record.current);
            retained.extend(record.retained);
            if let Some(limit) = self.config.retention.limit() {
                dropped = retained.split_off(limit.min(retained.len()));
            }
        }
        let record = ObjectRecord {
            seq,
            current: meta.clone(),
            retained,
        };
        if let Err(e) = self.backend.write_record(&record) {
            self.reclaimer.release(&bucket, rev);
            return Err(e.into());
        }

        {
            let mut state = self.lock();
            let order = state.index.entry(bucket.clone()).or_default();
            if let Some(old) = replaced_seq {
                order.remove(&old);
            }
            order.insert(seq, meta.name.clone());
            if state.uploads.remove(&rev).is_some() {
                self.reclaimer.release(&bucket, rev);
            }
        }
        for old in &dropped {
            self.reclaimer.release(&bucket, old.revision_id);
        }
        info!(
            %bucket,
            name = %meta.name,
            revision = meta.revision,
            size = meta.size,
            chunks = meta.chunk_count,
            "revision installed"
        );
        Ok(meta)
    }

    fn abort(&self, bucket: &BucketName, rev: RevisionId) {
        let removed = self.lock().uploads.remove(&rev);
        if let Some(upload) = removed {
            debug!(%bucket, revision = %rev, chunks = upload.received, "upload aborted");
            self.reclaimer.release(&upload.bucket, rev);
        }
    }

    fn record(&self, bucket: &BucketName, name: &ObjectName) -> ServerResult<ObjectRecord> {
        self.backend
            .read_record(bucket, name)?
            .ok_or_else(|| ServerError::NotFound(format!("{bucket}/{name}")))
    }

    fn open_object(
        &self,
        bucket: &BucketName,
        name: &ObjectName,
        revision: Option<u64>,
    ) -> ServerResult<(ObjectMetadata, u64)> {
        let install = self.install_lock(bucket);
        let _install = install.lock().expect("lock poisoned");
        let record = self.record(bucket, name)?;
        let meta = match revision {
            None => record.current,
            Some(n) => record.revision(n).cloned().ok_or_else(|| {
                ServerError::NotFound(format!("{bucket}/{name} revision {n}"))
            })?,
        };
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        self.reclaimer.acquire(bucket, meta.revision_id);
        state.leases.insert(
            lease,
            Lease {
                bucket: bucket.clone(),
                revision_id: meta.revision_id,
                chunk_count: meta.chunk_count,
                expires: Instant::now() + self.config.lease_ttl(),
            },
        );
        debug!(%bucket, %name, revision = meta.revision, lease, "object opened");
        Ok((meta, lease))
    }

    fn get_chunk(
        &self,
        bucket: &BucketName,
        rev: RevisionId,
        index: u32,
        lease: u64,
    ) -> ServerResult<StoreMessage> {
        let chunk_count = {
            let mut state = self.lock();
            let held = state
                .leases
                .get_mut(&lease)
                .ok_or(ServerError::LeaseExpired(lease))?;
            if held.bucket != *bucket || held.revision_id != rev {
                return Err(ServerError::BadRequest(format!(
                    "lease {lease} does not cover {bucket}/{rev}"
                )));
            }
            held.expires = Instant::now() + self.config.lease_ttl();
            held.chunk_count
        };
        if index >= chunk_count {
            return Err(ServerError::BadRequest(format!(
                "chunk {index} out of range, revision has {chunk_count}"
            )));
        }
        let key = ChunkKey::new(rev, index);
        let data = self
            .backend
            .read_chunk(bucket, &key)?
            .ok_or_else(|| ServerError::NotFound(format!("chunk {key}")))?;
        Ok(StoreMessage::ChunkData {
            header: ChunkHeader::new(rev, index, index + 1 == chunk_count),
            payload: Bytes::from(data),
        })
    }

    fn release_lease(&self, lease: u64) {
        let removed = self.lock().leases.remove(&lease);
        if let Some(held) = removed {
            self.reclaimer.release(&held.bucket, held.revision_id);
        }
    }

    fn list_objects(
        &self,
        bucket: &BucketName,
        after: Option<u64>,
        limit: u32,
    ) -> ServerResult<StoreMessage> {
        let limit = match limit {
            0 => DEFAULT_LIST_PAGE,
            n => n.min(self.config.max_list_page),
        } as usize;
        let (page, more) = {
            let state = self.lock();
            let Some(order) = state.index.get(bucket) else {
                return Ok(StoreMessage::ObjectPage {
                    entries: Vec::new(),
                    last: None,
                    more: false,
                });
            };
            let from = after.map_or(0, |a| a.saturating_add(1));
            let mut range = order.range(from..);
            let page: Vec<(u64, ObjectName)> =
                range.by_ref().take(limit).map(|(seq, name)| (*seq, name.clone())).collect();
            (page, range.next().is_some())
        };

        let last = page.last().map(|(seq, _)| *seq);
        let mut entries = Vec::with_capacity(page.len());
        for (seq, name) in page {
            // Overwritten or deleted since the index was read; a newer
            // revision appears later in the order.
            match self.backend.read_record(bucket, &name)? {
                Some(record) if record.seq == seq => entries.push(record.current),
                _ => {}
            }
        }
        Ok(StoreMessage::ObjectPage {
            entries,
            last,
            more,
        })
    }

    fn delete(&self, bucket: &BucketName, name: &ObjectName) -> ServerResult<ObjectMetadata> {
        let install = self.install_lock(bucket);
        let _install = install.lock().expect("lock poisoned");
        let record = self.record(bucket, name)?;
        self.backend.delete_record(bucket, name)?;
        if let Some(order) = self.lock().index.get_mut(bucket) {
            order.remove(&record.seq);
        }
        for rev in record.revision_ids() {
            self.reclaimer.release(bucket, rev);
        }
        info!(%bucket, %name, revision = record.current.revision, "object deleted");
        Ok(record.current)
    }

    /// Drop uploads and leases idle past their TTL, then reclaim unheld chunks.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let now = Instant::now();
        let upload_ttl = self.config.upload_ttl();
        let (uploads, leases) = {
            let mut state = self.lock();
            let stale: Vec<RevisionId> = state
                .uploads
                .iter()
                .filter(|(_, u)| now.duration_since(u.touched) >= upload_ttl)
                .map(|(rev, _)| *rev)
                .collect();
            let uploads: Vec<(BucketName, RevisionId)> = stale
                .into_iter()
                .filter_map(|rev| state.uploads.remove(&rev).map(|u| (u.bucket, rev)))
                .collect();
            let expired: Vec<u64> = state
                .leases
                .iter()
                .filter(|(_, l)| l.expires <= now)
                .map(|(id, _)| *id)
                .collect();
            let leases: Vec<(BucketName, RevisionId)> = expired
                .into_iter()
                .filter_map(|id| state.leases.remove(&id).map(|l| (l.bucket, l.revision_id)))
                .collect();
            (uploads, leases)
        };
        for (bucket, rev) in uploads.iter().chain(&leases) {
            self.reclaimer.release(bucket, *rev);
        }
        if !uploads.is_empty() || !leases.is_empty() {
            debug!(uploads = uploads.len(), leases = leases.len(), "expired idle holds");
        }
        let reclaim = self.reclaimer.reclaim(self.backend.as_ref());
        MaintenanceReport {
            uploads_expired: uploads.len(),
            leases_expired: leases.len(),
            reclaim,
        }
    }

    /// Run [`StoreService::run_maintenance`] every maintenance interval, and
    /// whenever a revision is queued, until `cancel` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.maintenance_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = service.reclaimer.queued() => {}
                }
                let report = service.run_maintenance();
                if report.reclaim.revisions > 0 {
                    debug!(
                        revisions = report.reclaim.revisions,
                        chunks = report.reclaim.chunks,
                        "maintenance pass"
                    );
                }
            }
            // Final pass so nothing queued at shutdown is left behind.
            service.run_maintenance();
            debug!("maintenance stopped");
        })
    }
}

#[async_trait]
impl RequestHandler for StoreService {
    async fn handle(&self, subject: &str, payload: Bytes) -> Bytes {
        // Backend calls block; keep them off the other tasks of a worker.
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.handle_frame(subject, &payload))
            }
            _ => self.handle_frame(subject, &payload),
        }
    }
}

fn check_bucket(subject: &Subject, bucket: &BucketName) -> ServerResult<()> {
    match subject.bucket() {
        Some(b) if b != bucket => Err(ServerError::BadRequest(format!(
            "subject addresses bucket {b}, message addresses {bucket}"
        ))),
        _ => Ok(()),
    }
}

fn check_object(subject: &Subject, bucket: &BucketName, name: &ObjectName) -> ServerResult<()> {
    check_bucket(subject, bucket)?;
    match subject {
        Subject::Meta { name: n, .. } if n != name => Err(ServerError::BadRequest(format!(
            "subject addresses object {n}, message addresses {name}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::bucket;
    use crate::config::RetentionPolicy;
    use crate::error::{BackendError, BackendResult};
    use crate::memory::InMemoryBackend;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use ostore_crypto::digest_of;
    use ostore_protocol::ApiOp;
    use ostore_types::{DigestAlgorithm, ObjectHeaders};

    const CHUNK: usize = 4;

    fn service_with(config: ServerConfig) -> (Arc<InMemoryBackend>, StoreService) {
        let backend = Arc::new(InMemoryBackend::new());
        let service = StoreService::open(backend.clone(), config).unwrap();
        (backend, service)
    }

    fn service() -> (Arc<InMemoryBackend>, StoreService) {
        service_with(ServerConfig::default())
    }

    fn name(n: &str) -> ObjectName {
        ObjectName::new(n).unwrap()
    }

    fn meta_for(n: &str, data: &[u8], rev: RevisionId) -> ObjectMetadata {
        let now = Utc::now();
        ObjectMetadata {
            bucket: bucket(),
            name: name(n),
            size: data.len() as u64,
            digest: digest_of(DigestAlgorithm::Sha256, data),
            chunk_count: data.len().div_ceil(CHUNK) as u32,
            chunk_size: CHUNK as u32,
            revision: 0,
            revision_id: rev,
            created_at: now,
            modified_at: now,
            headers: ObjectHeaders::new(),
        }
    }

    fn send_chunks(service: &StoreService, data: &[u8], rev: RevisionId) {
        send_chunks_in(service, &bucket(), data, rev)
    }

    fn send_chunks_in(service: &StoreService, b: &BucketName, data: &[u8], rev: RevisionId) {
        let chunks: Vec<&[u8]> = data.chunks(CHUNK).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let reply = service
                .dispatch(
                    &Subject::chunk(b, rev),
                    StoreMessage::PutChunk {
                        header: ChunkHeader::new(rev, i as u32, i + 1 == chunks.len()),
                        payload: Bytes::copy_from_slice(chunk),
                    },
                )
                .unwrap();
            assert!(matches!(reply, StoreMessage::ChunkAck { index, .. } if index == i as u32));
        }
    }

    fn commit(
        service: &StoreService,
        n: &str,
        data: &[u8],
        allow_overwrite: bool,
    ) -> ServerResult<ObjectMetadata> {
        commit_in(service, &bucket(), n, data, allow_overwrite)
    }

    fn commit_in(
        service: &StoreService,
        b: &BucketName,
        n: &str,
        data: &[u8],
        allow_overwrite: bool,
    ) -> ServerResult<ObjectMetadata> {
        let rev = RevisionId::new();
        send_chunks_in(service, b, data, rev);
        let meta = ObjectMetadata {
            bucket: b.clone(),
            ..meta_for(n, data, rev)
        };
        let subject = Subject::meta(b, &meta.name);
        match service.dispatch(&subject, StoreMessage::CommitObject { meta, allow_overwrite })? {
            StoreMessage::Committed { meta } => Ok(meta),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn read_all(service: &StoreService, n: &str, revision: Option<u64>) -> ServerResult<Vec<u8>> {
        let subject = Subject::meta(&bucket(), &name(n));
        let (meta, lease) = match service.dispatch(
            &subject,
            StoreMessage::OpenObject { bucket: bucket(), name: name(n), revision },
        )? {
            StoreMessage::ObjectOpened { meta, lease } => (meta, lease),
            other => panic!("unexpected reply {other:?}"),
        };
        let mut out = Vec::new();
        for index in 0..meta.chunk_count {
            let reply = service.dispatch(
                &Subject::chunk(&bucket(), meta.revision_id),
                StoreMessage::GetChunk {
                    bucket: bucket(),
                    revision_id: meta.revision_id,
                    index,
                    lease,
                },
            )?;
            let (header, payload) = match reply {
                StoreMessage::ChunkData { header, payload } => (header, payload),
                other => panic!("unexpected reply {other:?}"),
            };
            assert_eq!(header.is_final(), index + 1 == meta.chunk_count);
            out.extend_from_slice(&payload);
        }
        service.release_lease(lease);
        Ok(out)
    }

    const SLOW_BUCKET: &str = "slow";

    /// In-memory backend that counts record reads and can park or fail
    /// record writes.
    #[derive(Default)]
    struct CountingBackend {
        inner: InMemoryBackend,
        record_reads: AtomicUsize,
        record_lists: AtomicUsize,
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
        gate_waiting: AtomicBool,
        fail_writes: bool,
    }

    impl CountingBackend {
        /// Record writes into [`SLOW_BUCKET`] wait for a message on `gate`.
        fn gated(gate: std::sync::mpsc::Receiver<()>) -> Self {
            Self {
                gate: Mutex::new(Some(gate)),
                ..Self::default()
            }
        }

        fn failing_writes() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }

        fn reset(&self) {
            self.record_reads.store(0, Ordering::SeqCst);
            self.record_lists.store(0, Ordering::SeqCst);
        }
    }

    impl ChunkBackend for CountingBackend {
        fn create_bucket(&self, bucket: &BucketName) -> BackendResult<bool> {
            self.inner.create_bucket(bucket)
        }

        fn bucket_exists(&self, bucket: &BucketName) -> BackendResult<bool> {
            self.inner.bucket_exists(bucket)
        }

        fn list_buckets(&self) -> BackendResult<Vec<BucketName>> {
            self.inner.list_buckets()
        }

        fn write_chunk(&self, bucket: &BucketName, key: &ChunkKey, data: &[u8]) -> BackendResult<()> {
            self.inner.write_chunk(bucket, key, data)
        }

        fn read_chunk(&self, bucket: &BucketName, key: &ChunkKey) -> BackendResult<Option<Vec<u8>>> {
            self.inner.read_chunk(bucket, key)
        }

        fn delete_revision(&self, bucket: &BucketName, revision: &RevisionId) -> BackendResult<usize> {
            self.inner.delete_revision(bucket, revision)
        }

        fn chunk_revisions(&self, bucket: &BucketName) -> BackendResult<Vec<RevisionId>> {
            self.inner.chunk_revisions(bucket)
        }

        fn read_record(
            &self,
            bucket: &BucketName,
            name: &ObjectName,
        ) -> BackendResult<Option<ObjectRecord>> {
            self.record_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_record(bucket, name)
        }

        fn write_record(&self, record: &ObjectRecord) -> BackendResult<()> {
            if self.fail_writes {
                return Err(BackendError::Io(std::io::Error::other("disk full")));
            }
            if record.bucket().as_str() == SLOW_BUCKET {
                let gate = self.gate.lock().unwrap().take();
                if let Some(gate) = gate {
                    self.gate_waiting.store(true, Ordering::SeqCst);
                    gate.recv().unwrap();
                }
            }
            self.inner.write_record(record)
        }

        fn delete_record(&self, bucket: &BucketName, name: &ObjectName) -> BackendResult<bool> {
            self.inner.delete_record(bucket, name)
        }

        fn list_records(&self, bucket: &BucketName) -> BackendResult<Vec<ObjectRecord>> {
            self.record_lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list_records(bucket)
        }
    }

    #[test]
    fn put_commit_read() {
        let (_backend, service) = service();
        let meta = commit(&service, "a.bin", b"hello world", true).unwrap();
        assert_eq!(meta.revision, 1);
        assert_eq!(meta.chunk_count, 3);
        assert_eq!(read_all(&service, "a.bin", None).unwrap(), b"hello world");
        assert_eq!(service.active_uploads(), 0);
        assert_eq!(service.active_leases(), 0);
    }

    #[test]
    fn empty_object_commits_without_chunks() {
        let (backend, service) = service();
        let meta = commit(&service, "empty", b"", true).unwrap();
        assert_eq!(meta.chunk_count, 0);
        assert_eq!(meta.size, 0);
        assert_eq!(backend.chunk_count(), 0);
        assert!(read_all(&service, "empty", None).unwrap().is_empty());
    }

    #[test]
    fn overwrite_bumps_revision_and_reclaims_old_chunks() {
        let (backend, service) = service();
        let first = commit(&service, "obj", b"first version", true).unwrap();
        let second = commit(&service, "obj", b"second", true).unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.created_at, first.created_at);
        let report = service.run_maintenance();
        assert_eq!(report.reclaim.revisions, 1);
        assert_eq!(backend.chunk_count(), 2);
        assert_eq!(read_all(&service, "obj", None).unwrap(), b"second");
    }

    #[test]
    fn overwrite_refused_when_not_allowed() {
        let (_backend, service) = service();
        commit(&service, "obj", b"one", true).unwrap();
        let err = commit(&service, "obj", b"two", false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert_eq!(read_all(&service, "obj", None).unwrap(), b"one");
    }

    #[test]
    fn open_lease_defers_reclamation() {
        let (backend, service) = service();
        commit(&service, "obj", b"old data", true).unwrap();
        let (old, lease) = service.open_object(&bucket(), &name("obj"), None).unwrap();
        commit(&service, "obj", b"new", true).unwrap();
        service.run_maintenance();
        // The superseded revision is still readable through the lease.
        let reply = service
            .get_chunk(&bucket(), old.revision_id, 1, lease)
            .unwrap();
        assert!(matches!(reply, StoreMessage::ChunkData { payload, .. } if &payload[..] == b"data"));
        service.release_lease(lease);
        service.run_maintenance();
        assert_eq!(backend.chunk_count(), 1);
    }

    #[test]
    fn retention_keeps_previous_revisions() {
        let config = ServerConfig {
            retention: RetentionPolicy::KeepLast(1),
            ..ServerConfig::default()
        };
        let (_backend, service) = service_with(config);
        commit(&service, "obj", b"v1", true).unwrap();
        commit(&service, "obj", b"v2", true).unwrap();
        commit(&service, "obj", b"v3", true).unwrap();
        service.run_maintenance();
        assert_eq!(read_all(&service, "obj", Some(2)).unwrap(), b"v2");
        let err = read_all(&service, "obj", Some(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let record = service.record(&bucket(), &name("obj")).unwrap();
        assert_eq!(record.retained.len(), 1);
    }

    #[test]
    fn out_of_order_chunk_rejected() {
        let (_backend, service) = service();
        let rev = RevisionId::new();
        let err = service
            .put_chunk(&bucket(), ChunkHeader::new(rev, 1, false), b"abcd")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn redelivered_chunk_is_acked_once() {
        let (backend, service) = service();
        let rev = RevisionId::new();
        let header = ChunkHeader::new(rev, 0, false);
        service.put_chunk(&bucket(), header, b"abcd").unwrap();
        service.put_chunk(&bucket(), header, b"abcd").unwrap();
        service
            .put_chunk(&bucket(), ChunkHeader::new(rev, 1, true), b"ef")
            .unwrap();
        assert_eq!(backend.chunk_count(), 2);
        let meta = meta_for("redelivered", b"abcdef", rev);
        let first = service.commit(meta.clone(), true).unwrap();
        let again = service.commit(meta, true).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn incomplete_upload_cannot_commit() {
        let (_backend, service) = service();
        let rev = RevisionId::new();
        service
            .put_chunk(&bucket(), ChunkHeader::new(rev, 0, false), b"abcd")
            .unwrap();
        let err = service
            .commit(meta_for("partial", b"abcdefgh", rev), true)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(service.record(&bucket(), &name("partial")).is_err());
    }

    #[test]
    fn abort_reclaims_partial_upload() {
        let (backend, service) = service();
        let rev = RevisionId::new();
        service
            .put_chunk(&bucket(), ChunkHeader::new(rev, 0, false), b"abcd")
            .unwrap();
        service.abort(&bucket(), rev);
        let report = service.run_maintenance();
        assert_eq!(report.reclaim.chunks, 1);
        assert_eq!(backend.chunk_count(), 0);
    }

    #[test]
    fn idle_upload_and_lease_expire() {
        let config = ServerConfig {
            lease_ttl_secs: 0,
            upload_ttl_secs: 0,
            ..ServerConfig::default()
        };
        let (backend, service) = service_with(config);
        commit(&service, "obj", b"data", true).unwrap();
        let (meta, lease) = service.open_object(&bucket(), &name("obj"), None).unwrap();
        let rev = RevisionId::new();
        service
            .put_chunk(&bucket(), ChunkHeader::new(rev, 0, false), b"abcd")
            .unwrap();
        let report = service.run_maintenance();
        assert_eq!(report.uploads_expired, 1);
        assert_eq!(report.leases_expired, 1);
        assert_eq!(backend.chunk_count(), 1);
        let err = service.get_chunk(&bucket(), meta.revision_id, 0, lease).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseExpired);
    }

    fn page(reply: StoreMessage) -> (Vec<String>, Option<u64>, bool) {
        match reply {
            StoreMessage::ObjectPage { entries, last, more } => (
                entries.iter().map(|m| m.name.as_str().to_string()).collect(),
                last,
                more,
            ),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn list_pages_in_commit_order() {
        let (_backend, service) = service();
        for n in ["c", "a", "b"] {
            commit(&service, n, n.as_bytes(), true).unwrap();
        }
        commit(&service, "c", b"c2", true).unwrap();
        let (names, last, more) = page(service.list_objects(&bucket(), None, 2).unwrap());
        assert_eq!(names, vec!["a", "b"]);
        assert!(more);
        let (names, last, more) = page(service.list_objects(&bucket(), last, 2).unwrap());
        assert_eq!(names, vec!["c"]);
        assert!(!more);
        let record = service.record(&bucket(), &name("c")).unwrap();
        assert_eq!(record.current.revision, 2);
        assert_eq!(last, Some(record.seq));
    }

    #[test]
    fn final_page_cursor_resumes_after_new_commits() {
        let (_backend, service) = service();
        for n in ["a", "b", "c"] {
            commit(&service, n, n.as_bytes(), true).unwrap();
        }
        let (_, first, _) = page(service.list_objects(&bucket(), None, 2).unwrap());
        let (names, last, more) = page(service.list_objects(&bucket(), first, 2).unwrap());
        assert_eq!(names, vec!["c"]);
        assert!(!more);
        assert!(last.is_some());

        commit(&service, "d", b"d", true).unwrap();
        let (names, _, more) = page(service.list_objects(&bucket(), last, 2).unwrap());
        assert_eq!(names, vec!["d"]);
        assert!(!more);
    }

    #[test]
    fn list_of_unknown_bucket_is_empty() {
        let (_backend, service) = service();
        let missing = BucketName::new("missing").unwrap();
        let (names, last, more) = page(service.list_objects(&missing, None, 0).unwrap());
        assert!(names.is_empty());
        assert_eq!(last, None);
        assert!(!more);
    }

    #[test]
    fn list_reads_only_the_requested_page() {
        let backend = Arc::new(CountingBackend::default());
        let service = StoreService::open(backend.clone(), ServerConfig::default()).unwrap();
        for i in 0..10 {
            commit(&service, &format!("obj{i}"), b"x", true).unwrap();
        }
        backend.reset();
        let (names, _, more) = page(service.list_objects(&bucket(), None, 3).unwrap());
        assert_eq!(names, vec!["obj0", "obj1", "obj2"]);
        assert!(more);
        assert_eq!(backend.record_lists.load(Ordering::SeqCst), 0);
        assert_eq!(backend.record_reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn list_skips_entries_deleted_or_moved() {
        let (_backend, service) = service();
        for n in ["a", "b", "c"] {
            commit(&service, n, n.as_bytes(), true).unwrap();
        }
        service.delete(&bucket(), &name("b")).unwrap();
        commit(&service, "a", b"a2", true).unwrap();
        let (names, _, _) = page(service.list_objects(&bucket(), None, 0).unwrap());
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn slow_install_does_not_block_other_buckets() {
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let backend = Arc::new(CountingBackend::gated(gate));
        let service = Arc::new(StoreService::open(backend.clone(), ServerConfig::default()).unwrap());
        commit(&service, "ready", b"data", true).unwrap();

        let slow = BucketName::new(SLOW_BUCKET).unwrap();
        let writer = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || commit_in(&service, &slow, "blocked", b"bytes", true))
        };
        while !backend.gate_waiting.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        // The slow bucket's record write is parked; this bucket proceeds.
        commit(&service, "other", b"more", true).unwrap();
        let (meta, lease) = service.open_object(&bucket(), &name("ready"), None).unwrap();
        assert_eq!(meta.revision, 1);
        service.release_lease(lease);
        assert_eq!(service.active_uploads(), 1);

        release.send(()).unwrap();
        let meta = writer.join().unwrap().unwrap();
        assert_eq!(meta.revision, 1);
        assert_eq!(service.active_uploads(), 0);
    }

    #[test]
    fn failed_record_write_keeps_upload_chunks_reclaimable() {
        let backend = Arc::new(CountingBackend::failing_writes());
        let service = StoreService::open(backend.clone(), ServerConfig::default()).unwrap();
        let err = commit(&service, "obj", b"abcdef", true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        let rev = service.lock().uploads.keys().copied().next().unwrap();
        assert_eq!(service.reclaimer().ref_count(&bucket(), rev), 1);
        service.abort(&bucket(), rev);
        service.run_maintenance();
        assert_eq!(backend.inner.chunk_count(), 0);
    }

    #[test]
    fn delete_removes_record_and_chunks() {
        let (backend, service) = service();
        commit(&service, "gone", b"some bytes", true).unwrap();
        let meta = service.delete(&bucket(), &name("gone")).unwrap();
        assert_eq!(meta.revision, 1);
        service.run_maintenance();
        assert_eq!(backend.chunk_count(), 0);
        let err = service.delete(&bucket(), &name("gone")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn reopen_sweeps_orphaned_chunks() {
        let backend = Arc::new(InMemoryBackend::new());
        {
            let service = StoreService::open(backend.clone(), ServerConfig::default()).unwrap();
            commit(&service, "kept", b"kept", true).unwrap();
            service
                .put_chunk(&bucket(), ChunkHeader::new(RevisionId::new(), 0, false), b"lost")
                .unwrap();
        }
        assert_eq!(backend.chunk_count(), 2);
        let service = StoreService::open(backend.clone(), ServerConfig::default()).unwrap();
        assert_eq!(service.reclaimer().pending(), 1);
        service.run_maintenance();
        assert_eq!(backend.chunk_count(), 1);
        // Commit order continues after reopen.
        commit(&service, "next", b"n", true).unwrap();
        let record = service.record(&bucket(), &name("next")).unwrap();
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn bucket_operations() {
        let (_backend, service) = service();
        let subject = Subject::api(ApiOp::Create, Some(&bucket()));
        let reply = service
            .dispatch(&subject, StoreMessage::CreateBucket { bucket: bucket() })
            .unwrap();
        assert_eq!(reply, StoreMessage::BucketCreated { bucket: bucket(), created: true });
        commit(&service, "x", b"12345", true).unwrap();
        let reply = service
            .dispatch(
                &Subject::api(ApiOp::Info, Some(&bucket())),
                StoreMessage::BucketStatus { bucket: bucket() },
            )
            .unwrap();
        assert_eq!(
            reply,
            StoreMessage::BucketInfo { bucket: bucket(), objects: 1, total_size: 5 }
        );
        let missing = BucketName::new("missing").unwrap();
        let err = service.bucket_status(missing).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn subject_mismatch_rejected() {
        let (_backend, service) = service();
        let other = BucketName::new("other").unwrap();
        let err = service
            .dispatch(
                &Subject::api(ApiOp::List, Some(&other)),
                StoreMessage::ListObjects { bucket: bucket(), after: None, limit: 0 },
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn handler_encodes_errors_as_replies() {
        let (_backend, service) = service();
        let frame = StoreCodec::encode(&StoreMessage::GetInfo {
            bucket: bucket(),
            name: name("nope"),
        })
        .unwrap();
        let subject = Subject::meta(&bucket(), &name("nope")).to_string();
        let reply = service.handle(&subject, frame).await;
        let msg = StoreCodec::decode_exact(&reply).unwrap();
        assert!(matches!(msg, StoreMessage::Error { code: ErrorCode::NotFound, .. }));

        let reply = service.handle("$O.bad subject", Bytes::new()).await;
        let msg = StoreCodec::decode_exact(&reply).unwrap();
        assert!(matches!(msg, StoreMessage::Error { code: ErrorCode::BadRequest, .. }));
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_cancel() {
        let (backend, service) = service();
        let service = Arc::new(service);
        commit(&service, "obj", b"one", true).unwrap();
        commit(&service, "obj", b"two", true).unwrap();
        let cancel = CancellationToken::new();
        let task = service.spawn_maintenance(cancel.clone());
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(backend.chunk_count(), 1);
    }
}
