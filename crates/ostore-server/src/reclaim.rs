use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ostore_types::{BucketName, RevisionId};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backend::ChunkBackend;

type RevisionKey = (BucketName, RevisionId);

/// Outcome of one reclamation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Revisions whose chunks were deleted.
    pub revisions: usize,
    pub chunks: usize,
    /// Revisions that failed to delete and were queued again.
    pub failed: usize,
}

#[derive(Default)]
struct ReclaimState {
    refs: HashMap<RevisionKey, usize>,
    pending: VecDeque<RevisionKey>,
}

/// Reference-counted tracking of which revisions' chunks are still needed.
///
/// A revision is held by its object's current record, by retention, by an
/// upload in progress and by each open read lease. When the last hold is
/// released the revision is queued, and a later [`ChunkReclaimer::reclaim`]
/// deletes its chunks. Chunks are never deleted while any hold remains.
#[derive(Default)]
pub struct ChunkReclaimer {
    state: Mutex<ReclaimState>,
    notify: Notify,
}

impl ChunkReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one hold on a revision.
    pub fn acquire(&self, bucket: &BucketName, revision: RevisionId) {
        let mut state = self.state.lock().expect("lock poisoned");
        *state.refs.entry((bucket.clone(), revision)).or_insert(0) += 1;
    }

    /// Drop one hold; the revision is queued when none remain.
    pub fn release(&self, bucket: &BucketName, revision: RevisionId) {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = (bucket.clone(), revision);
        match state.refs.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.refs.remove(&key);
                state.pending.push_back(key);
                drop(state);
                self.notify.notify_one();
            }
            None => warn!(%bucket, %revision, "release of unheld revision"),
        }
    }

    /// Queue a revision found without any holder, e.g. chunks left behind
    /// by a crash. Ignored if the revision is held.
    pub fn enqueue_orphan(&self, bucket: &BucketName, revision: RevisionId) {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = (bucket.clone(), revision);
        if state.refs.contains_key(&key) {
            return;
        }
        state.pending.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    pub fn ref_count(&self, bucket: &BucketName, revision: RevisionId) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state
            .refs
            .get(&(bucket.clone(), revision))
            .copied()
            .unwrap_or(0)
    }

    /// Revisions waiting for deletion.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("lock poisoned").pending.len()
    }

    /// Resolves once something was queued since the last wakeup.
    pub async fn queued(&self) {
        self.notify.notified().await;
    }

    /// Delete the chunks of every queued revision that is still unheld.
    pub fn reclaim(&self, backend: &dyn ChunkBackend) -> ReclaimReport {
        let batch: Vec<RevisionKey> = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.pending.drain(..).collect()
        };
        let mut report = ReclaimReport::default();
        for key in batch {
            // Re-acquired since it was queued (an idempotent commit retry).
            if self.ref_count(&key.0, key.1) > 0 {
                continue;
            }
            match backend.delete_revision(&key.0, &key.1) {
                Ok(chunks) => {
                    debug!(bucket = %key.0, revision = %key.1, chunks, "reclaimed revision");
                    report.revisions += 1;
                    report.chunks += chunks;
                }
                Err(e) => {
                    warn!(bucket = %key.0, revision = %key.1, error = %e, "reclaim failed");
                    report.failed += 1;
                    self.state
                        .lock()
                        .expect("lock poisoned")
                        .pending
                        .push_back(key);
                }
            }
        }
        report
    }
}
