use std::time::Duration;

use ostore_protocol::{CHUNK_HEADER_LEN, MAX_MESSAGE_SIZE};
use ostore_types::DigestAlgorithm;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub const DEFAULT_CHUNK_SIZE: u32 = 128 * 1024;

/// Longest delay between two retries of a request.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Client-side settings of an [`ObjectStore`](crate::ObjectStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum chunk payload in bytes.
    pub chunk_size: u32,
    /// Algorithm used for new objects. Reads verify with the stored one.
    pub digest: DigestAlgorithm,
    /// Round-trip timeout of a single request.
    pub chunk_timeout_ms: u64,
    /// Retries of a request after a transient failure.
    pub max_retries: u32,
    /// Base delay before the first retry; doubled on each further attempt.
    pub retry_backoff_ms: u64,
    /// Replace existing objects on put. When false, put fails with
    /// `AlreadyExists`.
    pub allow_overwrite: bool,
    /// Entries requested per list page.
    pub list_page_size: u32,
}

impl StoreConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.chunk_size == 0 {
            return Err(StoreError::InvalidArgument("chunk_size must be positive".into()));
        }
        if self.chunk_size as usize + CHUNK_HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "chunk_size {} exceeds the message limit",
                self.chunk_size
            )));
        }
        if self.chunk_timeout_ms == 0 {
            return Err(StoreError::InvalidArgument("chunk_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            digest: DigestAlgorithm::Sha256,
            chunk_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 100,
            allow_overwrite: true,
            list_page_size: 256,
        }
    }
}
