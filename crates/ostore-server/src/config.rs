use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many superseded revisions of an object stay readable.
///
/// In TOML: `retention = "keep-none"`, `retention = "keep-all"` or
/// `retention = { keep-last = 3 }`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Only the current revision is kept.
    #[default]
    KeepNone,
    /// The current revision plus up to `n` previous ones.
    KeepLast(u32),
    KeepAll,
}

impl RetentionPolicy {
    /// Maximum number of superseded revisions to keep, `None` = unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::KeepNone => Some(0),
            Self::KeepLast(n) => Some(*n as usize),
            Self::KeepAll => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub retention: RetentionPolicy,
    /// Read leases not renewed for this long are dropped.
    pub lease_ttl_secs: u64,
    /// Uploads with no chunk activity for this long are discarded.
    pub upload_ttl_secs: u64,
    /// Period of the expiry and reclamation pass.
    pub maintenance_interval_ms: u64,
    /// Largest chunk payload accepted.
    pub max_chunk_size: u32,
    /// Upper bound on entries per list page.
    pub max_list_page: u32,
}

impl ServerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::KeepNone,
            lease_ttl_secs: 30,
            upload_ttl_secs: 300,
            maintenance_interval_ms: 1_000,
            max_chunk_size: 4 * 1024 * 1024,
            max_list_page: 1_024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = ServerConfig::default();
        assert_eq!(c.retention, RetentionPolicy::KeepNone);
        assert_eq!(c.lease_ttl(), Duration::from_secs(30));
        assert_eq!(c.upload_ttl(), Duration::from_secs(300));
        assert_eq!(c.max_chunk_size, 4 * 1024 * 1024);
    }

    #[test]
    fn retention_limits() {
        assert_eq!(RetentionPolicy::KeepNone.limit(), Some(0));
        assert_eq!(RetentionPolicy::KeepLast(3).limit(), Some(3));
        assert_eq!(RetentionPolicy::KeepAll.limit(), None);
    }

    #[test]
    fn parses_from_toml() {
        let c: ServerConfig = toml::from_str(
            r#"
            retention = { keep-last = 2 }
            lease_ttl_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.retention, RetentionPolicy::KeepLast(2));
        assert_eq!(c.lease_ttl_secs, 5);
        assert_eq!(c.upload_ttl_secs, 300);

        let c: ServerConfig = toml::from_str(r#"retention = "keep-all""#).unwrap();
        assert_eq!(c.retention, RetentionPolicy::KeepAll);
    }
}
