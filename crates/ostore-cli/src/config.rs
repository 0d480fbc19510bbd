use std::path::Path;

use anyhow::Context;
use ostore_client::StoreConfig;
use ostore_server::ServerConfig;
use serde::{Deserialize, Serialize};

/// Name of the configuration file looked up under the store root.
pub const CONFIG_FILE: &str = "ostore.toml";

/// Contents of `ostore.toml`: a `[store]` table for the client and a
/// `[server]` table for the local service. Both are optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl CliConfig {
    /// Load `explicit` if given, which must exist. Otherwise load
    /// `<root>/ostore.toml` when present and fall back to defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = root.join(CONFIG_FILE);
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config
            .store
            .validate()
            .with_context(|| format!("invalid [store] in {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostore_server::RetentionPolicy;
    use ostore_types::DigestAlgorithm;

    #[test]
    fn missing_default_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(dir.path(), None).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(CliConfig::load(dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn reads_both_tables_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
                [store]
                chunk_size = 4096
                digest = "blake3"

                [server]
                retention = { keep-last = 2 }
            "#,
        )
        .unwrap();
        let config = CliConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.store.chunk_size, 4096);
        assert_eq!(config.store.digest, DigestAlgorithm::Blake3);
        assert_eq!(config.store.max_retries, StoreConfig::default().max_retries);
        assert_eq!(config.server.retention, RetentionPolicy::KeepLast(2));
    }

    #[test]
    fn invalid_store_table_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[store]\nchunk_size = 0\n").unwrap();
        assert!(CliConfig::load(dir.path(), Some(&path)).is_err());
    }
}
