use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Options {
    /// Directory all spaces live under.
    pub root: PathBuf,

    /// Directory upload sessions are persisted to. Defaults to `<root>/uploads`.
    #[serde(default)]
    pub upload_directory: Option<PathBuf>,

    /// Delay before a scan request for a path is executed. Repeated requests
    /// for the same path within the window are coalesced. 0 runs inline.
    #[serde(default = "default_scan_debounce_delay_ms")]
    pub scan_debounce_delay_ms: u64,

    /// Number of scan workers draining the scan queue.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Disable revision creation on overwrite.
    #[serde(default)]
    pub disable_versioning: bool,

    /// Scope the effective uid/gid to the space's group while working inside it.
    #[serde(default)]
    pub use_space_groups: bool,

    /// Maximum number of entries kept in each direction of the id cache.
    #[serde(default = "default_id_cache_capacity")]
    pub id_cache_capacity: u64,
}

fn default_scan_debounce_delay_ms() -> u64 {
    1000
}

fn default_max_concurrency() -> usize {
    5
}

fn default_id_cache_capacity() -> u64 {
    1_000_000
}

impl Options {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            upload_directory: None,
            scan_debounce_delay_ms: default_scan_debounce_delay_ms(),
            max_concurrency: default_max_concurrency(),
            disable_versioning: false,
            use_space_groups: false,
            id_cache_capacity: default_id_cache_capacity(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let opts: Options = toml::from_str(&content)?;
        Ok(opts)
    }

    /// Resolved upload session directory.
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_directory
            .clone()
            .unwrap_or_else(|| self.root.join("uploads"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::new("/data/spaces");
        assert_eq!(opts.scan_debounce_delay_ms, 1000);
        assert_eq!(opts.max_concurrency, 5);
        assert!(!opts.disable_versioning);
        assert_eq!(opts.upload_dir(), PathBuf::from("/data/spaces/uploads"));
    }

    #[test]
    fn test_from_toml() {
        let cfg: Options = toml::from_str(
            r#"
            root = "/srv/storage"
            scan_debounce_delay_ms = 50
            max_concurrency = 2
            disable_versioning = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/storage"));
        assert_eq!(cfg.scan_debounce_delay_ms, 50);
        assert_eq!(cfg.max_concurrency, 2);
        assert!(cfg.disable_versioning);
    }
}
