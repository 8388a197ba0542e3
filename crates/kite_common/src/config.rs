//! Store-core configuration.
//!
//! Loaded once at startup from TOML (`kite.toml`); every section has full
//! defaults so an empty file is a valid configuration. Runtime-mutable flags
//! live in [`AtomicOptions`]; everything else is immutable after boot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Top-level configuration for one store process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub ts_provider: TsProviderConfig,
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Engine root and column-family tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of engine data.
    pub db_path: PathBuf,
    /// Column families opened at init. Empty means the built-in list.
    #[serde(default)]
    pub column_families: Vec<String>,
    /// Per-CF engine tuning, keyed by CF name.
    #[serde(default)]
    pub cf_tuning: HashMap<String, CfTuning>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./kite-data"),
            column_families: Vec::new(),
            cf_tuning: HashMap::new(),
        }
    }
}

/// Tuning knobs forwarded to the underlying sorted-key engine per CF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfTuning {
    pub block_size: u64,
    pub block_cache: u64,
    pub write_buffer_size: u64,
    pub target_file_size_base: u64,
    pub bloom_filter_bits_per_key: u32,
    /// Compression algorithm name per level, bottom-up.
    #[serde(default)]
    pub compression_per_level: Vec<String>,
    /// Fixed-length prefix extractor; None disables prefix mode.
    #[serde(default)]
    pub prefix_extractor_len: Option<usize>,
}

impl Default for CfTuning {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            block_cache: 256 * 1024 * 1024,
            write_buffer_size: 64 * 1024 * 1024,
            target_file_size_base: 64 * 1024 * 1024,
            bloom_filter_bits_per_key: 10,
            compression_per_level: Vec::new(),
            prefix_extractor_len: None,
        }
    }
}

/// Raft log storage location and segment sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Per-region logs live at `{log_path}/{region_id}/`.
    pub log_path: PathBuf,
    pub segmentlog_max_segment_size: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./kite-raft"),
            segmentlog_max_segment_size: 32 * 1024 * 1024,
        }
    }
}

/// Region split policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SplitPolicy {
    Half,
    Size,
    Keys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    pub policy: SplitPolicy,
    /// Region size at which a split fires.
    pub threshold_size: u64,
    /// HALF policy: candidate key sampling granularity.
    pub chunk_size: u64,
    /// SIZE policy: split position as a fraction of threshold_size.
    pub size_ratio: f64,
    /// KEYS policy: distinct-key count at which a split fires.
    pub keys_number: u64,
    /// KEYS policy: split position as a fraction of keys_number.
    pub keys_ratio: f64,
    /// Regions below this approximate size skip the full scan check.
    pub check_approximate_size: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            policy: SplitPolicy::Half,
            threshold_size: 64 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            size_ratio: 0.5,
            keys_number: 131_072,
            keys_ratio: 0.5,
            check_approximate_size: 48 * 1024 * 1024,
        }
    }
}

/// Timestamp provider retry and reclamation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsProviderConfig {
    /// Timestamps fetched per coordinator round-trip.
    pub batch_size: u32,
    pub send_retry_num: u32,
    pub max_retry_num: u32,
    pub renew_max_retry_num: u32,
    pub clean_dead_interval_ms: u64,
    pub batch_ts_stale_interval_ms: u64,
}

impl Default for TsProviderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            send_retry_num: 8,
            max_retry_num: 16,
            renew_max_retry_num: 16,
            clean_dead_interval_ms: 3000,
            batch_ts_stale_interval_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub enable_auto_split: bool,
    /// Allow split/merge for mono-store regions.
    pub enable_split_and_merge_for_lite: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            enable_auto_split: true,
            enable_split_and_merge_for_lite: false,
        }
    }
}

/// Scan session server-side limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Idle sessions are reclaimed after this interval.
    pub session_ttl_ms: u64,
    /// Default batch size when the request does not carry one.
    pub default_batch_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: 60_000,
            default_batch_size: 1024,
        }
    }
}

/// Runtime-mutable flags, updated by explicit mutator RPCs only.
#[derive(Debug)]
pub struct AtomicOptions {
    enable_auto_split: AtomicBool,
    enable_split_and_merge_for_lite: AtomicBool,
    cluster_read_only: AtomicBool,
}

impl AtomicOptions {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            enable_auto_split: AtomicBool::new(config.region.enable_auto_split),
            enable_split_and_merge_for_lite: AtomicBool::new(
                config.region.enable_split_and_merge_for_lite,
            ),
            cluster_read_only: AtomicBool::new(false),
        }
    }

    pub fn enable_auto_split(&self) -> bool {
        self.enable_auto_split.load(Ordering::Acquire)
    }

    pub fn set_enable_auto_split(&self, v: bool) {
        self.enable_auto_split.store(v, Ordering::Release);
    }

    pub fn enable_split_and_merge_for_lite(&self) -> bool {
        self.enable_split_and_merge_for_lite.load(Ordering::Acquire)
    }

    pub fn set_enable_split_and_merge_for_lite(&self, v: bool) {
        self.enable_split_and_merge_for_lite.store(v, Ordering::Release);
    }

    pub fn cluster_read_only(&self) -> bool {
        self.cluster_read_only.load(Ordering::Acquire)
    }

    pub fn set_cluster_read_only(&self, v: bool) {
        self.cluster_read_only.store(v, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_valid() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.ts_provider.batch_size, 100);
        assert_eq!(config.split.policy, SplitPolicy::Half);
        assert!(config.region.enable_auto_split);
    }

    #[test]
    fn test_section_override() {
        let raw = r#"
            [split]
            policy = "KEYS"
            threshold_size = 8388608
            chunk_size = 262144
            size_ratio = 0.5
            keys_number = 1000
            keys_ratio = 0.8
            check_approximate_size = 4194304

            [ts_provider]
            batch_size = 32
            send_retry_num = 8
            max_retry_num = 16
            renew_max_retry_num = 16
            clean_dead_interval_ms = 3000
            batch_ts_stale_interval_ms = 3000
        "#;
        let config = CoreConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.split.policy, SplitPolicy::Keys);
        assert_eq!(config.split.keys_number, 1000);
        assert_eq!(config.ts_provider.batch_size, 32);
    }

    #[test]
    fn test_atomic_options() {
        let opts = AtomicOptions::from_config(&CoreConfig::default());
        assert!(opts.enable_auto_split());
        assert!(!opts.cluster_read_only());
        opts.set_cluster_read_only(true);
        opts.set_enable_auto_split(false);
        assert!(opts.cluster_read_only());
        assert!(!opts.enable_auto_split());
    }
}
