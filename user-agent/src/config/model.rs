// src/config/model.rs

use serde::{Deserialize, Deserializer};
use std::{collections::BTreeSet, net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

/// Top-level runtime config. Built once at startup and shared read-only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
    pub logging:  LoggingConfig,
    pub pipeline: PipelineConfig,
    pub caches:   CachesConfig,
    pub output:   OutputConfig,
    pub suppress: SuppressConfig,
    pub kernel:   KernelConfig,
    pub metrics:  MetricsConfig,
}

/// Mirror of the `[logging]` table (agent diagnostics, not audit output)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enable: bool,
    pub file:   Option<String>,
    pub level:  String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: "INFO".into() }
    }
}

/// Sizing of the bucketed stages and queues.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub prep_buckets:         usize,
    pub prep_bucket_capacity: usize,
    pub pending_buckets:      usize,
    pub workers:              usize,
    pub work_queue_capacity:  usize,
    pub log_queue_capacity:   usize,
    pub arena_buckets:        usize,
    /// Upper bound on the time the kernel hook may be held.
    pub decision_budget:      HumanDuration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prep_buckets:         64,
            prep_bucket_capacity: 256,
            pending_buckets:      16,
            workers:              4,
            work_queue_capacity:  4_096,
            log_queue_capacity:   8_192,
            arena_buckets:        64,
            decision_budget:      HumanDuration(Duration::from_millis(5)),
        }
    }
}

/// Bucket count and total slot budget of one enrichment cache.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheSizing {
    pub buckets:  usize,
    pub capacity: usize,
}

impl Default for CacheSizing {
    fn default() -> Self {
        Self { buckets: 64, capacity: 4_096 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CachesConfig {
    pub hash: CacheSizing,
    pub csig: CacheSizing,
    pub ldpl: CacheSizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatKind {
    Json,
}

/// What ends up in each audit record.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Free-form sensor identifier echoed in the ops event.
    pub id:                   Option<String>,
    pub hashes:               BTreeSet<HashAlgorithm>,
    pub codesign:             bool,
    pub ancestors:            AncestorLimit,
    pub resolve_users_groups: bool,
    pub omit_mode:            bool,
    pub omit_size:            bool,
    pub omit_mtime:           bool,
    pub omit_ctime:           bool,
    pub omit_btime:           bool,
    pub omit_sid:             bool,
    pub omit_groups:          bool,
    pub omit_platform_hashes: bool,
    pub format:               LogFormatKind,
    /// `stdout` (or `-`), otherwise a file path opened in append mode.
    pub destination:          String,
    pub flush_interval:       HumanDuration,
    pub batch_size:           usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            id:                   None,
            hashes:               BTreeSet::from([HashAlgorithm::Sha256]),
            codesign:             true,
            ancestors:            AncestorLimit(16),
            resolve_users_groups: true,
            omit_mode:            false,
            omit_size:            false,
            omit_mtime:           false,
            omit_ctime:           false,
            omit_btime:           false,
            omit_sid:             false,
            omit_groups:          false,
            omit_platform_hashes: false,
            format:               LogFormatKind::Json,
            destination:          "stdout".into(),
            flush_interval:       HumanDuration(Duration::from_millis(250)),
            batch_size:           1_000,
        }
    }
}

/// Rules evaluated at dispatch time; a match is counted, not logged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SuppressConfig {
    pub image_exec_by_ident:               BTreeSet<String>,
    pub image_exec_by_path:                BTreeSet<String>,
    pub image_exec_by_ancestor_ident:      BTreeSet<String>,
    pub image_exec_by_ancestor_path:       BTreeSet<String>,
    pub process_access_by_subject_ident:   BTreeSet<String>,
    pub process_access_by_subject_path:    BTreeSet<String>,
    pub socket_op_localhost:               bool,
    pub socket_op_by_subject_ident:        BTreeSet<String>,
    pub socket_op_by_subject_path:         BTreeSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub ring_path:     PathBuf,
    pub poll_interval: HumanDuration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ring_path:     PathBuf::from(shared::constants::DEFAULT_RING_PATH),
            poll_interval: HumanDuration(Duration::from_millis(2)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint; disabled when absent.
    pub listen:         Option<SocketAddr>,
    pub stats_interval: HumanDuration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { listen: None, stats_interval: HumanDuration(Duration::from_secs(300)) }
    }
}

/// A duration written the human way in TOML (`"5ms"`, `"5m"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn get(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(de)?;
        humantime::parse_duration(&raw)
            .map(HumanDuration)
            .map_err(|e| serde::de::Error::custom(ConfigError::InvalidDuration(raw, e)))
    }
}

/// Maximum ancestry depth logged; `"unlimited"` in TOML maps to `usize::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncestorLimit(pub usize);

impl AncestorLimit {
    pub const UNLIMITED: AncestorLimit = AncestorLimit(usize::MAX);

    pub fn is_unlimited(self) -> bool {
        self.0 == usize::MAX
    }
}

impl<'de> Deserialize<'de> for AncestorLimit {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Depth(usize),
            Word(String),
        }
        match Raw::deserialize(de)? {
            Raw::Depth(n) => Ok(AncestorLimit(n)),
            Raw::Word(w) if w.eq_ignore_ascii_case("unlimited") => Ok(AncestorLimit::UNLIMITED),
            Raw::Word(w) => Err(serde::de::Error::custom(format!(
                "invalid ancestors '{w}': expected a depth or \"unlimited\""
            ))),
        }
    }
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
