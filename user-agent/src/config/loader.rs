// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the TOML file, deserializes it into `Config` and rejects sizings the
//! pipeline cannot run with.

use crate::config::model::{Config, ConfigError};
use log::Level;
use std::{fs, path::Path};

/// Load, parse and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    hostmon_log!(Level::Debug, "config", "Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let mut cfg = parse(&txt)?;
    cfg.source = Some(path.to_path_buf());
    hostmon_log!(Level::Info, "config", "Loaded config from {:?}", path);
    Ok(cfg)
}

/// Parse and validate configuration text.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(txt)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let p = &cfg.pipeline;
    let c = &cfg.caches;
    let nonzero = [
        ("pipeline.prep_buckets", p.prep_buckets),
        ("pipeline.prep_bucket_capacity", p.prep_bucket_capacity),
        ("pipeline.pending_buckets", p.pending_buckets),
        ("pipeline.workers", p.workers),
        ("pipeline.work_queue_capacity", p.work_queue_capacity),
        ("pipeline.log_queue_capacity", p.log_queue_capacity),
        ("pipeline.arena_buckets", p.arena_buckets),
        ("caches.hash.buckets", c.hash.buckets),
        ("caches.hash.capacity", c.hash.capacity),
        ("caches.csig.buckets", c.csig.buckets),
        ("caches.csig.capacity", c.csig.capacity),
        ("caches.ldpl.buckets", c.ldpl.buckets),
        ("caches.ldpl.capacity", c.ldpl.capacity),
        ("output.batch_size", cfg.output.batch_size),
    ];
    if let Some((field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
        return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
    }
    if p.workers > p.prep_buckets {
        return Err(ConfigError::Invalid {
            field: "pipeline.workers",
            reason: format!("{} workers for {} prep buckets", p.workers, p.prep_buckets),
        });
    }
    if p.decision_budget.get().is_zero() {
        return Err(ConfigError::Invalid {
            field: "pipeline.decision_budget",
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}
