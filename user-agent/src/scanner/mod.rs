//! Enrichment stage: hashes, code signatures and preload verdicts for every
//! executable image, each behind its own identity cache.

pub mod cache;
pub mod codesign;
pub mod hash;
pub mod preload;

use crate::comms::events::{FileStamp, ImageFile};
use crate::config::model::{Config, HashAlgorithm};
use crate::pipeline::{
    model::{Enrichment, ImageEnrichment, ImageExecRecord},
    stats::CacheStats,
};
use cache::{CacheKey, IdentityCache};
use chrono::DateTime;
use codesign::{CodeSignature, SignatureVerifier};
use hash::Hashes;
use log::Level;
use preload::PreloadVerdict;
use std::{
    collections::BTreeSet,
    fs::Metadata,
    os::unix::fs::MetadataExt,
    path::Path,
    sync::Arc,
};

/// Kernel-style stat of a file from local metadata.
pub fn stamp(meta: &Metadata) -> FileStamp {
    let ts = |secs: i64, nsec: i64| DateTime::from_timestamp(secs, u32::try_from(nsec).unwrap_or(0));
    FileStamp {
        dev:   meta.dev(),
        ino:   meta.ino(),
        mode:  meta.mode(),
        uid:   meta.uid(),
        gid:   meta.gid(),
        size:  meta.size(),
        mtime: ts(meta.mtime(), meta.mtime_nsec()),
        ctime: ts(meta.ctime(), meta.ctime_nsec()),
        btime: None,
    }
}

/// Counters of the three caches.
#[derive(Debug, Default)]
pub struct EnricherStats {
    pub hash: Arc<CacheStats>,
    pub csig: Arc<CacheStats>,
    pub ldpl: Arc<CacheStats>,
}

pub struct Enricher {
    algs:           BTreeSet<HashAlgorithm>,
    codesign:       bool,
    omit_platform:  bool,
    hashes:         IdentityCache<Arc<Hashes>>,
    csig:           IdentityCache<Arc<CodeSignature>>,
    ldpl:           IdentityCache<PreloadVerdict>,
    verifier:       Arc<dyn SignatureVerifier>,
}

impl Enricher {
    pub fn new(cfg: &Config, verifier: Arc<dyn SignatureVerifier>, stats: &EnricherStats) -> Self {
        let c = &cfg.caches;
        Self {
            algs:          cfg.output.hashes.clone(),
            codesign:      cfg.output.codesign,
            omit_platform: cfg.output.omit_platform_hashes,
            hashes:        IdentityCache::new("hash", c.hash.buckets, c.hash.capacity, Arc::clone(&stats.hash)),
            csig:          IdentityCache::new("csig", c.csig.buckets, c.csig.capacity, Arc::clone(&stats.csig)),
            ldpl:          IdentityCache::new("ldpl", c.ldpl.buckets, c.ldpl.capacity, Arc::clone(&stats.ldpl)),
            verifier,
        }
    }

    /// Fill the record's enrichment. A record enriched twice keeps the first result.
    pub fn enrich(&self, rec: &ImageExecRecord) {
        if rec.enrichment().is_some() {
            return;
        }
        let image = self.image(&rec.image);
        let script = rec.script.as_ref().map(|s| self.image(s));
        let effective_preload = image
            .preload
            .map(|v| preload::effective_preload(&rec.env, v))
            .unwrap_or_default();
        let _ = rec.enrichment.set(Enrichment { image, script, effective_preload });
    }

    /// Acquire an image ahead of its exec record; results land in the caches.
    pub fn prefetch(&self, img: &ImageFile) {
        let _ = self.image(img);
    }

    pub fn cache_sizes(&self) -> [(&'static str, usize, usize); 3] {
        [
            (self.hashes.name(), self.hashes.len(), self.hashes.capacity()),
            (self.csig.name(), self.csig.len(), self.csig.capacity()),
            (self.ldpl.name(), self.ldpl.len(), self.ldpl.capacity()),
        ]
    }

    fn image(&self, img: &ImageFile) -> ImageEnrichment {
        let Some(stat) = &img.stat else {
            return ImageEnrichment { error: Some("image was not stat'ed".into()), ..Default::default() };
        };
        let key = CacheKey::from(stat);
        let path = Path::new(&img.path);
        let mut error = None;

        let codesign = if self.codesign {
            match self.csig.get_or_compute(key, || self.verifier.verify(path).map(Arc::new)) {
                Ok((sig, _)) => Some(sig),
                Err(e) => {
                    error.get_or_insert_with(|| format!("codesign: {e}"));
                    None
                }
            }
        } else {
            None
        };

        let platform = codesign.as_ref().is_some_and(|c| c.is_platform());
        let hashes = if self.algs.is_empty() || (self.omit_platform && platform) {
            None
        } else {
            match self.hashes.get_or_compute(key, || hash::hash_file(path, &self.algs, &key).map(Arc::new)) {
                Ok((h, _)) => Some(h),
                Err(e) => {
                    error.get_or_insert_with(|| format!("hash: {e}"));
                    None
                }
            }
        };

        let preload = match self.ldpl.get_or_compute(key, || preload::scan(path, stat)) {
            Ok((v, _)) => Some(v),
            Err(e) => {
                error.get_or_insert_with(|| format!("ldpl: {e}"));
                None
            }
        };

        if let Some(e) = &error {
            hostmon_log!(Level::Debug, "enrich", "{}: {}", img.path, e);
        }
        ImageEnrichment { hashes, codesign, preload, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::Subject;
    use crate::scanner::codesign::SignOrigin;
    use chrono::Utc;
    use std::{io, io::Write, sync::OnceLock};
    use tempfile::NamedTempFile;

    struct PlatformEverything;

    impl SignatureVerifier for PlatformEverything {
        fn verify(&self, _path: &Path) -> io::Result<CodeSignature> {
            let mut sig = CodeSignature::unsigned();
            sig.origin = Some(SignOrigin::Platform);
            Ok(sig)
        }
    }

    fn record(f: &NamedTempFile) -> ImageExecRecord {
        let stat = stamp(&f.as_file().metadata().unwrap());
        ImageExecRecord {
            id: 1,
            pid: 10,
            ts: Utc::now(),
            fork_ts: None,
            subject: Subject::default(),
            image: ImageFile { path: f.path().to_string_lossy().into_owned(), stat: Some(stat) },
            script: None,
            argv: vec![],
            env: vec![],
            cwd: None,
            prev: None,
            reconstructed: false,
            enrichment: OnceLock::new(),
        }
    }

    fn tmp() -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn enrich_fills_every_part_once() {
        let cfg = Config::default();
        let stats = EnricherStats::default();
        let e = Enricher::new(&cfg, Arc::new(codesign::SystemImageVerifier), &stats);
        let f = tmp();
        let rec = record(&f);
        e.enrich(&rec);
        let en = rec.enrichment().unwrap();
        assert!(en.image.hashes.as_ref().unwrap().sha256.is_some());
        assert_eq!(en.image.preload, Some(PreloadVerdict::Script));
        assert!(en.image.error.is_none());

        // second record for the same file generation is served from cache
        let again = record(&f);
        e.enrich(&again);
        assert_eq!(stats.hash.hits.get(), 1);
        assert_eq!(stats.hash.puts.get(), 1);
    }

    #[test]
    fn platform_images_skip_hashing_when_configured() {
        let mut cfg = Config::default();
        cfg.output.omit_platform_hashes = true;
        let stats = EnricherStats::default();
        let e = Enricher::new(&cfg, Arc::new(PlatformEverything), &stats);
        let f = tmp();
        let rec = record(&f);
        e.enrich(&rec);
        assert!(rec.enrichment().unwrap().image.hashes.is_none());
        assert_eq!(stats.hash.gets.get(), 0);
    }

    #[test]
    fn missing_stat_is_reported() {
        let e = Enricher::new(&Config::default(), Arc::new(codesign::SystemImageVerifier), &EnricherStats::default());
        let f = tmp();
        let mut rec = record(&f);
        rec.image.stat = None;
        e.enrich(&rec);
        assert!(rec.enrichment().unwrap().image.error.is_some());
    }
}
