// src/pipeline/mod.rs
//! The monitoring pipeline.
//!
//! ```text
//! hook thread ─► Ingest ─► PrepQueue ─► workers (correlate, enrich) ─► WorkQueue
//!                                                                      │
//!                  LogQueue ◄─ dispatcher (suppress, build records) ◄─┘
//! ```
//!
//! [`Monitor`] wires the stages together and is the [`KernelHook`] handed to
//! the ring router.

pub mod arena;
pub mod buckets;
pub mod correlation;
pub mod dispatch;
pub mod ingest;
pub mod model;
pub mod prep;
pub mod queue;
pub mod stats;
pub mod worker;

use crate::comms::{
    events::{RawRecord, RecordError},
    KernelHook,
};
use crate::config::Config;
use crate::output::{Handlers, LogQueue, WriterStats};
use crate::scanner::{codesign::SignatureVerifier, Enricher, EnricherStats};
use chrono::Utc;
use log::Level;
use serde_json::{json, Value as Json};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;

use self::{
    arena::ExecArena,
    correlation::Correlator,
    dispatch::{Dispatcher, Suppressor},
    ingest::{Decision, Ingest},
    model::{Event, ExecId},
    prep::PrepQueue,
    queue::WorkQueue,
    stats::{DispatchStats, IngestStats, PrepStats, QueueStats},
    worker::{WorkerHandle, WorkerShared},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ancestry of exec {successor} reaches exec {at}, which is not older")]
    AncestryCycle { at: ExecId, successor: ExecId },

    #[error("worker panicked")]
    WorkerPanic,

    #[error("cannot spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Every counter of the pipeline. Stages hold clones of the parts they bump.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub ingest:   Arc<IngestStats>,
    pub prep:     Arc<PrepStats>,
    pub work:     Arc<QueueStats>,
    pub dispatch: Arc<DispatchStats>,
    pub log:      Arc<QueueStats>,
    pub writer:   Arc<WriterStats>,
    pub caches:   EnricherStats,
}

pub struct Monitor {
    cfg:        Config,
    ingest:     Ingest,
    prep:       Arc<PrepQueue>,
    correlator: Arc<Correlator>,
    enricher:   Arc<Enricher>,
    work:       Arc<WorkQueue<Event>>,
    log:        LogQueue,
    handlers:   Handlers,
    stats:      Arc<MonitorStats>,
    stop:       Arc<AtomicBool>,
    /// Raised only once every worker has been joined.
    dstop:      Arc<AtomicBool>,
    workers:    Mutex<Vec<WorkerHandle>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Build every stage, start the worker and dispatcher threads and log the
    /// `start` ops record. `log` must count into `stats.log`.
    pub fn start(
        cfg: &Config,
        verifier: Arc<dyn SignatureVerifier>,
        log: LogQueue,
        stats: Arc<MonitorStats>,
    ) -> Result<Self, PipelineError> {
        let p = &cfg.pipeline;
        let handlers = Handlers::new(&cfg.output);
        log.offer(handlers.agent_ops("start", cfg, Utc::now()));

        let arena = Arc::new(ExecArena::new(p.arena_buckets));
        let (prep, parkers) = PrepQueue::new(p.prep_buckets, p.prep_bucket_capacity, p.workers, Arc::clone(&stats.prep));
        let prep = Arc::new(prep);
        let correlator = Arc::new(Correlator::new(
            p.prep_buckets,
            arena,
            cfg.output.ancestors.0,
            Arc::clone(&stats.prep),
        ));
        let enricher = Arc::new(Enricher::new(cfg, verifier, &stats.caches));
        let work = Arc::new(WorkQueue::new(p.work_queue_capacity, Arc::clone(&stats.work)));
        let ingest = Ingest::new(Arc::clone(&prep), p.pending_buckets, p.decision_budget.get(), Arc::clone(&stats.ingest));
        let stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(WorkerShared {
            prep:       Arc::clone(&prep),
            correlator: Arc::clone(&correlator),
            enricher:   Arc::clone(&enricher),
            work:       Arc::clone(&work),
            ingest:     Arc::clone(&stats.ingest),
            stop:       Arc::clone(&stop),
            idle:       Duration::from_millis(100),
        });
        let workers = worker::spawn_workers(shared, parkers)?;

        let dispatcher = Dispatcher::new(
            Arc::clone(&work),
            Suppressor::new(&cfg.suppress, Arc::clone(&stats.dispatch)),
            handlers.clone(),
            log.clone(),
            Arc::clone(&stats.dispatch),
        );
        let dstop = Arc::new(AtomicBool::new(false));
        let dispatcher = {
            let dstop = Arc::clone(&dstop);
            thread::Builder::new()
                .name("dispatch".into())
                .spawn(move || dispatcher.run(&dstop))?
        };

        hostmon_log!(
            Level::Info,
            "pipeline",
            "started: {} worker(s), {} prep bucket(s), budget {:?}",
            p.workers,
            p.prep_buckets,
            p.decision_budget.get()
        );

        Ok(Self {
            cfg: cfg.clone(),
            ingest,
            prep,
            correlator,
            enricher,
            work,
            log,
            handlers,
            stats,
            stop,
            dstop,
            workers: Mutex::new(workers),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn stats(&self) -> &Arc<MonitorStats> {
        &self.stats
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Point-in-time view of every counter and gauge. Counters are read one by
    /// one; sums across sections may be off by in-flight records.
    pub fn snapshot(&self) -> Json {
        let s = &self.stats;
        let ps = &s.prep;
        let cache = |(name, size, cap): (&str, usize, usize), c: &stats::CacheStats| {
            (
                format!("{name}_cache"),
                json!({
                    "size": size,
                    "capacity": cap,
                    "get": c.gets.get(),
                    "hit": c.hits.get(),
                    "miss": c.misses.get(),
                    "put": c.puts.get(),
                    "inv": c.invalids.get(),
                    "evict": c.evictions.get(),
                    "uncached": c.uncached.get(),
                }),
            )
        };
        let mut snap = json!({
            "ingest": &*s.ingest,
            "prep_queue": {
                "buckets": self.prep.bucket_count(),
                "bucketmax": self.prep.max_bucket_occupancy(),
                "size": self.prep.pending(),
                "received": ps.received.get(),
                "processed": ps.processed.get(),
                "lookup": ps.lookup.get(),
                "miss": ps.miss.get(),
                "drop": ps.drop.get(),
                "bktskip": ps.bktskip.get(),
                "parked": ps.parked.get(),
                "held": self.prep.held(),
            },
            "procmon": {
                "live": self.correlator.live_processes(),
                "images": self.correlator.arena().len(),
                "pid_reuse": ps.pid_reuse.get(),
                "reconstructed": ps.reconstructed.get(),
                "retired": ps.retired_procs.get(),
                "miss": {
                    "bypid": ps.miss_bypid.get(),
                    "forksubj": ps.miss_forksubj.get(),
                    "execsubj": ps.miss_execsubj.get(),
                    "execinterp": ps.miss_execinterp.get(),
                    "chdirsubj": ps.miss_chdirsubj.get(),
                },
            },
            "work_queue": {
                "capacity": self.work.capacity(),
                "size": self.work.len(),
                "delivered": s.work.delivered.get(),
                "drop": s.work.drops.get(),
            },
            "dispatch": &*s.dispatch,
            "log_queue": {
                "size": self.log.len(),
                "delivered": s.log.delivered.get(),
                "drop": s.log.drops.get(),
                "writer": &*s.writer,
            },
        });
        let caches = [&s.caches.hash, &s.caches.csig, &s.caches.ldpl];
        if let Json::Object(map) = &mut snap {
            for (sizes, c) in self.enricher.cache_sizes().into_iter().zip(caches) {
                let (k, v) = cache(sizes, &**c);
                map.insert(k, v);
            }
        }
        snap
    }

    /// Log a stats record and publish the same numbers as metrics.
    pub fn report_stats(&self) {
        let snap = self.snapshot();
        stats::publish_metrics(&snap);
        self.log.offer(self.handlers.agent_stats(&snap, Utc::now()));
    }

    /// Stop the workers and dispatcher after they drained, then log the `stop`
    /// ops record. The ring router must already be stopped. Returns the first
    /// worker failure, if any.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        self.stop.store(true, Ordering::Release);
        self.prep.wake_all();

        let mut first = Ok(());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for w in workers {
            let res = w.join().unwrap_or(Err(PipelineError::WorkerPanic));
            if let Err(e) = res {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        // workers are gone, so nothing more reaches the work queue
        self.dstop.store(true, Ordering::Release);
        if let Some(d) = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if d.join().is_err() {
                hostmon_log!(Level::Error, "pipeline", "dispatcher panicked");
            }
        }

        if first.is_err() {
            hostmon_log!(Level::Error, "pipeline", "stats at failure: {}", self.snapshot());
        }
        self.report_stats();
        self.log.offer(self.handlers.agent_ops("stop", &self.cfg, Utc::now()));
        hostmon_log!(Level::Info, "pipeline", "stopped");
        first
    }
}

impl KernelHook for Monitor {
    fn on_kernel_event(&self, raw: RawRecord) -> Decision {
        self.ingest.on_kernel_event(raw)
    }

    fn on_bad_record(&self, err: &RecordError) {
        hostmon_log!(Level::Debug, "ingest", "undecodable record: {}", err);
        self.ingest.on_bad_record();
    }
}
