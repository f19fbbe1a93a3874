// tests/common/mod.rs
#![allow(dead_code)]

use agent::comms::events::{ExecInfo, ImageFile, Pid, RawRecord, RecordPayload, Subject};
use agent::config::model::{HashAlgorithm, HumanDuration};
use agent::config::Config;
use agent::output::format::{render_record, JsonFormat, LogFormat};
use agent::output::{EventCode, LogEvent, LogQueue};
use agent::pipeline::{Monitor, MonitorStats};
use agent::scanner::{codesign::SystemImageVerifier, stamp};
use chrono::Utc;
use std::{collections::BTreeSet, fs, path::Path, sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Defaults with a generous decision budget so slow CI never times out.
pub fn config(workers: usize, buckets: usize) -> Config {
    let mut cfg = Config::default();
    cfg.pipeline.workers = workers;
    cfg.pipeline.prep_buckets = buckets;
    cfg.pipeline.decision_budget = HumanDuration(Duration::from_secs(5));
    cfg.output.hashes = BTreeSet::from([HashAlgorithm::Md5, HashAlgorithm::Sha256]);
    cfg.output.resolve_users_groups = false;
    cfg
}

pub struct Harness {
    pub monitor: Monitor,
    pub stats:   Arc<MonitorStats>,
    rx:          mpsc::Receiver<LogEvent>,
}

impl Harness {
    pub fn start(cfg: &Config) -> Self {
        let stats = Arc::new(MonitorStats::default());
        let (log, rx) = LogQueue::new(cfg.pipeline.log_queue_capacity, Arc::clone(&stats.log));
        let monitor = Monitor::start(cfg, Arc::new(SystemImageVerifier), log, Arc::clone(&stats))
            .expect("monitor failed to start");
        Self { monitor, stats, rx }
    }

    /// Drain the pipeline and return every record that reached the log queue.
    pub fn finish(self) -> (Vec<LogEvent>, Arc<MonitorStats>) {
        let Harness { monitor, stats, mut rx } = self;
        monitor.shutdown().expect("pipeline failed");
        drop(monitor);
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        (out, stats)
    }
}

pub fn image(path: &Path) -> ImageFile {
    let meta = fs::metadata(path).expect("stat");
    ImageFile { path: path.display().to_string(), stat: Some(stamp(&meta)) }
}

pub fn unstated(path: &str) -> ImageFile {
    ImageFile { path: path.into(), stat: None }
}

pub fn record(pid: Pid, authorize: bool, payload: RecordPayload) -> RawRecord {
    RawRecord { pid, ts: Utc::now(), subject: Subject::default(), authorize, payload }
}

pub fn exec(pid: Pid, image: ImageFile, authorize: bool, interpreter_pending: bool) -> RawRecord {
    let argv = vec![image.path.clone()];
    record(pid, authorize, RecordPayload::Exec(ExecInfo {
        image,
        argv,
        env: Vec::new(),
        cwd: Some("/".into()),
        interpreter_pending,
    }))
}

pub fn json(ev: &LogEvent) -> serde_json::Value {
    let mut f = JsonFormat::new();
    render_record(&ev.tree, &mut f, None).expect("render");
    serde_json::from_slice(&f.take()).expect("valid json")
}

pub fn of_code(events: &[LogEvent], code: EventCode) -> Vec<serde_json::Value> {
    events.iter().filter(|e| e.code == code).map(json).collect()
}
