//! Correlation workers.
//!
//! Worker `w` owns every prep bucket `b` with `b % workers == w`, so records
//! of one pid are always handled by the same thread in submission order.
//! Records of a child whose fork is still queued elsewhere are parked, in
//! order, and replayed once the fork has been correlated.

use crate::comms::events::Pid;
use crate::pipeline::{
    correlation::{Correlator, Outcome},
    model::{Event, EventBody},
    prep::{PrepItem, PrepQueue},
    queue::WorkQueue,
    stats::IngestStats,
    PipelineError,
};
use crate::scanner::Enricher;
use crossbeam::sync::Parker;
use log::Level;
use std::{
    collections::{HashMap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Everything a worker touches.
pub struct WorkerShared {
    pub prep:       Arc<PrepQueue>,
    pub correlator: Arc<Correlator>,
    pub enricher:   Arc<Enricher>,
    pub work:       Arc<WorkQueue<Event>>,
    pub ingest:     Arc<IngestStats>,
    pub stop:       Arc<AtomicBool>,
    /// Longest park between passes when nothing was queued.
    pub idle:       Duration,
}

pub type WorkerHandle = JoinHandle<Result<(), PipelineError>>;

/// One thread per parker. Workers drain their buckets once more after `stop`
/// is raised and then exit.
pub fn spawn_workers(shared: Arc<WorkerShared>, parkers: Vec<Parker>) -> io::Result<Vec<WorkerHandle>> {
    parkers
        .into_iter()
        .enumerate()
        .map(|(idx, parker)| {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("prep-{idx}"))
                .spawn(move || run(idx, &shared, &parker))
        })
        .collect()
}

fn run(idx: usize, sh: &WorkerShared, parker: &Parker) -> Result<(), PipelineError> {
    let workers = sh.prep.worker_count();
    let mine: Vec<usize> = (idx..sh.prep.bucket_count()).step_by(workers).collect();
    hostmon_log!(Level::Debug, "worker", "worker {} owns {} bucket(s)", idx, mine.len());

    let mut out = Vec::new();
    let mut parked: HashMap<Pid, VecDeque<PrepItem>> = HashMap::new();
    loop {
        let stopping = sh.stop.load(Ordering::Acquire);
        let mut handled = 0usize;

        let ready: Vec<Pid> = parked.keys().copied().filter(|pid| !sh.prep.is_held(*pid)).collect();
        for pid in ready {
            let Some(items) = parked.remove(&pid) else { continue };
            let mut items = items.into_iter();
            while let Some(item) = items.next() {
                handled += 1;
                if let Err(e) = handle(sh, item, &mut out) {
                    return fail(idx, sh, e, items, parked, &mine);
                }
            }
        }

        for &b in &mine {
            let Some(items) = sh.prep.take(b) else { continue };
            let mut items = items.into_iter();
            while let Some(item) = items.next() {
                let pid = item.raw.pid;
                if parked.contains_key(&pid) || sh.prep.is_held(pid) {
                    sh.prep.stats().parked.incr();
                    parked.entry(pid).or_default().push_back(item);
                    continue;
                }
                handled += 1;
                if let Err(e) = handle(sh, item, &mut out) {
                    return fail(idx, sh, e, items, parked, &mine);
                }
            }
        }

        if handled == 0 {
            // parked children are released by the worker holding their fork
            if stopping && parked.is_empty() {
                return Ok(());
            }
            parker.park_timeout(sh.idle);
        }
    }
}

fn handle(sh: &WorkerShared, item: PrepItem, out: &mut Vec<Outcome>) -> Result<(), PipelineError> {
    let child = item.raw.forked_child();
    let res = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), PipelineError> {
        out.clear();
        sh.correlator.process(item, out)?;
        for o in out.drain(..) {
            finish(sh, o);
        }
        Ok(())
    }));
    if let Some(child) = child {
        sh.prep.release(child);
    }
    res.unwrap_or(Err(PipelineError::WorkerPanic))
}

fn finish(sh: &WorkerShared, outcome: Outcome) {
    match outcome {
        Outcome::Exec { snapshot, ack } => {
            sh.enricher.enrich(&snapshot.record);
            if let Some(ack) = ack {
                ack.complete();
            }
            let ts = snapshot.record.ts;
            sh.work.offer(Event { ts, body: EventBody::ImageExec(snapshot) });
        }
        Outcome::Prefetch { image, ack } => {
            sh.enricher.prefetch(&image);
            ack.complete();
        }
        Outcome::Event(ev) => {
            sh.work.offer(ev);
        }
    }
}

fn fail(
    idx: usize,
    sh: &WorkerShared,
    err: PipelineError,
    rest: impl Iterator<Item = PrepItem>,
    parked: HashMap<Pid, VecDeque<PrepItem>>,
    mine: &[usize],
) -> Result<(), PipelineError> {
    sh.ingest.fatal.incr();
    hostmon_log!(Level::Error, "worker", "worker {} stopped: {}", idx, err);
    abandon(sh, rest);
    abandon(sh, parked.into_values().flatten());
    for &b in mine {
        if let Some(items) = sh.prep.take(b) {
            abandon(sh, items.into_iter());
        }
    }
    Err(err)
}

/// Records still in hand when a worker dies are dropped; waiting hooks are
/// released at once instead of running into their deadline, and so are
/// children held behind a dropped fork.
fn abandon(sh: &WorkerShared, rest: impl Iterator<Item = PrepItem>) {
    for item in rest {
        sh.prep.stats().drop.incr();
        if let Some(child) = item.raw.forked_child() {
            sh.prep.release(child);
        }
        if let Some(ack) = item.ack {
            ack.complete();
        }
    }
}
