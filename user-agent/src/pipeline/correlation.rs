//! Correlation: rebuilds process lifecycles from partial kernel records.
//!
//! Per pid the lifecycle moves
//! `Unseen → Forked → Executing → Ready → Retired`, where `Executing` means
//! an exec is waiting for its interpreter record. A record that finds no
//! lifecycle for its pid synthesizes a placeholder flagged `reconstructed`
//! instead of waiting for data that will never come; every such lookup miss
//! is counted.
//!
//! Lock order is always lifecycle bucket, then arena bucket. At most one
//! lifecycle bucket is held at a time.

use crate::comms::events::{ExecInfo, ImageFile, Pid, RawRecord, RecordPayload, Subject};
use crate::pipeline::{
    arena::ExecArena,
    buckets::Buckets,
    ingest::Ack,
    model::{Event, EventBody, ExecId, ExecSnapshot, ImageExecRecord, ProcessRef},
    prep::PrepItem,
    stats::{Counter, PrepStats},
    PipelineError,
};
use chrono::{DateTime, Utc};
use log::trace;
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Forked,
    Executing,
    Ready,
}

struct PendingExec {
    ts:      DateTime<Utc>,
    subject: Subject,
    info:    ExecInfo,
}

pub struct ProcessLifecycle {
    pub pid:           Pid,
    pub ppid:          Option<Pid>,
    pub state:         LifecycleState,
    pub fork_ts:       Option<DateTime<Utc>>,
    pub cwd:           Option<String>,
    /// Current image; holds one arena reference.
    pub image:         Option<ExecId>,
    pub reconstructed: bool,
    pending:           Option<PendingExec>,
}

impl ProcessLifecycle {
    fn placeholder(pid: Pid) -> Self {
        Self {
            pid,
            ppid: None,
            state: LifecycleState::Ready,
            fork_ts: None,
            cwd: None,
            image: None,
            reconstructed: true,
            pending: None,
        }
    }
}

/// What a correlated record asks of the rest of the worker.
pub enum Outcome {
    /// Enrich the record, then complete the ack, then dispatch.
    Exec { snapshot: ExecSnapshot, ack: Option<Arc<Ack>> },
    /// Acquire the image of an exec still waiting for its interpreter, then ack.
    Prefetch { image: ImageFile, ack: Arc<Ack> },
    Event(Event),
}

pub struct Correlator {
    procs:     Buckets<HashMap<Pid, ProcessLifecycle>>,
    arena:     Arc<ExecArena>,
    ancestors: usize,
    stats:     Arc<PrepStats>,
}

type Procs = HashMap<Pid, ProcessLifecycle>;

impl Correlator {
    pub fn new(buckets: usize, arena: Arc<ExecArena>, ancestors: usize, stats: Arc<PrepStats>) -> Self {
        Self { procs: Buckets::new(buckets, |_| HashMap::new()), arena, ancestors, stats }
    }

    pub fn live_processes(&self) -> usize {
        self.procs.total_occupancy()
    }

    pub fn arena(&self) -> &ExecArena {
        &self.arena
    }

    /// State of `pid`, if it is known.
    pub fn state(&self, pid: Pid) -> Option<LifecycleState> {
        let b = self.procs.acquire(self.procs.assign(&pid));
        b.get(&pid).map(|lc| lc.state)
    }

    /// Apply one record. Records of the same pid must be passed in kernel order.
    pub fn process(&self, item: PrepItem, out: &mut Vec<Outcome>) -> Result<(), PipelineError> {
        let PrepItem { raw, ack } = item;
        trace!(target: "correlation", "pid {} {}", raw.pid, raw.kind_name());
        let RawRecord { pid, ts, subject, payload, .. } = raw;
        match payload {
            RecordPayload::Fork { child } => self.on_fork(pid, child, ts, subject, out)?,
            RecordPayload::Exec(info) => self.on_exec(pid, ts, subject, info, ack, out)?,
            RecordPayload::ExecInterpreter { image } => self.on_interpreter(pid, image, out)?,
            RecordPayload::Chdir { path } => self.on_chdir(pid, path, out)?,
            RecordPayload::Exit { .. } => self.on_exit(pid, out)?,
            RecordPayload::FileAccess { op, path, new_path } => {
                let subject = self.process_ref(pid, subject, out)?;
                out.push(Outcome::Event(Event {
                    ts,
                    body: EventBody::FileAccess { subject, op, path, new_path },
                }));
            }
            RecordPayload::ProcessAccess { object_pid, method } => {
                let subject = self.process_ref(pid, subject, out)?;
                let object = self.peek_ref(object_pid)?;
                out.push(Outcome::Event(Event {
                    ts,
                    body: EventBody::ProcessAccess { subject, object, method },
                }));
            }
            RecordPayload::Socket { op, info } => {
                let subject = self.process_ref(pid, subject, out)?;
                out.push(Outcome::Event(Event { ts, body: EventBody::Socket { subject, op, info } }));
            }
            RecordPayload::ServiceAdd(info) => {
                let subject = if info.no_subject {
                    None
                } else {
                    Some(self.process_ref(pid, subject, out)?)
                };
                out.push(Outcome::Event(Event { ts, body: EventBody::ServiceAdd { subject, info } }));
            }
        }
        self.stats.processed.incr();
        Ok(())
    }

    fn miss(&self, which: &Counter) {
        self.stats.miss.incr();
        which.incr();
    }

    fn synthesize(&self, pid: Pid) -> ProcessLifecycle {
        self.stats.reconstructed.incr();
        ProcessLifecycle::placeholder(pid)
    }

    /// Lifecycle of `pid` with any interpreter-less pending exec flushed,
    /// synthesized when missing.
    fn lifecycle<'a>(
        &self,
        procs: &'a mut Procs,
        pid: Pid,
        miss: &Counter,
        out: &mut Vec<Outcome>,
    ) -> Result<&'a mut ProcessLifecycle, PipelineError> {
        self.stats.lookup.incr();
        let lc = procs.entry(pid).or_insert_with(|| {
            self.miss(miss);
            self.synthesize(pid)
        });
        self.flush_pending(lc, out)?;
        Ok(lc)
    }

    fn flush_pending(&self, lc: &mut ProcessLifecycle, out: &mut Vec<Outcome>) -> Result<(), PipelineError> {
        if let Some(pending) = lc.pending.take() {
            self.miss(&self.stats.miss_execinterp);
            self.finalize_exec(lc, pending, None, None, out)?;
        }
        Ok(())
    }

    fn retire(&self, lc: ProcessLifecycle) {
        if let Some(img) = lc.image {
            self.arena.release(img);
        }
        self.stats.retired_procs.incr();
    }

    fn finalize_exec(
        &self,
        lc: &mut ProcessLifecycle,
        pending: PendingExec,
        interpreter: Option<ImageFile>,
        ack: Option<Arc<Ack>>,
        out: &mut Vec<Outcome>,
    ) -> Result<(), PipelineError> {
        let PendingExec { ts, subject, info } = pending;
        let (image, script) = match interpreter {
            Some(interp) => (interp, Some(info.image)),
            None => (info.image, None),
        };
        if info.cwd.is_some() {
            lc.cwd = info.cwd;
        }
        let prev = lc.image;
        let record = self.arena.insert(|id| ImageExecRecord {
            id,
            pid: lc.pid,
            ts,
            fork_ts: lc.fork_ts,
            subject,
            image,
            script,
            argv: info.argv,
            env: info.env,
            cwd: lc.cwd.clone(),
            prev,
            reconstructed: lc.reconstructed,
            enrichment: OnceLock::new(),
        });
        // the new record holds its own reference to `prev`
        if let Some(old) = lc.image.replace(record.id) {
            self.arena.release(old);
        }
        lc.state = LifecycleState::Ready;
        let ancestors = self.arena.ancestry(record.prev, self.ancestors)?;
        out.push(Outcome::Exec { snapshot: ExecSnapshot { record, ancestors }, ack });
        Ok(())
    }

    fn on_fork(
        &self,
        parent: Pid,
        child: Pid,
        ts: DateTime<Utc>,
        _subject: Subject,
        out: &mut Vec<Outcome>,
    ) -> Result<(), PipelineError> {
        self.stats.lookup.incr();
        let inherited = {
            let b = self.procs.acquire(self.procs.assign(&parent));
            b.get(&parent).map(|lc| {
                let image = lc.image.filter(|id| self.arena.retain(*id));
                (image, lc.cwd.clone())
            })
        };
        let (image, cwd, reconstructed) = match inherited {
            Some((image, cwd)) => (image, cwd, false),
            None => {
                self.miss(&self.stats.miss_forksubj);
                self.stats.reconstructed.incr();
                (None, None, true)
            }
        };

        let mut b = self.procs.acquire(self.procs.assign(&child));
        if let Some(mut stale) = b.remove(&child) {
            self.stats.pid_reuse.incr();
            self.flush_pending(&mut stale, out)?;
            self.retire(stale);
        }
        b.insert(child, ProcessLifecycle {
            pid: child,
            ppid: Some(parent),
            state: LifecycleState::Forked,
            fork_ts: Some(ts),
            cwd,
            image,
            reconstructed,
            pending: None,
        });
        Ok(())
    }

    fn on_exec(
        &self,
        pid: Pid,
        ts: DateTime<Utc>,
        subject: Subject,
        info: ExecInfo,
        ack: Option<Arc<Ack>>,
        out: &mut Vec<Outcome>,
    ) -> Result<(), PipelineError> {
        let mut b = self.procs.acquire(self.procs.assign(&pid));
        let lc = self.lifecycle(&mut b, pid, &self.stats.miss_execsubj, out)?;
        let pending = PendingExec { ts, subject, info };
        if !pending.info.interpreter_pending {
            return self.finalize_exec(lc, pending, None, ack, out);
        }
        lc.state = LifecycleState::Executing;
        if let Some(ack) = ack {
            out.push(Outcome::Prefetch { image: pending.info.image.clone(), ack });
        }
        lc.pending = Some(pending);
        Ok(())
    }

    fn on_interpreter(&self, pid: Pid, image: ImageFile, out: &mut Vec<Outcome>) -> Result<(), PipelineError> {
        self.stats.lookup.incr();
        let mut b = self.procs.acquire(self.procs.assign(&pid));
        let Some(lc) = b.get_mut(&pid) else {
            self.miss(&self.stats.miss_execinterp);
            return Ok(());
        };
        let Some(pending) = lc.pending.take() else {
            self.miss(&self.stats.miss_execinterp);
            return Ok(());
        };
        self.finalize_exec(lc, pending, Some(image), None, out)
    }

    fn on_chdir(&self, pid: Pid, path: String, out: &mut Vec<Outcome>) -> Result<(), PipelineError> {
        let mut b = self.procs.acquire(self.procs.assign(&pid));
        let lc = self.lifecycle(&mut b, pid, &self.stats.miss_chdirsubj, out)?;
        lc.cwd = Some(path);
        Ok(())
    }

    fn on_exit(&self, pid: Pid, out: &mut Vec<Outcome>) -> Result<(), PipelineError> {
        self.stats.lookup.incr();
        let mut b = self.procs.acquire(self.procs.assign(&pid));
        match b.remove(&pid) {
            Some(mut lc) => {
                self.flush_pending(&mut lc, out)?;
                self.retire(lc);
            }
            None => self.miss(&self.stats.miss_bypid),
        }
        Ok(())
    }

    fn process_ref(&self, pid: Pid, subject: Subject, out: &mut Vec<Outcome>) -> Result<ProcessRef, PipelineError> {
        let mut b = self.procs.acquire(self.procs.assign(&pid));
        let lc = self.lifecycle(&mut b, pid, &self.stats.miss_bypid, out)?;
        let image = lc.image.and_then(|id| self.arena.get(id));
        let ancestors = match &image {
            Some(img) => self.arena.ancestry(img.prev, self.ancestors)?,
            None => Vec::new(),
        };
        Ok(ProcessRef { pid, subject, image, ancestors, reconstructed: lc.reconstructed })
    }

    /// View of another process; never creates state in its bucket.
    fn peek_ref(&self, pid: Pid) -> Result<ProcessRef, PipelineError> {
        self.stats.lookup.incr();
        let b = self.procs.acquire(self.procs.assign(&pid));
        let Some(lc) = b.get(&pid) else {
            self.miss(&self.stats.miss_bypid);
            return Ok(ProcessRef {
                pid,
                subject: Subject::default(),
                image: None,
                ancestors: Vec::new(),
                reconstructed: true,
            });
        };
        let image = lc.image.and_then(|id| self.arena.get(id));
        let subject = image.as_ref().map(|i| i.subject.clone()).unwrap_or_default();
        let ancestors = match &image {
            Some(img) => self.arena.ancestry(img.prev, self.ancestors)?,
            None => Vec::new(),
        };
        Ok(ProcessRef { pid, subject, image, ancestors, reconstructed: lc.reconstructed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::{FileOp, FileStamp};

    fn correlator(limit: usize) -> Correlator {
        Correlator::new(8, Arc::new(ExecArena::new(8)), limit, Arc::new(PrepStats::default()))
    }

    fn item(pid: Pid, payload: RecordPayload) -> PrepItem {
        PrepItem {
            raw: RawRecord { pid, ts: Utc::now(), subject: Subject::default(), authorize: false, payload },
            ack: None,
        }
    }

    fn image(path: &str, ino: u64) -> ImageFile {
        ImageFile { path: path.into(), stat: Some(FileStamp { dev: 1, ino, size: 1, ..Default::default() }) }
    }

    fn exec(pid: Pid, path: &str, ino: u64, pending: bool) -> PrepItem {
        item(pid, RecordPayload::Exec(ExecInfo {
            image: image(path, ino),
            argv: vec![path.into()],
            interpreter_pending: pending,
            ..Default::default()
        }))
    }

    fn run(c: &Correlator, items: Vec<PrepItem>) -> Vec<Outcome> {
        let mut out = Vec::new();
        for i in items {
            c.process(i, &mut out).unwrap();
        }
        out
    }

    fn execs(out: &[Outcome]) -> Vec<&ExecSnapshot> {
        out.iter()
            .filter_map(|o| match o {
                Outcome::Exec { snapshot, .. } => Some(snapshot),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lifecycle_states_follow_records() {
        let c = correlator(8);
        run(&c, vec![item(1, RecordPayload::Fork { child: 100 })]);
        assert_eq!(c.state(100), Some(LifecycleState::Forked));
        run(&c, vec![exec(100, "/tmp/a.sh", 2, true)]);
        assert_eq!(c.state(100), Some(LifecycleState::Executing));
        run(&c, vec![item(100, RecordPayload::ExecInterpreter { image: image("/bin/sh", 1) })]);
        assert_eq!(c.state(100), Some(LifecycleState::Ready));
        run(&c, vec![item(100, RecordPayload::Exit { status: 0 })]);
        assert_eq!(c.state(100), None);
        assert_eq!(c.arena().len(), 0);
    }

    #[test]
    fn missing_interpreter_is_flushed_by_next_record() {
        let c = correlator(8);
        let out = run(&c, vec![
            item(1, RecordPayload::Fork { child: 5 }),
            exec(5, "/tmp/x.py", 3, true),
            item(5, RecordPayload::FileAccess { op: FileOp::Open, path: "/etc/hosts".into(), new_path: None }),
        ]);
        let e = execs(&out);
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].record.image.path, "/tmp/x.py");
        assert!(e[0].record.script.is_none());
        assert_eq!(c.stats.miss_execinterp.get(), 1);
        let Some(Outcome::Event(ev)) = out.last() else { panic!("no file event") };
        let EventBody::FileAccess { subject, .. } = &ev.body else { panic!("wrong body") };
        assert_eq!(subject.image.as_ref().unwrap().image.path, "/tmp/x.py");
    }

    #[test]
    fn pid_reuse_retires_the_old_process() {
        let c = correlator(8);
        let out = run(&c, vec![
            item(1, RecordPayload::Fork { child: 50 }),
            exec(50, "/usr/bin/old", 4, false),
            item(1, RecordPayload::Fork { child: 50 }),
            exec(50, "/usr/bin/new", 5, false),
        ]);
        assert_eq!(c.stats.pid_reuse.get(), 1);
        let e = execs(&out);
        assert_eq!(e.len(), 2);
        assert!(e[1].ancestors.iter().all(|a| a.image.path != "/usr/bin/old"));
        assert_eq!(c.arena().len(), 1);
    }

    #[test]
    fn ancestry_never_exceeds_limit() {
        let c = correlator(3);
        let mut items = Vec::new();
        for pid in 2..20 {
            items.push(item(pid - 1, RecordPayload::Fork { child: pid }));
            items.push(exec(pid, "/bin/step", pid as u64, false));
        }
        let out = run(&c, items);
        for snap in execs(&out) {
            assert!(snap.ancestors.len() <= 3);
            let mut last = snap.record.id;
            for a in &snap.ancestors {
                assert!(a.id < last);
                last = a.id;
            }
        }
    }

    #[test]
    fn process_access_does_not_create_object() {
        let c = correlator(8);
        let out = run(&c, vec![
            item(1, RecordPayload::Fork { child: 10 }),
            item(10, RecordPayload::ProcessAccess { object_pid: 77, method: "ptrace".into() }),
        ]);
        let Some(Outcome::Event(ev)) = out.last() else { panic!("no event") };
        let EventBody::ProcessAccess { object, .. } = &ev.body else { panic!("wrong body") };
        assert!(object.reconstructed);
        assert_eq!(c.state(77), None);
        assert_eq!(c.stats.miss_bypid.get(), 1);
    }
}
