//! Kernel ingest: the admission decision.
//!
//! `on_kernel_event` runs on the hook thread and never takes longer than the
//! decision budget (plus scheduling noise). When the rest of the pipeline
//! cannot take the record in time the answer is `Defer`, never `Deny`: the
//! kernel goes ahead and the gap is counted.

use crate::comms::events::{Pid, RawRecord};
use crate::pipeline::{
    buckets::Buckets,
    prep::{PrepItem, PrepQueue, Submit},
    stats::IngestStats,
};
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    Defer,
}

/// One-shot acknowledgement from enrichment to a waiting hook call.
#[derive(Debug, Default)]
pub struct Ack {
    done: Mutex<bool>,
    cv:   Condvar,
}

impl Ack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if completed before `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = self
                .cv
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

pub struct Ingest {
    prep:    Arc<PrepQueue>,
    pending: Buckets<HashMap<Pid, Arc<Ack>>>,
    budget:  Duration,
    stats:   Arc<IngestStats>,
}

impl Ingest {
    pub fn new(prep: Arc<PrepQueue>, pending_buckets: usize, budget: Duration, stats: Arc<IngestStats>) -> Self {
        Self { prep, pending: Buckets::new(pending_buckets, |_| HashMap::new()), budget, stats }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn on_kernel_event(&self, raw: RawRecord) -> Decision {
        self.stats.visitors.incr();
        match panic::catch_unwind(AssertUnwindSafe(|| self.admit(raw))) {
            Ok(d) => d,
            Err(_) => {
                self.stats.fatal.incr();
                self.stats.defer.incr();
                Decision::Defer
            }
        }
    }

    pub fn on_bad_record(&self) {
        self.stats.visitors.incr();
        self.stats.error.incr();
    }

    fn defer(&self, missed: bool) -> Decision {
        if missed {
            self.stats.missed.incr();
        }
        self.stats.defer.incr();
        Decision::Defer
    }

    fn admit(&self, raw: RawRecord) -> Decision {
        let deadline = Instant::now() + self.budget;
        let pid = raw.pid;
        let wants_ack = raw.wants_ack();

        let ack = if wants_ack {
            let Some(mut p) = self.pending.acquire_until(self.pending.assign(&pid), deadline) else {
                return self.defer(true);
            };
            if p.contains_key(&pid) {
                // prior decision for this pid still outstanding
                drop(p);
                return self.defer(true);
            }
            let ack = Arc::new(Ack::new());
            p.insert(pid, Arc::clone(&ack));
            Some(ack)
        } else {
            None
        };

        match self.prep.submit(PrepItem { raw, ack: ack.clone() }, deadline) {
            Submit::Queued => {}
            Submit::Full | Submit::Busy => {
                if ack.is_some() {
                    self.forget(pid);
                }
                return self.defer(true);
            }
        }

        let Some(ack) = ack else {
            self.stats.allow.incr();
            return Decision::Allow;
        };
        let acked = ack.wait_until(deadline);
        self.forget(pid);
        if acked {
            self.stats.allow.incr();
            Decision::Allow
        } else {
            self.stats.timeout.incr();
            self.defer(false)
        }
    }

    fn forget(&self, pid: Pid) {
        let mut p = self.pending.acquire(self.pending.assign(&pid));
        p.remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::{ExecInfo, ImageFile, RecordPayload, Subject};
    use crate::pipeline::stats::PrepStats;
    use chrono::Utc;
    use std::thread;

    fn exec(pid: Pid, authorize: bool) -> RawRecord {
        RawRecord {
            pid,
            ts: Utc::now(),
            subject: Subject::default(),
            authorize,
            payload: RecordPayload::Exec(ExecInfo {
                image: ImageFile { path: "/bin/true".into(), stat: None },
                ..Default::default()
            }),
        }
    }

    fn ingest(per_bucket: usize, budget_ms: u64) -> (Ingest, Arc<PrepQueue>) {
        let (prep, _parkers) = PrepQueue::new(1, per_bucket, 1, Arc::new(PrepStats::default()));
        let prep = Arc::new(prep);
        let ing = Ingest::new(Arc::clone(&prep), 4, Duration::from_millis(budget_ms), Arc::new(IngestStats::default()));
        (ing, prep)
    }

    #[test]
    fn plain_records_are_allowed_once_queued() {
        let (ing, prep) = ingest(8, 5);
        assert_eq!(ing.on_kernel_event(exec(1, false)), Decision::Allow);
        assert_eq!(prep.pending(), 1);
        assert_eq!(ing.stats().allow.get(), 1);
    }

    #[test]
    fn full_bucket_defers_and_counts() {
        let (ing, prep) = ingest(1, 5);
        assert_eq!(ing.on_kernel_event(exec(1, false)), Decision::Allow);
        assert_eq!(ing.on_kernel_event(exec(2, false)), Decision::Defer);
        assert_eq!(ing.stats().missed.get(), 1);
        assert_eq!(prep.stats().drop.get(), 1);
    }

    #[test]
    fn unacknowledged_exec_times_out_to_defer() {
        let (ing, _prep) = ingest(8, 2);
        let started = Instant::now();
        assert_eq!(ing.on_kernel_event(exec(1, true)), Decision::Defer);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(ing.stats().timeout.get(), 1);
        assert_eq!(ing.stats().missed.get(), 0);
    }

    #[test]
    fn acknowledged_exec_is_allowed() {
        let (ing, prep) = ingest(8, 2_000);
        let ing = Arc::new(ing);
        let waiter = {
            let ing = Arc::clone(&ing);
            thread::spawn(move || ing.on_kernel_event(exec(7, true)))
        };
        let item = loop {
            if let Some(mut items) = prep.take(0) {
                break items.pop_front().unwrap();
            }
            thread::yield_now();
        };
        item.ack.unwrap().complete();
        assert_eq!(waiter.join().unwrap(), Decision::Allow);
    }

    #[test]
    fn second_authorization_for_pending_pid_defers() {
        let (ing, prep) = ingest(8, 300);
        let ing = Arc::new(ing);
        let first = {
            let ing = Arc::clone(&ing);
            thread::spawn(move || ing.on_kernel_event(exec(9, true)))
        };
        while prep.pending() == 0 {
            thread::yield_now();
        }
        assert_eq!(ing.on_kernel_event(exec(9, true)), Decision::Defer);
        assert_eq!(first.join().unwrap(), Decision::Defer);
        assert_eq!(ing.stats().timeout.get(), 1);
        assert_eq!(ing.stats().missed.get(), 1);
    }
}
