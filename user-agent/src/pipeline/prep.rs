//! Prep queue: per-bucket FIFOs of raw records awaiting correlation.
//!
//! Records are bucketed by the pid that issued them. Bucket `b` is drained
//! only by worker `b % workers`, which is what keeps records of one pid in
//! kernel order across the whole correlation stage.
//!
//! A fork is queued under its parent, behind the parent's earlier records.
//! Until it has been correlated the child is marked as held, and workers
//! park the child's records instead of correlating them ahead of the fork.

use crate::comms::events::{Pid, RawRecord};
use crate::pipeline::{buckets::Buckets, ingest::Ack, stats::PrepStats};
use crossbeam::sync::{Parker, Unparker};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

pub struct PrepItem {
    pub raw: RawRecord,
    pub ack: Option<Arc<Ack>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// The bucket was at capacity; counted as a drop.
    Full,
    /// The bucket could not be locked before the deadline.
    Busy,
}

pub struct PrepQueue {
    buckets:    Buckets<VecDeque<PrepItem>>,
    per_bucket: usize,
    wakers:     Vec<Unparker>,
    /// Children with a queued fork that is not yet correlated, with the
    /// number of such forks.
    held:       Buckets<HashMap<Pid, usize>>,
    stats:      Arc<PrepStats>,
}

impl PrepQueue {
    /// Returns the queue and one parker per worker, in worker order.
    pub fn new(buckets: usize, per_bucket: usize, workers: usize, stats: Arc<PrepStats>) -> (Self, Vec<Parker>) {
        let parkers: Vec<Parker> = (0..workers.max(1)).map(|_| Parker::new()).collect();
        let wakers = parkers.iter().map(|p| p.unparker().clone()).collect();
        let queue = Self {
            buckets: Buckets::new(buckets, |_| VecDeque::new()),
            per_bucket,
            wakers,
            held: Buckets::new(buckets, |_| HashMap::new()),
            stats,
        };
        (queue, parkers)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn worker_count(&self) -> usize {
        self.wakers.len()
    }

    pub fn stats(&self) -> &PrepStats {
        &self.stats
    }

    pub fn submit(&self, item: PrepItem, deadline: Instant) -> Submit {
        let child = item.raw.forked_child();
        if let Some(child) = child {
            let Some(mut h) = self.held.acquire_until(self.held.assign(&child), deadline) else {
                return Submit::Busy;
            };
            *h.entry(child).or_insert(0) += 1;
        }
        let id = self.buckets.assign(&item.raw.pid);
        let queued = match self.buckets.acquire_until(id, deadline) {
            None => Submit::Busy,
            Some(b) if b.len() >= self.per_bucket => {
                self.stats.drop.incr();
                Submit::Full
            }
            Some(mut b) => {
                b.push_back(item);
                Submit::Queued
            }
        };
        if queued != Submit::Queued {
            if let Some(child) = child {
                self.release(child);
            }
            return queued;
        }
        self.stats.received.incr();
        self.wakers[self.owner(id)].unpark();
        Submit::Queued
    }

    fn owner(&self, bucket: usize) -> usize {
        bucket % self.wakers.len()
    }

    /// Whether records of `pid` must wait for a fork still in the queue.
    pub fn is_held(&self, pid: Pid) -> bool {
        let h = self.held.acquire(self.held.assign(&pid));
        h.contains_key(&pid)
    }

    /// The fork announcing `child` has been correlated or abandoned. Wakes
    /// the worker that owns the child's records.
    pub fn release(&self, child: Pid) {
        {
            let mut h = self.held.acquire(self.held.assign(&child));
            if let Some(n) = h.get_mut(&child) {
                *n -= 1;
                if *n == 0 {
                    h.remove(&child);
                }
            }
        }
        self.wakers[self.owner(self.buckets.assign(&child))].unpark();
    }

    /// Take everything queued in bucket `id`. A contended bucket is skipped
    /// and counted; its owner comes back to it on the next pass.
    pub fn take(&self, id: usize) -> Option<VecDeque<PrepItem>> {
        let Some(mut b) = self.buckets.try_acquire(id) else {
            self.stats.bktskip.incr();
            return None;
        };
        if b.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *b))
    }

    pub fn wake_all(&self) {
        for w in &self.wakers {
            w.unpark();
        }
    }

    pub fn pending(&self) -> usize {
        self.buckets.total_occupancy()
    }

    pub fn max_bucket_occupancy(&self) -> usize {
        self.buckets.max_occupancy()
    }

    /// Children currently held behind a queued fork.
    pub fn held(&self) -> usize {
        self.held.total_occupancy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::{RecordPayload, Subject};
    use chrono::Utc;
    use std::time::Duration;

    fn item(pid: Pid, payload: RecordPayload) -> PrepItem {
        PrepItem {
            raw: RawRecord { pid, ts: Utc::now(), subject: Subject::default(), authorize: false, payload },
            ack: None,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn fork_is_queued_under_parent_and_holds_child() {
        let (q, _parkers) = PrepQueue::new(8, 4, 2, Arc::new(PrepStats::default()));
        assert_eq!(q.submit(item(10, RecordPayload::Fork { child: 11 }), soon()), Submit::Queued);
        let parent_bucket = q.buckets.assign(&10);
        assert_eq!(q.buckets.occupancy(parent_bucket), 1);
        assert!(q.is_held(11));
        assert!(!q.is_held(10));

        q.release(11);
        assert!(!q.is_held(11));
        assert_eq!(q.held(), 0);
    }

    #[test]
    fn refused_fork_does_not_hold_child() {
        let (q, _parkers) = PrepQueue::new(1, 1, 1, Arc::new(PrepStats::default()));
        assert_eq!(q.submit(item(1, RecordPayload::Exit { status: 0 }), soon()), Submit::Queued);
        assert_eq!(q.submit(item(1, RecordPayload::Fork { child: 2 }), soon()), Submit::Full);
        assert!(!q.is_held(2));
        assert_eq!(q.stats().drop.get(), 1);
    }

    #[test]
    fn repeated_forks_of_one_child_are_counted() {
        let (q, _parkers) = PrepQueue::new(4, 8, 1, Arc::new(PrepStats::default()));
        q.submit(item(1, RecordPayload::Fork { child: 5 }), soon());
        q.submit(item(1, RecordPayload::Fork { child: 5 }), soon());
        q.release(5);
        assert!(q.is_held(5));
        q.release(5);
        assert!(!q.is_held(5));
    }
}
