// src/pipeline/queue.rs

//! Bounded FIFO hand-off between two stages.
//!
//! Producers never block: an offer either lands in the queue (`delivered`)
//! or is counted as a drop. Consumers block with a timeout so they can notice
//! shutdown.

use crate::pipeline::stats::QueueStats;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::{sync::Arc, time::Duration};

pub struct WorkQueue<T> {
    tx:       Sender<T>,
    rx:       Receiver<T>,
    capacity: usize,
    stats:    Arc<QueueStats>,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize, stats: Arc<QueueStats>) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx, capacity, stats }
    }

    /// Enqueue without blocking. Returns `false` when the item was dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.delivered.incr();
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.drops.incr();
                false
            }
        }
    }

    /// `Ok(None)` on timeout; `Err` once every producer is gone and the queue is empty.
    pub fn take(&self, timeout: Duration) -> Result<Option<T>, RecvTimeoutError> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_counted_not_grown() {
        let q = WorkQueue::new(2, Arc::new(QueueStats::default()));
        assert!(q.offer(1));
        assert!(q.offer(2));
        assert!(!q.offer(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_take(), Some(1));
        assert!(q.offer(4));
        let s = q.stats();
        assert_eq!(s.delivered.get(), 3);
        assert_eq!(s.drops.get(), 1);
        assert_eq!(s.offered(), 4);
    }

    #[test]
    fn take_times_out_when_idle() {
        let q: WorkQueue<u8> = WorkQueue::new(1, Arc::new(QueueStats::default()));
        assert_eq!(q.take(Duration::from_millis(1)).unwrap(), None);
    }
}
