//! Arena of image exec records.
//!
//! Records refer to their predecessor by [`ExecId`] instead of by pointer.
//! Each entry is reference counted: one reference per live process whose
//! current image it is and one per younger record naming it as `prev`.
//! Releasing the last reference frees the entry and releases its `prev`,
//! iteratively, so long chains unwind without recursion.

use crate::pipeline::{
    buckets::Buckets,
    model::{ExecId, ImageExecRecord},
    PipelineError,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

struct Entry {
    record: Arc<ImageExecRecord>,
    refs:   usize,
}

pub struct ExecArena {
    entries: Buckets<HashMap<ExecId, Entry>>,
    next_id: AtomicU64,
}

impl ExecArena {
    pub fn new(buckets: usize) -> Self {
        Self { entries: Buckets::new(buckets, |_| HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Allocate an id, build the record and store it with one reference held
    /// by the caller. The record's `prev` gains a reference.
    pub fn insert(&self, build: impl FnOnce(ExecId) -> ImageExecRecord) -> Arc<ImageExecRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(build(id));
        if let Some(prev) = record.prev {
            self.retain(prev);
        }
        let mut b = self.entries.acquire(self.entries.assign(&id));
        b.insert(id, Entry { record: Arc::clone(&record), refs: 1 });
        record
    }

    pub fn get(&self, id: ExecId) -> Option<Arc<ImageExecRecord>> {
        let b = self.entries.acquire(self.entries.assign(&id));
        b.get(&id).map(|e| Arc::clone(&e.record))
    }

    /// Add a reference. `false` if the record is already gone.
    pub fn retain(&self, id: ExecId) -> bool {
        let mut b = self.entries.acquire(self.entries.assign(&id));
        match b.get_mut(&id) {
            Some(e) => {
                e.refs += 1;
                true
            }
            None => false,
        }
    }

    pub fn release(&self, id: ExecId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let mut b = self.entries.acquire(self.entries.assign(&id));
            let Some(e) = b.get_mut(&id) else { return };
            e.refs -= 1;
            if e.refs == 0 {
                next = b.remove(&id).and_then(|e| e.record.prev);
            }
        }
    }

    /// Walk predecessors of `start`, nearest first, at most `limit` entries.
    /// Stops at records of pid 0 and below. A predecessor that is not older
    /// than its successor is an invariant violation.
    pub fn ancestry(
        &self,
        start: Option<ExecId>,
        limit: usize,
    ) -> Result<Vec<Arc<ImageExecRecord>>, PipelineError> {
        let mut chain = Vec::new();
        let mut cursor = start;
        let mut bound = ExecId::MAX;
        while let Some(id) = cursor {
            if chain.len() >= limit {
                break;
            }
            if id >= bound {
                return Err(PipelineError::AncestryCycle { at: id, successor: bound });
            }
            let Some(rec) = self.get(id) else { break };
            if rec.pid <= 0 {
                break;
            }
            bound = id;
            cursor = rec.prev;
            chain.push(rec);
        }
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.entries.total_occupancy()
    }
}
