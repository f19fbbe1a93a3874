//! Ring router
//! ===========
//! *Single* blocking thread that drains the kernel's memory ring, decodes
//! each `KernelRecord`, converts it to a [`RawRecord`] and hands it to the
//! [`KernelHook`]. This thread is the hook thread: it is the only caller of
//! `on_kernel_event` and therefore observes records in kernel order.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use log::Level;
use prost::Message;
use shared::events::KernelRecord;

use crate::comms::{
    events::{RawRecord, RecordError},
    memory_ring::{MemoryRing, RingError},
    KernelHook,
};
use crate::pipeline::ingest::Decision;

/// Totals reported when the router stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterTotals {
    pub records: u64,
    pub allow:   u64,
    pub deny:    u64,
    pub defer:   u64,
    pub bad:     u64,
}

pub struct RingRouter {
    ring: MemoryRing,
    poll: Duration,
}

impl RingRouter {
    pub fn new(ring: MemoryRing, poll: Duration) -> Self {
        Self { ring, poll }
    }

    /// Drain the ring until `stop` is raised, then drain what is left once.
    pub fn run(&self, hook: &dyn KernelHook, stop: &AtomicBool) -> RouterTotals {
        hostmon_log!(Level::Info, "router", "ring router started ({} byte ring)", self.ring.capacity());
        let mut totals = RouterTotals::default();
        loop {
            let stopping = stop.load(Ordering::Acquire);
            let drained = self.drain(hook, &mut totals);
            if stopping {
                break;
            }
            if drained == 0 {
                thread::sleep(self.poll);
            }
        }
        hostmon_log!(Level::Info, "router", "ring router stopped: {:?}", totals);
        totals
    }

    /// Process every record currently published; returns how many were seen.
    pub fn drain(&self, hook: &dyn KernelHook, totals: &mut RouterTotals) -> usize {
        let mut seen = 0;
        loop {
            let buf = match self.ring.next() {
                Ok(Some(buf)) => buf,
                Ok(None) => return seen,
                Err(RingError::Corrupt { len, offset }) => {
                    hostmon_log!(Level::Error, "router", "corrupt ring record (len {} @ {})", len, offset);
                    totals.bad += 1;
                    continue;
                }
                Err(e) => {
                    hostmon_log!(Level::Error, "router", "ring read failed: {}", e);
                    return seen;
                }
            };
            seen += 1;
            totals.records += 1;
            let raw = KernelRecord::decode(&*buf)
                .map_err(RecordError::from)
                .and_then(RawRecord::try_from);
            match raw {
                Ok(raw) => match hook.on_kernel_event(raw) {
                    Decision::Allow => totals.allow += 1,
                    Decision::Deny => totals.deny += 1,
                    Decision::Defer => totals.defer += 1,
                },
                Err(e) => {
                    totals.bad += 1;
                    hook.on_bad_record(&e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::events::{kernel_record::Payload, ExitPayload, RecordKind};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        pids: Mutex<Vec<i32>>,
        bad:  Mutex<u32>,
    }

    impl KernelHook for Recorder {
        fn on_kernel_event(&self, raw: RawRecord) -> Decision {
            self.pids.lock().unwrap().push(raw.pid);
            Decision::Allow
        }

        fn on_bad_record(&self, _err: &RecordError) {
            *self.bad.lock().unwrap() += 1;
        }
    }

    fn exit(pid: i32) -> Vec<u8> {
        KernelRecord {
            kind: RecordKind::Exit as i32,
            pid,
            payload: Some(Payload::Exit(ExitPayload { status: 0 })),
            ..Default::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn drains_in_ring_order_and_counts_garbage() {
        let dir = tempdir().unwrap();
        let ring = MemoryRing::create(&dir.path().join("ring"), 1024).unwrap();
        assert!(ring.push(&exit(3)));
        assert!(ring.push(&[0xff, 0xff, 0xff]));
        assert!(ring.push(&exit(4)));

        let router = RingRouter::new(ring, Duration::from_millis(1));
        let hook = Recorder::default();
        let mut totals = RouterTotals::default();
        assert_eq!(router.drain(&hook, &mut totals), 3);
        assert_eq!(*hook.pids.lock().unwrap(), vec![3, 4]);
        assert_eq!(*hook.bad.lock().unwrap(), 1);
        assert_eq!(totals.allow, 2);
        assert_eq!(totals.bad, 1);
    }
}
