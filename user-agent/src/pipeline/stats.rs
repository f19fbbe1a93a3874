// src/pipeline/stats.rs

//! Monotonic counters shared between the stages and the reporter.
//!
//! Every counter is an independent relaxed atomic. Snapshots serialize each
//! counter as it is read; they are not consistent across counters.

use serde::{Serialize, Serializer};
use serde_json::Value as Json;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for Counter {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.get())
    }
}

/// Admission decisions taken on the hook thread.
#[derive(Debug, Default, Serialize)]
pub struct IngestStats {
    pub visitors: Counter,
    pub allow:    Counter,
    pub deny:     Counter,
    pub defer:    Counter,
    pub timeout:  Counter,
    pub error:    Counter,
    pub fatal:    Counter,
    /// Records that never reached the prep queue.
    pub missed:   Counter,
}

/// Prep queue and correlation.
#[derive(Debug, Default, Serialize)]
pub struct PrepStats {
    pub received:        Counter,
    pub processed:       Counter,
    pub lookup:          Counter,
    pub miss:            Counter,
    pub drop:            Counter,
    pub bktskip:         Counter,
    /// Records set aside until the fork of their process was correlated.
    pub parked:          Counter,
    pub miss_bypid:      Counter,
    pub miss_forksubj:   Counter,
    pub miss_execsubj:   Counter,
    pub miss_execinterp: Counter,
    pub miss_chdirsubj:  Counter,
    pub pid_reuse:       Counter,
    pub reconstructed:   Counter,
    pub retired_procs:   Counter,
}

#[derive(Debug, Default, Serialize)]
pub struct CacheStats {
    pub gets:      Counter,
    pub hits:      Counter,
    pub misses:    Counter,
    pub puts:      Counter,
    pub invalids:  Counter,
    pub evictions: Counter,
    /// Computations not stored because the bucket had no evictable slot.
    pub uncached:  Counter,
}

/// Bounded hand-off. `delivered + drops` is the number of offers.
#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub delivered: Counter,
    pub drops:     Counter,
}

impl QueueStats {
    pub fn offered(&self) -> u64 {
        self.delivered.get() + self.drops.get()
    }
}

/// Dispatch counters, including one per suppression rule.
#[derive(Debug, Default, Serialize)]
pub struct DispatchStats {
    pub dispatched:                           Counter,
    pub image_exec:                           Counter,
    pub process_access:                       Counter,
    pub file_access:                          Counter,
    pub socket_op:                            Counter,
    pub service_add:                          Counter,
    pub supp_image_exec_by_ident:             Counter,
    pub supp_image_exec_by_path:              Counter,
    pub supp_image_exec_by_ancestor_ident:    Counter,
    pub supp_image_exec_by_ancestor_path:     Counter,
    pub supp_process_access_by_subject_ident: Counter,
    pub supp_process_access_by_subject_path:  Counter,
    pub supp_socket_op_localhost:             Counter,
    pub supp_socket_op_by_subject_ident:      Counter,
    pub supp_socket_op_by_subject_path:       Counter,
}

/// Publish every numeric leaf of a snapshot as a gauge named
/// `hostmon_<section>_<counter>`.
pub fn publish_metrics(snapshot: &Json) {
    fn walk(prefix: &str, v: &Json) {
        match v {
            Json::Object(map) => {
                for (k, v) in map {
                    walk(&format!("{prefix}_{k}"), v);
                }
            }
            Json::Number(n) => {
                if let Some(f) = n.as_f64() {
                    metrics::gauge!(prefix.to_owned()).set(f);
                }
            }
            _ => {}
        }
    }
    walk("hostmon", snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_serialize_as_plain_numbers() {
        let s = QueueStats::default();
        s.delivered.add(3);
        s.drops.incr();
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["delivered"], 3);
        assert_eq!(v["drops"], 1);
        assert_eq!(s.offered(), 4);
    }
}
