//! Dispatch: suppression rules and record building, on a single thread.

use crate::config::model::SuppressConfig;
use crate::output::{Handlers, LogQueue};
use crate::pipeline::{
    model::{Event, EventBody, ImageExecRecord, ProcessRef},
    queue::WorkQueue,
    stats::{Counter, DispatchStats},
};
use log::Level;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Evaluates the configured suppression rules. A suppressed event is counted
/// under the first rule that matched and never reaches the log.
pub struct Suppressor {
    rules: SuppressConfig,
    stats: Arc<DispatchStats>,
}

fn ident_in(set: &BTreeSet<String>, rec: &ImageExecRecord) -> bool {
    !set.is_empty() && rec.ident().is_some_and(|id| set.contains(id))
}

fn path_in(set: &BTreeSet<String>, rec: &ImageExecRecord) -> bool {
    set.contains(&rec.image.path) || rec.script.as_ref().is_some_and(|s| set.contains(&s.path))
}

fn hit(c: &Counter) -> bool {
    c.incr();
    true
}

impl Suppressor {
    pub fn new(rules: &SuppressConfig, stats: Arc<DispatchStats>) -> Self {
        Self { rules: rules.clone(), stats }
    }

    pub fn suppressed(&self, ev: &Event) -> bool {
        let r = &self.rules;
        let s = &self.stats;
        match &ev.body {
            EventBody::ImageExec(snap) => {
                let rec = &snap.record;
                if ident_in(&r.image_exec_by_ident, rec) {
                    return hit(&s.supp_image_exec_by_ident);
                }
                if path_in(&r.image_exec_by_path, rec) {
                    return hit(&s.supp_image_exec_by_path);
                }
                if snap.ancestors.iter().any(|a| ident_in(&r.image_exec_by_ancestor_ident, a)) {
                    return hit(&s.supp_image_exec_by_ancestor_ident);
                }
                if snap.ancestors.iter().any(|a| path_in(&r.image_exec_by_ancestor_path, a)) {
                    return hit(&s.supp_image_exec_by_ancestor_path);
                }
                false
            }
            EventBody::ProcessAccess { subject, .. } => self.by_subject(
                subject,
                (&r.process_access_by_subject_ident, &s.supp_process_access_by_subject_ident),
                (&r.process_access_by_subject_path, &s.supp_process_access_by_subject_path),
            ),
            EventBody::Socket { subject, info, .. } => {
                if r.socket_op_localhost && info.is_localhost() {
                    return hit(&s.supp_socket_op_localhost);
                }
                self.by_subject(
                    subject,
                    (&r.socket_op_by_subject_ident, &s.supp_socket_op_by_subject_ident),
                    (&r.socket_op_by_subject_path, &s.supp_socket_op_by_subject_path),
                )
            }
            EventBody::FileAccess { .. } | EventBody::ServiceAdd { .. } => false,
        }
    }

    fn by_subject(
        &self,
        subject: &ProcessRef,
        (idents, by_ident): (&BTreeSet<String>, &Counter),
        (paths, by_path): (&BTreeSet<String>, &Counter),
    ) -> bool {
        let Some(img) = subject.image.as_deref() else { return false };
        if ident_in(idents, img) {
            return hit(by_ident);
        }
        if path_in(paths, img) {
            return hit(by_path);
        }
        false
    }
}

pub struct Dispatcher {
    work:       Arc<WorkQueue<Event>>,
    suppressor: Suppressor,
    handlers:   Handlers,
    log:        LogQueue,
    stats:      Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        work: Arc<WorkQueue<Event>>,
        suppressor: Suppressor,
        handlers: Handlers,
        log: LogQueue,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self { work, suppressor, handlers, log, stats }
    }

    /// Returns `true` if a record was handed to the log queue.
    pub fn dispatch(&self, ev: &Event) -> bool {
        self.stats.dispatched.incr();
        let per_kind = match &ev.body {
            EventBody::ImageExec(_) => &self.stats.image_exec,
            EventBody::ProcessAccess { .. } => &self.stats.process_access,
            EventBody::FileAccess { .. } => &self.stats.file_access,
            EventBody::Socket { .. } => &self.stats.socket_op,
            EventBody::ServiceAdd { .. } => &self.stats.service_add,
        };
        per_kind.incr();
        if self.suppressor.suppressed(ev) {
            return false;
        }
        self.log.offer(self.handlers.build(ev))
    }

    /// Loop until `stop` is raised and the work queue is empty. Raise `stop`
    /// only once nothing can offer to the work queue anymore.
    pub fn run(&self, stop: &AtomicBool) {
        loop {
            match self.work.take(Duration::from_millis(50)) {
                Ok(Some(ev)) => {
                    self.dispatch(&ev);
                }
                Ok(None) if stop.load(Ordering::Acquire) => break,
                Ok(None) => {}
                Err(e) => {
                    hostmon_log!(Level::Warn, "dispatch", "work queue closed: {}", e);
                    break;
                }
            }
        }
        hostmon_log!(Level::Debug, "dispatch", "dispatcher exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::{ImageFile, SocketInfo, SocketOp, Subject};
    use crate::config::model::OutputConfig;
    use crate::output::Value;
    use crate::pipeline::{model::ExecSnapshot, stats::QueueStats};
    use chrono::Utc;
    use std::{net::IpAddr, sync::OnceLock};

    fn rec(id: u64, path: &str) -> Arc<ImageExecRecord> {
        Arc::new(ImageExecRecord {
            id,
            pid: 1,
            ts: Utc::now(),
            fork_ts: None,
            subject: Subject::default(),
            image: ImageFile { path: path.into(), stat: None },
            script: None,
            argv: Vec::new(),
            env: Vec::new(),
            cwd: None,
            prev: None,
            reconstructed: false,
            enrichment: OnceLock::new(),
        })
    }

    fn exec(path: &str, ancestors: &[&str]) -> Event {
        Event {
            ts: Utc::now(),
            body: EventBody::ImageExec(ExecSnapshot {
                record: rec(10, path),
                ancestors: ancestors.iter().enumerate().map(|(i, p)| rec(i as u64, p)).collect(),
            }),
        }
    }

    fn socket(subject_path: &str, local: &str, peer: &str) -> Event {
        Event {
            ts: Utc::now(),
            body: EventBody::Socket {
                subject: ProcessRef {
                    pid: 1,
                    subject: Subject::default(),
                    image: Some(rec(1, subject_path)),
                    ancestors: Vec::new(),
                    reconstructed: false,
                },
                op: SocketOp::Connect,
                info: SocketInfo {
                    protocol: 6,
                    sock_addr: Some(local.parse::<IpAddr>().unwrap()),
                    sock_port: 5000,
                    peer_addr: Some(peer.parse::<IpAddr>().unwrap()),
                    peer_port: 80,
                },
            },
        }
    }

    #[test]
    fn image_exec_rules() {
        let mut rules = SuppressConfig::default();
        rules.image_exec_by_path.insert("/usr/bin/true".into());
        rules.image_exec_by_ancestor_path.insert("/usr/sbin/cron".into());
        let stats = Arc::new(DispatchStats::default());
        let s = Suppressor::new(&rules, Arc::clone(&stats));

        assert!(s.suppressed(&exec("/usr/bin/true", &[])));
        assert!(s.suppressed(&exec("/bin/ls", &["/bin/sh", "/usr/sbin/cron"])));
        assert!(!s.suppressed(&exec("/bin/ls", &["/bin/sh"])));
        assert_eq!(stats.supp_image_exec_by_path.get(), 1);
        assert_eq!(stats.supp_image_exec_by_ancestor_path.get(), 1);
    }

    #[test]
    fn socket_rules() {
        let mut rules = SuppressConfig { socket_op_localhost: true, ..Default::default() };
        rules.socket_op_by_subject_path.insert("/usr/bin/ssh".into());
        let stats = Arc::new(DispatchStats::default());
        let s = Suppressor::new(&rules, Arc::clone(&stats));

        assert!(s.suppressed(&socket("/bin/nc", "127.0.0.1", "127.0.0.1")));
        assert!(s.suppressed(&socket("/usr/bin/ssh", "10.0.0.1", "10.0.0.2")));
        assert!(!s.suppressed(&socket("/bin/nc", "10.0.0.1", "10.0.0.2")));
        assert_eq!(stats.supp_socket_op_localhost.get(), 1);
        assert_eq!(stats.supp_socket_op_by_subject_path.get(), 1);
    }

    #[test]
    fn dispatcher_counts_and_forwards() {
        let mut rules = SuppressConfig::default();
        rules.image_exec_by_path.insert("/usr/bin/true".into());
        let stats = Arc::new(DispatchStats::default());
        let work = Arc::new(WorkQueue::new(8, Arc::new(QueueStats::default())));
        let (log, mut rx) = LogQueue::new(8, Arc::new(QueueStats::default()));
        let d = Dispatcher::new(
            Arc::clone(&work),
            Suppressor::new(&rules, Arc::clone(&stats)),
            Handlers::new(&OutputConfig::default()),
            log,
            Arc::clone(&stats),
        );

        work.offer(exec("/usr/bin/true", &[]));
        work.offer(exec("/bin/ls", &[]));
        let stop = AtomicBool::new(true);
        d.run(&stop);

        assert_eq!(stats.dispatched.get(), 2);
        assert_eq!(stats.image_exec.get(), 2);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.tree.get("image").and_then(|i| i.get("path")), Some(&Value::from("/bin/ls")));
        assert!(rx.try_recv().is_err());
    }
}
