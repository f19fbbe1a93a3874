//! Per-event-type record builders.
//!
//! Each builder turns a correlated [`Event`] into a [`Value`] tree. Every
//! record starts with the same header (`version`, `time`, `eventcode`).
//! Builders are pure, so the dispatch thread can run them without touching
//! the writer.

use crate::comms::events::{FileStamp, ImageFile, SocketInfo, SocketOp, Subject};
use crate::config::model::{Config, HashAlgorithm, OutputConfig, SuppressConfig};
use crate::output::{
    tree::{Dict, Value},
    EventCode, LogEvent,
};
use crate::pipeline::model::{Event, EventBody, ExecSnapshot, ImageEnrichment, ImageExecRecord, ProcessRef};
use crate::scanner::{codesign::SignResult, hash::Hashes};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Bumped whenever a field changes meaning.
pub const LOG_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct Handlers {
    cfg: OutputConfig,
}

impl Handlers {
    pub fn new(cfg: &OutputConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn build(&self, ev: &Event) -> LogEvent {
        match &ev.body {
            EventBody::ImageExec(snap) => self.image_exec(ev.ts, snap),
            EventBody::ProcessAccess { subject, object, method } => {
                let mut d = header(EventCode::ProcessAccess, ev.ts);
                d.put("method", method.as_str())
                    .put("object", self.process(object))
                    .put("subject", self.process(subject));
                LogEvent { code: EventCode::ProcessAccess, tree: d.build() }
            }
            EventBody::FileAccess { subject, op, path, new_path } => {
                let mut d = header(EventCode::FileAccess, ev.ts);
                d.put("op", op.as_str())
                    .put("path", path.as_str())
                    .put_opt("newpath", new_path.as_deref())
                    .put("subject", self.process(subject));
                LogEvent { code: EventCode::FileAccess, tree: d.build() }
            }
            EventBody::Socket { subject, op, info } => self.socket(ev.ts, subject, *op, info),
            EventBody::ServiceAdd { subject, info } => {
                let mut d = header(EventCode::ServiceAdd, ev.ts);
                let mut plist = Dict::new();
                plist.put("path", info.plist_path.as_str());
                let mut program = Dict::new();
                program.put_opt("rpath", info.program_rpath.as_deref());
                if !info.program_path.is_empty() {
                    program.put("path", info.program_path.as_str());
                }
                if !info.program_argv.is_empty() {
                    program.put("argv", strings(&info.program_argv));
                }
                d.put("plist", plist).put("program", program);
                if let (Some(subject), false) = (subject, info.no_subject) {
                    d.put("subject", self.process(subject));
                }
                LogEvent { code: EventCode::ServiceAdd, tree: d.build() }
            }
        }
    }

    /// `op` is `start` or `stop`.
    pub fn agent_ops(&self, op: &str, cfg: &Config, ts: DateTime<Utc>) -> LogEvent {
        let mut d = header(EventCode::AgentOps, ts);
        d.put("op", op);

        let mut build = Dict::new();
        build.put("name", env!("CARGO_PKG_NAME")).put("version", env!("CARGO_PKG_VERSION"));
        d.put("build", build);

        let out = &cfg.output;
        let mut c = Dict::new();
        c.put(
            "path",
            cfg.source.as_ref().map_or(Value::Null, |p| Value::Str(p.display().to_string())),
        );
        c.put("id", out.id.as_deref().map_or(Value::Null, Value::from));
        c.put("stats_interval", cfg.metrics.stats_interval.get().as_secs());
        c.put("hashes", hash_names(out));
        c.put("codesign", out.codesign);
        c.put("resolve_users_groups", out.resolve_users_groups);
        c.put("omit_mode", out.omit_mode)
            .put("omit_size", out.omit_size)
            .put("omit_mtime", out.omit_mtime)
            .put("omit_ctime", out.omit_ctime)
            .put("omit_btime", out.omit_btime)
            .put("omit_sid", out.omit_sid)
            .put("omit_groups", out.omit_groups)
            .put("omit_platform_hashes", out.omit_platform_hashes);
        if out.ancestors.is_unlimited() {
            c.put("ancestors", "unlimited");
        } else {
            c.put("ancestors", out.ancestors.0 as u64);
        }
        c.put("logfmt", "json").put("logdst", out.destination.as_str());
        suppress_counts(&mut c, &cfg.suppress);
        d.put("config", c);

        let mut sys = Dict::new();
        sys.put("name", std::env::consts::OS).put("arch", std::env::consts::ARCH);
        d.put("system", sys);
        LogEvent { code: EventCode::AgentOps, tree: d.build() }
    }

    /// Sections of a stats snapshot become top-level keys after the header.
    pub fn agent_stats(&self, snapshot: &serde_json::Value, ts: DateTime<Utc>) -> LogEvent {
        let mut d = header(EventCode::AgentStats, ts);
        d.extend(Value::from_json(snapshot));
        LogEvent { code: EventCode::AgentStats, tree: d.build() }
    }

    fn image_exec(&self, ts: DateTime<Utc>, snap: &ExecSnapshot) -> LogEvent {
        let rec = &snap.record;
        let en = rec.enrichment();
        let mut d = header(EventCode::ImageExec, ts);
        if rec.reconstructed {
            d.put("reconstructed", true);
        }
        d.put("argv", strings(&rec.argv));
        if !rec.env.is_empty() {
            d.put("env", strings(&rec.env));
        }
        d.put_opt("cwd", rec.cwd.as_deref());
        d.put("image", self.image(&rec.image, en.map(|e| &e.image)));
        if let Some(script) = &rec.script {
            d.put("script", self.image(script, en.and_then(|e| e.script.as_ref())));
        }
        if let Some(en) = en {
            if !en.effective_preload.is_empty() {
                d.put("ldpreload", strings(&en.effective_preload));
            }
        }

        // The subject is the process as it was before this exec.
        let (parent, older) = match snap.ancestors.split_first() {
            Some((p, rest)) => (Some(p), rest),
            None => (None, &[][..]),
        };
        let mut s = Dict::new();
        if rec.reconstructed {
            s.put("reconstructed", true);
        }
        s.put("pid", rec.pid);
        self.subject(&mut s, &rec.subject);
        s.put_opt("fork_time", rec.fork_ts);
        if let Some(parent) = parent {
            s.put("image", self.process_image_exec(parent));
        }
        if self.cfg.ancestors.0 > 0 && parent.is_some() {
            s.put("ancestors", Value::List(older.iter().map(|a| self.process_image_exec(a)).collect()));
        }
        d.put("subject", s);
        LogEvent { code: EventCode::ImageExec, tree: d.build() }
    }

    fn socket(&self, ts: DateTime<Utc>, subject: &ProcessRef, op: SocketOp, info: &SocketInfo) -> LogEvent {
        let code = match op {
            SocketOp::Listen => EventCode::SocketListen,
            SocketOp::Accept => EventCode::SocketAccept,
            SocketOp::Connect => EventCode::SocketConnect,
        };
        let mut d = header(code, ts);
        d.put("proto", protocol_name(info.protocol));
        if let Some(addr) = info.sock_addr {
            d.put("sockaddr", addr.to_string()).put("sockport", u64::from(info.sock_port));
        }
        if op != SocketOp::Listen {
            if let Some(addr) = info.peer_addr {
                d.put("peeraddr", addr.to_string()).put("peerport", u64::from(info.peer_port));
            }
        }
        d.put("subject", self.process(subject));
        LogEvent { code, tree: d.build() }
    }

    fn process(&self, p: &ProcessRef) -> Value {
        let mut d = Dict::new();
        if p.reconstructed {
            d.put("reconstructed", true);
        }
        d.put("pid", p.pid);
        self.subject(&mut d, &p.subject);
        if let Some(img) = &p.image {
            d.put_opt("fork_time", img.fork_ts);
            d.put("image", self.process_image_exec(img));
            if self.cfg.ancestors.0 > 0 {
                d.put(
                    "ancestors",
                    Value::List(p.ancestors.iter().map(|a| self.process_image_exec(a)).collect()),
                );
            }
        }
        d.build()
    }

    fn subject(&self, d: &mut Dict, s: &Subject) {
        d.put("auid", s.auid.map_or(Value::Int(-1), Value::Uid));
        d.put("euid", Value::Uid(s.euid));
        if !self.cfg.omit_groups {
            d.put("egid", Value::Gid(s.egid));
        }
        d.put("ruid", Value::Uid(s.ruid));
        if !self.cfg.omit_groups {
            d.put("rgid", Value::Gid(s.rgid));
        }
        if !self.cfg.omit_sid {
            d.put_opt("sid", s.sid);
        }
        d.put_opt("dev", s.tty);
        d.put_opt("addr", s.addr.clone());
    }

    /// Compact image view used inside process dicts.
    fn process_image_exec(&self, rec: &Arc<ImageExecRecord>) -> Value {
        let en = rec.enrichment();
        let mut d = Dict::new();
        if rec.reconstructed {
            d.put("reconstructed", true);
        }
        d.put("exec_time", rec.ts).put("exec_pid", rec.pid).put("path", rec.image.path.as_str());
        if let Some(en) = en {
            self.hashes(&mut d, &en.image);
            if let Some(cs) = en.image.codesign.as_deref().filter(|cs| cs.result == SignResult::Good) {
                d.put_opt("ident", cs.ident.clone()).put_opt("teamid", cs.team_id.clone());
            }
        }
        if let Some(script) = &rec.script {
            let mut s = Dict::new();
            s.put("path", script.path.as_str());
            if let Some(sen) = en.and_then(|e| e.script.as_ref()) {
                self.hashes(&mut s, sen);
            }
            d.put("script", s);
        }
        d.build()
    }

    fn image(&self, img: &ImageFile, en: Option<&ImageEnrichment>) -> Value {
        let mut d = Dict::new();
        d.put("path", img.path.as_str());
        if let Some(st) = &img.stat {
            self.stamp(&mut d, st);
        }
        if let Some(en) = en {
            self.hashes(&mut d, en);
            if let Some(cs) = en.codesign.as_deref() {
                d.put("signature", cs.result.as_str());
                d.put_opt("origin", cs.origin.map(|o| o.as_str()));
                d.put_opt("cdhash", cs.cdhash.clone().map(Value::Hex));
                d.put_opt("ident", cs.ident.clone())
                    .put_opt("teamid", cs.team_id.clone())
                    .put_opt("certcn", cs.cert_cn.clone());
            }
            d.put_opt("ldpl", en.preload.map(|p| p.as_str()));
            d.put_opt("error", en.error.clone());
        }
        d.build()
    }

    fn stamp(&self, d: &mut Dict, st: &FileStamp) {
        if !self.cfg.omit_mode {
            d.put("mode", format!("{:o}", st.mode));
        }
        d.put("uid", Value::Uid(st.uid));
        if !self.cfg.omit_groups {
            d.put("gid", Value::Gid(st.gid));
        }
        if !self.cfg.omit_size {
            d.put("size", st.size);
        }
        if !self.cfg.omit_mtime {
            d.put_opt("mtime", st.mtime);
        }
        if !self.cfg.omit_ctime {
            d.put_opt("ctime", st.ctime);
        }
        if !self.cfg.omit_btime {
            d.put_opt("btime", st.btime);
        }
    }

    fn hashes(&self, d: &mut Dict, en: &ImageEnrichment) {
        let platform = en.codesign.as_deref().is_some_and(|cs| cs.is_platform());
        if platform && self.cfg.omit_platform_hashes {
            return;
        }
        if let Some(h) = en.hashes.as_deref() {
            put_hashes(d, h);
        }
    }
}

fn header(code: EventCode, ts: DateTime<Utc>) -> Dict {
    let mut d = Dict::new();
    d.put("version", LOG_VERSION).put("time", ts).put("eventcode", code as u64);
    d
}

fn put_hashes(d: &mut Dict, h: &Hashes) {
    d.put_opt("md5", h.md5.map(|v| Value::Hex(v.to_vec())))
        .put_opt("sha1", h.sha1.map(|v| Value::Hex(v.to_vec())))
        .put_opt("sha256", h.sha256.map(|v| Value::Hex(v.to_vec())));
}

fn strings(v: &[String]) -> Value {
    Value::List(v.iter().map(|s| Value::Str(s.clone())).collect())
}

fn protocol_name(proto: u32) -> Value {
    match proto {
        6 => "tcp".into(),
        17 => "udp".into(),
        other => Value::Uint(u64::from(other)),
    }
}

fn hash_names(out: &OutputConfig) -> String {
    out.hashes
        .iter()
        .map(|h| match h {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn suppress_counts(c: &mut Dict, s: &SuppressConfig) {
    c.put("suppress_image_exec_by_ident", s.image_exec_by_ident.len() as u64)
        .put("suppress_image_exec_by_path", s.image_exec_by_path.len() as u64)
        .put("suppress_image_exec_by_ancestor_ident", s.image_exec_by_ancestor_ident.len() as u64)
        .put("suppress_image_exec_by_ancestor_path", s.image_exec_by_ancestor_path.len() as u64)
        .put("suppress_process_access_by_subject_ident", s.process_access_by_subject_ident.len() as u64)
        .put("suppress_process_access_by_subject_path", s.process_access_by_subject_path.len() as u64)
        .put("suppress_socket_op_localhost", s.socket_op_localhost)
        .put("suppress_socket_op_by_subject_ident", s.socket_op_by_subject_ident.len() as u64)
        .put("suppress_socket_op_by_subject_path", s.socket_op_by_subject_path.len() as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::FileOp;
    use crate::output::format::{render_record, JsonFormat, LogFormat};
    use crate::pipeline::model::Enrichment;
    use crate::scanner::codesign::{CodeSignature, SignOrigin};
    use chrono::TimeZone;
    use std::sync::OnceLock;

    fn ts(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, s).unwrap()
    }

    fn record(id: u64, pid: i32, path: &str, prev: Option<u64>) -> Arc<ImageExecRecord> {
        Arc::new(ImageExecRecord {
            id,
            pid,
            ts: ts(id as u32),
            fork_ts: Some(ts(0)),
            subject: Subject { euid: 501, egid: 20, ruid: 501, rgid: 20, sid: Some(7), ..Default::default() },
            image: ImageFile {
                path: path.into(),
                stat: Some(FileStamp { mode: 0o100755, size: 10, ..Default::default() }),
            },
            script: None,
            argv: vec![path.into()],
            env: Vec::new(),
            cwd: Some("/tmp".into()),
            prev,
            reconstructed: false,
            enrichment: OnceLock::new(),
        })
    }

    fn json(ev: &LogEvent) -> serde_json::Value {
        let mut f = JsonFormat::new();
        render_record(&ev.tree, &mut f, None).unwrap();
        serde_json::from_slice(&f.take()).unwrap()
    }

    #[test]
    fn image_exec_subject_uses_previous_image() {
        let sh = record(1, 10, "/bin/sh", None);
        let curl = record(2, 10, "/usr/bin/curl", Some(1));
        let _ = curl.enrichment.set(Enrichment {
            image: ImageEnrichment {
                hashes: Some(Arc::new(Hashes { md5: None, sha1: None, sha256: Some([0xab; 32]) })),
                codesign: Some(Arc::new(CodeSignature {
                    result: SignResult::Good,
                    origin: Some(SignOrigin::ThirdParty),
                    ident: Some("se.haxx.curl".into()),
                    ..CodeSignature::unsigned()
                })),
                ..Default::default()
            },
            ..Default::default()
        });
        let h = Handlers::new(&OutputConfig::default());
        let ev = Event { ts: ts(2), body: EventBody::ImageExec(ExecSnapshot { record: curl, ancestors: vec![sh] }) };
        let v = json(&h.build(&ev));

        assert_eq!(v["eventcode"], 2);
        assert_eq!(v["version"], LOG_VERSION);
        assert_eq!(v["image"]["path"], "/usr/bin/curl");
        assert_eq!(v["image"]["mode"], "100755");
        assert_eq!(v["image"]["sha256"], "ab".repeat(32));
        assert_eq!(v["image"]["signature"], "good");
        assert_eq!(v["image"]["ident"], "se.haxx.curl");
        assert_eq!(v["subject"]["image"]["path"], "/bin/sh");
        assert_eq!(v["subject"]["auid"], -1);
        assert_eq!(v["subject"]["sid"], 7);
        assert!(v["subject"]["ancestors"].as_array().unwrap().is_empty());
        assert!(v.get("reconstructed").is_none());
    }

    #[test]
    fn omissions_apply() {
        let cfg = OutputConfig { omit_mode: true, omit_groups: true, omit_sid: true, ..Default::default() };
        let h = Handlers::new(&cfg);
        let subject = ProcessRef {
            pid: 4,
            subject: Subject::default(),
            image: Some(record(1, 4, "/bin/cat", None)),
            ancestors: Vec::new(),
            reconstructed: true,
        };
        let ev = Event {
            ts: ts(1),
            body: EventBody::FileAccess { subject, op: FileOp::Rename, path: "/a".into(), new_path: Some("/b".into()) },
        };
        let v = json(&h.build(&ev));
        assert_eq!(v["eventcode"], 8);
        assert_eq!(v["newpath"], "/b");
        assert_eq!(v["subject"]["reconstructed"], true);
        assert!(v["subject"].get("egid").is_none());
        assert!(v["subject"].get("sid").is_none());
        assert!(v["subject"]["image"].get("mode").is_none());
    }

    #[test]
    fn ops_event_reports_configuration() {
        let mut cfg = Config::default();
        cfg.suppress.image_exec_by_path.insert("/usr/bin/true".into());
        cfg.output.ancestors = crate::config::model::AncestorLimit::UNLIMITED;
        let h = Handlers::new(&cfg.output);
        let v = json(&h.agent_ops("start", &cfg, ts(0)));
        assert_eq!(v["eventcode"], 0);
        assert_eq!(v["op"], "start");
        assert_eq!(v["config"]["ancestors"], "unlimited");
        assert_eq!(v["config"]["hashes"], "sha256");
        assert_eq!(v["config"]["suppress_image_exec_by_path"], 1);
        assert!(v["config"]["path"].is_null());
    }

    #[test]
    fn stats_sections_are_lifted() {
        let h = Handlers::new(&OutputConfig::default());
        let snap = serde_json::json!({"prep_queue": {"miss": 3}});
        let v = json(&h.agent_stats(&snap, ts(0)));
        assert_eq!(v["eventcode"], 1);
        assert_eq!(v["prep_queue"]["miss"], 3);
    }
}
