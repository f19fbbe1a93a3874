//! Internal form of the raw kernel records.
//!
//! The wire messages from `shared::events` are converted once, on the hook
//! thread, into [`RawRecord`]: timestamps become `chrono` values, "unset"
//! sentinels become `Option`s and the payload is checked against the record
//! kind. A `RawRecord` is immutable after conversion.

use chrono::{DateTime, Utc};
use shared::{
    constants::ID_UNSET,
    events::{
        kernel_record::Payload, Credentials, FileInfo, FileOperation, FileStat, KernelRecord,
        RecordKind,
    },
};
use std::net::IpAddr;
use thiserror::Error;

pub type Pid = i32;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record kind {0} is not known")]
    UnknownKind(i32),
    #[error("{0:?} record carries no payload")]
    MissingPayload(RecordKind),
    #[error("{0:?} record carries a mismatched payload")]
    PayloadMismatch(RecordKind),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Credentials of the acting process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub auid: Option<u32>,
    pub euid: u32,
    pub egid: u32,
    pub ruid: u32,
    pub rgid: u32,
    pub sid:  Option<i32>,
    pub tty:  Option<u64>,
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStamp {
    pub dev:   u64,
    pub ino:   u64,
    pub mode:  u32,
    pub uid:   u32,
    pub gid:   u32,
    pub size:  u64,
    pub mtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub btime: Option<DateTime<Utc>>,
}

/// An image as reported by the kernel; `stat` is `None` when it could not be stat'ed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFile {
    pub path: String,
    pub stat: Option<FileStamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecInfo {
    pub image: ImageFile,
    pub argv:  Vec<String>,
    pub env:   Vec<String>,
    pub cwd:   Option<String>,
    pub interpreter_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOp {
    Listen,
    Accept,
    Connect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub protocol:  u32,
    pub sock_addr: Option<IpAddr>,
    pub sock_port: u16,
    pub peer_addr: Option<IpAddr>,
    pub peer_port: u16,
}

impl SocketInfo {
    /// Both ends (where known) are loopback addresses.
    pub fn is_localhost(&self) -> bool {
        let local = |a: &Option<IpAddr>| a.map_or(true, |ip| ip.is_loopback() || ip.is_unspecified());
        match (self.sock_addr, self.peer_addr) {
            (None, None) => false,
            _ => local(&self.sock_addr) && local(&self.peer_addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Open,
    Write,
    Close,
    Rename,
    Unlink,
}

impl FileOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FileOp::Open => "open",
            FileOp::Write => "write",
            FileOp::Close => "close",
            FileOp::Rename => "rename",
            FileOp::Unlink => "unlink",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub plist_path:    String,
    pub program_path:  String,
    pub program_rpath: Option<String>,
    pub program_argv:  Vec<String>,
    pub no_subject:    bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    Fork { child: Pid },
    Exec(ExecInfo),
    ExecInterpreter { image: ImageFile },
    Chdir { path: String },
    Exit { status: i32 },
    FileAccess { op: FileOp, path: String, new_path: Option<String> },
    ProcessAccess { object_pid: Pid, method: String },
    Socket { op: SocketOp, info: SocketInfo },
    ServiceAdd(ServiceInfo),
}

/// One kernel notification after conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub pid:       Pid,
    pub ts:        DateTime<Utc>,
    pub subject:   Subject,
    pub authorize: bool,
    pub payload:   RecordPayload,
}

impl RawRecord {
    /// Child announced by a fork record.
    pub fn forked_child(&self) -> Option<Pid> {
        match self.payload {
            RecordPayload::Fork { child } => Some(child),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.payload {
            RecordPayload::Fork { .. } => "fork",
            RecordPayload::Exec(_) => "exec",
            RecordPayload::ExecInterpreter { .. } => "execinterp",
            RecordPayload::Chdir { .. } => "chdir",
            RecordPayload::Exit { .. } => "exit",
            RecordPayload::FileAccess { .. } => "file",
            RecordPayload::ProcessAccess { .. } => "access",
            RecordPayload::Socket { .. } => "socket",
            RecordPayload::ServiceAdd(_) => "service",
        }
    }

    /// Authorizing exec records wait for an acknowledgement from enrichment.
    pub fn wants_ack(&self) -> bool {
        self.authorize && matches!(self.payload, RecordPayload::Exec(_))
    }
}

pub(crate) fn timestamp(ts: Option<prost_types::Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?)
}

fn opt_id(v: u32) -> Option<u32> {
    (v != ID_UNSET).then_some(v)
}

fn opt_str(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn addr(field: &'static str, s: &str) -> Result<Option<IpAddr>, RecordError> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|e: std::net::AddrParseError| RecordError::Invalid { field, reason: e.to_string() })
}

fn port(field: &'static str, p: u32) -> Result<u16, RecordError> {
    u16::try_from(p).map_err(|_| RecordError::Invalid { field, reason: format!("{p} out of range") })
}

impl From<Credentials> for Subject {
    fn from(c: Credentials) -> Self {
        Subject {
            auid: opt_id(c.auid),
            euid: c.euid,
            egid: c.egid,
            ruid: c.ruid,
            rgid: c.rgid,
            sid:  (c.sid >= 0).then_some(c.sid),
            tty:  (c.tty != u64::MAX).then_some(c.tty),
            addr: opt_str(c.addr),
        }
    }
}

impl From<FileStat> for FileStamp {
    fn from(s: FileStat) -> Self {
        FileStamp {
            dev:   s.dev,
            ino:   s.ino,
            mode:  s.mode,
            uid:   s.uid,
            gid:   s.gid,
            size:  s.size,
            mtime: timestamp(s.mtime),
            ctime: timestamp(s.ctime),
            btime: timestamp(s.btime),
        }
    }
}

fn image(kind: RecordKind, info: Option<FileInfo>) -> Result<ImageFile, RecordError> {
    let info = info.ok_or(RecordError::MissingPayload(kind))?;
    if info.path.is_empty() {
        return Err(RecordError::Invalid { field: "image.path", reason: "empty".into() });
    }
    Ok(ImageFile { path: info.path, stat: info.stat.map(FileStamp::from) })
}

impl TryFrom<KernelRecord> for RawRecord {
    type Error = RecordError;

    fn try_from(rec: KernelRecord) -> Result<Self, Self::Error> {
        let kind = RecordKind::try_from(rec.kind).map_err(|_| RecordError::UnknownKind(rec.kind))?;
        let payload = rec.payload.ok_or(RecordError::MissingPayload(kind))?;
        let mismatch = || RecordError::PayloadMismatch(kind);

        let payload = match (kind, payload) {
            (RecordKind::Fork, Payload::Fork(f)) => {
                if f.child_pid <= 0 {
                    return Err(RecordError::Invalid {
                        field: "child_pid",
                        reason: f.child_pid.to_string(),
                    });
                }
                RecordPayload::Fork { child: f.child_pid }
            }
            (RecordKind::Exec, Payload::Exec(e)) => RecordPayload::Exec(ExecInfo {
                image: image(kind, e.image)?,
                argv:  e.argv,
                env:   e.env,
                cwd:   opt_str(e.cwd),
                interpreter_pending: e.interpreter_pending,
            }),
            (RecordKind::ExecInterpreter, Payload::Interpreter(i)) => {
                RecordPayload::ExecInterpreter { image: image(kind, i.image)? }
            }
            (RecordKind::Chdir, Payload::Chdir(c)) => RecordPayload::Chdir { path: c.path },
            (RecordKind::Exit, Payload::Exit(x)) => RecordPayload::Exit { status: x.status },
            (RecordKind::FileAccess, Payload::File(f)) => {
                let op = match FileOperation::try_from(f.op) {
                    Ok(FileOperation::Open) => FileOp::Open,
                    Ok(FileOperation::Write) => FileOp::Write,
                    Ok(FileOperation::Close) => FileOp::Close,
                    Ok(FileOperation::Rename) => FileOp::Rename,
                    Ok(FileOperation::Unlink) => FileOp::Unlink,
                    Err(_) => {
                        return Err(RecordError::Invalid { field: "file.op", reason: f.op.to_string() })
                    }
                };
                RecordPayload::FileAccess { op, path: f.path, new_path: opt_str(f.new_path) }
            }
            (RecordKind::ProcessAccess, Payload::ProcessAccess(a)) => RecordPayload::ProcessAccess {
                object_pid: a.object_pid,
                method:     a.method,
            },
            (
                k @ (RecordKind::SocketListen | RecordKind::SocketAccept | RecordKind::SocketConnect),
                Payload::Socket(s),
            ) => {
                let op = match k {
                    RecordKind::SocketListen => SocketOp::Listen,
                    RecordKind::SocketAccept => SocketOp::Accept,
                    _ => SocketOp::Connect,
                };
                RecordPayload::Socket {
                    op,
                    info: SocketInfo {
                        protocol:  s.protocol,
                        sock_addr: addr("sock_addr", &s.sock_addr)?,
                        sock_port: port("sock_port", s.sock_port)?,
                        peer_addr: addr("peer_addr", &s.peer_addr)?,
                        peer_port: port("peer_port", s.peer_port)?,
                    },
                }
            }
            (RecordKind::ServiceAdd, Payload::Service(s)) => RecordPayload::ServiceAdd(ServiceInfo {
                plist_path:    s.plist_path,
                program_path:  s.program_path,
                program_rpath: opt_str(s.program_rpath),
                program_argv:  s.program_argv,
                no_subject:    s.no_subject,
            }),
            (RecordKind::Unspecified, _) => return Err(RecordError::UnknownKind(rec.kind)),
            _ => return Err(mismatch()),
        };

        Ok(RawRecord {
            pid: rec.pid,
            ts: timestamp(rec.ts).unwrap_or_else(Utc::now),
            subject: rec.subject.map(Subject::from).unwrap_or_default(),
            authorize: rec.authorize,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::events::{ExecPayload, ForkPayload, SocketPayload};

    fn creds() -> Credentials {
        Credentials {
            auid: ID_UNSET,
            euid: 0,
            egid: 0,
            ruid: 501,
            rgid: 20,
            sid: -1,
            tty: u64::MAX,
            addr: String::new(),
        }
    }

    #[test]
    fn fork_names_parent_and_child() {
        let rec = KernelRecord {
            kind: RecordKind::Fork as i32,
            pid: 100,
            ts: Some(prost_types::Timestamp { seconds: 1_700_000_000, nanos: 5 }),
            subject: Some(creds()),
            authorize: false,
            payload: Some(Payload::Fork(ForkPayload { child_pid: 200 })),
        };
        let raw = RawRecord::try_from(rec).unwrap();
        assert_eq!(raw.forked_child(), Some(200));
        assert_eq!(raw.pid, 100);
        assert_eq!(raw.subject.auid, None);
        assert_eq!(raw.subject.sid, None);
        assert_eq!(raw.subject.tty, None);
        assert_eq!(raw.ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let rec = KernelRecord {
            kind: RecordKind::Exec as i32,
            pid: 1,
            payload: Some(Payload::Fork(ForkPayload { child_pid: 2 })),
            ..Default::default()
        };
        assert!(matches!(RawRecord::try_from(rec), Err(RecordError::PayloadMismatch(RecordKind::Exec))));
    }

    #[test]
    fn exec_without_image_is_rejected() {
        let rec = KernelRecord {
            kind: RecordKind::Exec as i32,
            pid: 1,
            authorize: true,
            payload: Some(Payload::Exec(ExecPayload::default())),
            ..Default::default()
        };
        assert!(matches!(RawRecord::try_from(rec), Err(RecordError::MissingPayload(_))));
    }

    #[test]
    fn socket_addresses_are_parsed() {
        let rec = KernelRecord {
            kind: RecordKind::SocketConnect as i32,
            pid: 7,
            payload: Some(Payload::Socket(SocketPayload {
                protocol: 6,
                sock_addr: "127.0.0.1".into(),
                sock_port: 50_000,
                peer_addr: "::1".into(),
                peer_port: 443,
            })),
            ..Default::default()
        };
        let raw = RawRecord::try_from(rec).unwrap();
        let RecordPayload::Socket { op, info } = raw.payload else { panic!("not a socket") };
        assert_eq!(op, SocketOp::Connect);
        assert!(info.is_localhost());
        assert_eq!(info.peer_port, 443);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let rec = KernelRecord { kind: 99, ..Default::default() };
        assert!(matches!(RawRecord::try_from(rec), Err(RecordError::UnknownKind(99))));
    }
}
