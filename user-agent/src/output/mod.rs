// src/output/mod.rs
//! Audit record construction, serialization and delivery.

pub mod format;
pub mod handlers;
pub mod names;
pub mod sink;
pub mod tree;
pub mod writer;

use crate::config::model::{LogFormatKind, OutputConfig};
use crate::pipeline::stats::QueueStats;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

pub use handlers::Handlers;
pub use tree::Value;
pub use writer::{LogWriter, WriterStats};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("malformed record: {0}")]
    Structure(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Numeric code carried in every record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventCode {
    AgentOps      = 0,
    AgentStats    = 1,
    ImageExec     = 2,
    ProcessAccess = 3,
    ServiceAdd    = 4,
    SocketListen  = 5,
    SocketAccept  = 6,
    SocketConnect = 7,
    FileAccess    = 8,
}

impl EventCode {
    pub const COUNT: usize = 9;

    pub const ALL: [EventCode; Self::COUNT] = [
        EventCode::AgentOps,
        EventCode::AgentStats,
        EventCode::ImageExec,
        EventCode::ProcessAccess,
        EventCode::ServiceAdd,
        EventCode::SocketListen,
        EventCode::SocketAccept,
        EventCode::SocketConnect,
        EventCode::FileAccess,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventCode::AgentOps => "agent_ops",
            EventCode::AgentStats => "agent_stats",
            EventCode::ImageExec => "image_exec",
            EventCode::ProcessAccess => "process_access",
            EventCode::ServiceAdd => "service_add",
            EventCode::SocketListen => "socket_listen",
            EventCode::SocketAccept => "socket_accept",
            EventCode::SocketConnect => "socket_connect",
            EventCode::FileAccess => "file_access",
        }
    }
}

/// A built record waiting for serialization.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub code: EventCode,
    pub tree: Value,
}

/// Bounded hand-off to the writer task. Offers never block; a full queue
/// counts a drop.
#[derive(Debug, Clone)]
pub struct LogQueue {
    tx:    mpsc::Sender<LogEvent>,
    stats: Arc<QueueStats>,
}

impl LogQueue {
    pub fn new(capacity: usize, stats: Arc<QueueStats>) -> (Self, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    pub fn offer(&self, ev: LogEvent) -> bool {
        match self.tx.try_send(ev) {
            Ok(()) => {
                self.stats.delivered.incr();
                true
            }
            Err(_) => {
                self.stats.drops.incr();
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }
}

/// Spawn the writer task for `cfg.destination`.
pub async fn spawn_writer(
    rx: mpsc::Receiver<LogEvent>,
    cfg: &OutputConfig,
    names: Option<Arc<dyn names::NameResolver>>,
    stats: Arc<WriterStats>,
) -> Result<JoinHandle<()>, OutputError> {
    let sink = sink::open(&cfg.destination).await?;
    let format: Box<dyn format::LogFormat> = match cfg.format {
        LogFormatKind::Json => Box::new(format::JsonFormat::new()),
    };
    let writer = LogWriter {
        rx,
        sink,
        format,
        names,
        flush_interval: cfg.flush_interval.get(),
        batch_size: cfg.batch_size,
        stats,
    };
    Ok(tokio::spawn(writer.run()))
}
