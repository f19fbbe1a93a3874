//! Internal event model shared by correlation, enrichment and dispatch.

use crate::comms::events::{FileOp, ImageFile, Pid, ServiceInfo, SocketInfo, SocketOp, Subject};
use crate::scanner::{codesign::CodeSignature, hash::Hashes, preload::PreloadVerdict};
use chrono::{DateTime, Utc};
use std::sync::{Arc, OnceLock};

/// Stable arena index of an image exec record. Allocated in increasing order,
/// so a record's predecessor always has a smaller id.
pub type ExecId = u64;

/// Results for one image. Absent parts were disabled or failed.
#[derive(Debug, Clone, Default)]
pub struct ImageEnrichment {
    pub hashes:   Option<Arc<Hashes>>,
    pub codesign: Option<Arc<CodeSignature>>,
    pub preload:  Option<PreloadVerdict>,
    /// Set when the image could not be enriched at all.
    pub error:    Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub image:             ImageEnrichment,
    pub script:            Option<ImageEnrichment>,
    pub effective_preload: Vec<String>,
}

/// One image invocation. Everything but `enrichment` is fixed at creation;
/// `enrichment` is published once, complete.
#[derive(Debug)]
pub struct ImageExecRecord {
    pub id:            ExecId,
    pub pid:           Pid,
    pub ts:            DateTime<Utc>,
    pub fork_ts:       Option<DateTime<Utc>>,
    pub subject:       Subject,
    pub image:         ImageFile,
    /// The script when `image` is its interpreter.
    pub script:        Option<ImageFile>,
    pub argv:          Vec<String>,
    pub env:           Vec<String>,
    pub cwd:           Option<String>,
    pub prev:          Option<ExecId>,
    pub reconstructed: bool,
    pub enrichment:    OnceLock<Enrichment>,
}

impl ImageExecRecord {
    pub fn enrichment(&self) -> Option<&Enrichment> {
        self.enrichment.get()
    }

    /// Code-signing identity of the image, used by suppression rules.
    pub fn ident(&self) -> Option<&str> {
        self.enrichment()?.image.codesign.as_ref()?.ident.as_deref()
    }
}

/// Read-only view of a process at the time of an event.
#[derive(Debug, Clone)]
pub struct ProcessRef {
    pub pid:           Pid,
    pub subject:       Subject,
    pub image:         Option<Arc<ImageExecRecord>>,
    pub ancestors:     Vec<Arc<ImageExecRecord>>,
    pub reconstructed: bool,
}

#[derive(Debug, Clone)]
pub struct ExecSnapshot {
    pub record:    Arc<ImageExecRecord>,
    pub ancestors: Vec<Arc<ImageExecRecord>>,
}

#[derive(Debug, Clone)]
pub enum EventBody {
    ImageExec(ExecSnapshot),
    ProcessAccess { subject: ProcessRef, object: ProcessRef, method: String },
    FileAccess { subject: ProcessRef, op: FileOp, path: String, new_path: Option<String> },
    Socket { subject: ProcessRef, op: SocketOp, info: SocketInfo },
    ServiceAdd { subject: Option<ProcessRef>, info: ServiceInfo },
}

/// A correlated event on its way to dispatch.
#[derive(Debug, Clone)]
pub struct Event {
    pub ts:   DateTime<Utc>,
    pub body: EventBody,
}
