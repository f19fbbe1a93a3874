pub mod events;
pub mod memory_ring;
pub mod router;

use crate::comms::events::{RawRecord, RecordError};
use crate::pipeline::ingest::Decision;

/// The synchronous kernel-facing entry point.
///
/// Implementations must return within their decision budget; the calling
/// thread stands in for the blocked kernel operation.
pub trait KernelHook: Send + Sync {
    fn on_kernel_event(&self, raw: RawRecord) -> Decision;

    /// A record that could not be decoded or converted.
    fn on_bad_record(&self, err: &RecordError);
}
