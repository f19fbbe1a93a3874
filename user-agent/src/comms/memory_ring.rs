//! Memory‑mapped ring‑buffer transport
//! -----------------------------------
//! The kernel producer and the agent share one file‑backed mapping holding a
//! *single‑producer / single‑consumer* byte ring:
//
//!   ┌ 0 ─────── 16 ┬────────────────────────────── capacity ┐
//!   │ head │ tail  │ len | record ░ len | record ░ 0 (wrap)  │
//!   └──────────────┴─────────────────────────────────────────┘
//
//! * `head` and `tail` are monotonically increasing byte positions; the
//!   offset in the data area is `pos % capacity`.
//! * Each record is a `u32` little‑endian length followed by the encoded
//!   message, padded to 8 bytes. A record never straddles the end of the
//!   data area: the writer drops a zero length (wrap marker) and continues at
//!   the start.
//! * The producer publishes `head` with Release, the consumer publishes `tail`
//!   with Release; each side reads the other's cursor with Acquire.

use memmap2::MmapRaw;
use shared::constants::{record_size, RECORD_ALIGN, RECORD_PREFIX, RING_HEADER_SIZE, WRAP_MARKER};
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("ring data area of {0} bytes is not a usable size")]
    BadSize(usize),
    #[error("corrupt record length {len} at offset {offset}; resynchronised")]
    Corrupt { len: u32, offset: usize },
}

/// RAII wrapper over the mapped ring file.
pub struct MemoryRing {
    map:      MmapRaw,
    capacity: usize,
}

// The mapping is only touched through the atomic cursors and the
// producer/consumer protocol above.
unsafe impl Send for MemoryRing {}
unsafe impl Sync for MemoryRing {}

impl MemoryRing {
    /// Map an existing ring file (consumer side).
    pub fn open(path: &Path) -> Result<Self, RingError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::map(&file)
    }

    /// Create (or truncate) a zeroed ring with `capacity` data bytes.
    pub fn create(path: &Path, capacity: usize) -> Result<Self, RingError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((RING_HEADER_SIZE + capacity) as u64)?;
        Self::map(&file)
    }

    fn map(file: &File) -> Result<Self, RingError> {
        let map = MmapRaw::map_raw(file)?;
        let capacity = map.len().saturating_sub(RING_HEADER_SIZE);
        if capacity < 2 * RECORD_ALIGN || capacity % RECORD_ALIGN != 0 {
            return Err(RingError::BadSize(capacity));
        }
        Ok(Self { map, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn head(&self) -> &AtomicU64 {
        // page aligned mapping, offset 0
        unsafe { &*(self.map.as_ptr() as *const AtomicU64) }
    }

    fn tail(&self) -> &AtomicU64 {
        unsafe { &*(self.map.as_ptr().add(8) as *const AtomicU64) }
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.map.as_mut_ptr().add(RING_HEADER_SIZE) }
    }

    /// Bytes currently queued, wrap padding included.
    pub fn pending(&self) -> usize {
        let head = self.head().load(Ordering::Acquire);
        let tail = self.tail().load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    /// Next complete record, if the writer has published one. Non‑blocking.
    pub fn next(&self) -> Result<Option<Vec<u8>>, RingError> {
        let head = self.head().load(Ordering::Acquire);
        let mut tail = self.tail().load(Ordering::Relaxed);
        loop {
            if tail >= head {
                return Ok(None);
            }
            let offset = (tail % self.capacity as u64) as usize;
            let len = unsafe { ptr::read_unaligned(self.data().add(offset) as *const u32) };
            let len = u32::from_le(len);
            if len == WRAP_MARKER {
                tail += (self.capacity - offset) as u64;
                self.tail().store(tail, Ordering::Release);
                continue;
            }
            let size = record_size(len as usize);
            if size > self.capacity - offset || tail + size as u64 > head {
                // Skip everything published so far.
                self.tail().store(head, Ordering::Release);
                return Err(RingError::Corrupt { len, offset });
            }
            let mut buf = vec![0u8; len as usize];
            unsafe {
                ptr::copy_nonoverlapping(
                    self.data().add(offset + RECORD_PREFIX),
                    buf.as_mut_ptr(),
                    len as usize,
                );
            }
            self.tail().store(tail + size as u64, Ordering::Release);
            return Ok(Some(buf));
        }
    }

    /// Producer side: append one record. Returns `false` when it does not fit.
    pub fn push(&self, record: &[u8]) -> bool {
        let Ok(len) = u32::try_from(record.len()) else { return false };
        if len == WRAP_MARKER {
            return false;
        }
        let size = record_size(record.len());
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Acquire);
        let offset = (head % self.capacity as u64) as usize;
        let pad = if offset + size > self.capacity { self.capacity - offset } else { 0 };
        let used = (head - tail) as usize;
        if size > self.capacity || used + pad + size > self.capacity {
            return false;
        }
        unsafe {
            let data = self.data();
            let mut at = offset;
            if pad > 0 {
                ptr::write_unaligned(data.add(at) as *mut u32, WRAP_MARKER.to_le());
                at = 0;
            }
            ptr::write_unaligned(data.add(at) as *mut u32, len.to_le());
            ptr::copy_nonoverlapping(record.as_ptr(), data.add(at + RECORD_PREFIX), record.len());
        }
        self.head().store(head + (pad + size) as u64, Ordering::Release);
        true
    }
}
