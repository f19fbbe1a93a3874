//! Transport constants shared by the kernel producer and the user agent.

/// Default path of the file-backed ring the kernel producer writes into.
pub const DEFAULT_RING_PATH: &str = "/dev/shm/hostmon.ring";

/// Size of the ring header: two little-endian `u64` cursors (head, tail).
pub const RING_HEADER_SIZE: usize = 2 * core::mem::size_of::<u64>();

/// Default data capacity of the ring (power of two simplifies sizing).
pub const RING_SIZE: usize = 64 * 1024;

/// Every record (length prefix + payload) is padded to this alignment.
pub const RECORD_ALIGN: usize = 8;

/// Length prefix preceding each encoded record.
pub const RECORD_PREFIX: usize = core::mem::size_of::<u32>();

/// A zero length prefix tells the reader to wrap to the start of the data area.
pub const WRAP_MARKER: u32 = 0;

/// Credential value the kernel uses for "not set" (`(uid_t)-1`).
pub const ID_UNSET: u32 = u32::MAX;

/// Padded on-ring size of a record carrying `len` payload bytes.
pub const fn record_size(len: usize) -> usize {
    (RECORD_PREFIX + len).div_ceil(RECORD_ALIGN) * RECORD_ALIGN
}
