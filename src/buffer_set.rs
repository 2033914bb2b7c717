use crate::layout::{Slot, SLOTS};
use crate::lock::TripleBufLock;
use std::fmt::Debug;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

/// Index and lock metadata of one triple buffer set, as laid out in shared
/// memory.
///
/// ```text
/// [ lock: u32 | read: u8 | write: u8 | available: u8 | new_data: u8 | reserved: 4 ]
/// ```
///
/// The three indices always name three different buffers. The side that
/// publishes into this set owns the buffer at `write`, the side that
/// consumes from it owns the buffer at `read`, and the buffer at `available`
/// only changes hands by swapping indices while `lock` is held.
///
/// `write` is only ever changed by the publisher and `read` only by the
/// consumer, so each side may read its own index without the lock.
#[repr(C)]
pub struct BufferSet {
    pub(crate) lock: AtomicU32,
    pub(crate) read: AtomicU8,
    pub(crate) write: AtomicU8,
    pub(crate) available: AtomicU8,
    pub(crate) new_data: AtomicU8,
    _reserved: [u8; 4],
}

const _: () = assert!(size_of::<BufferSet>() == 12);

/// Snapshot of the three buffer indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indices {
    pub read: u8,
    pub write: u8,
    pub available: u8,
}

impl Indices {
    /// Whether the indices name three distinct buffers.
    pub fn is_permutation(&self) -> bool {
        let mut seen = [false; SLOTS];
        for idx in [self.read, self.write, self.available] {
            match seen.get_mut(idx as usize) {
                Some(s) if !*s => *s = true,
                _ => return false,
            }
        }
        true
    }

    pub fn as_array(&self) -> [u8; 3] {
        [self.read, self.write, self.available]
    }
}

impl BufferSet {
    /// Lock guarding the index fields.
    #[inline(always)]
    pub fn lock(&self, backoff: Duration) -> TripleBufLock<'_> {
        TripleBufLock::new(&self.lock, backoff)
    }

    /// Unlocked read of the new-data flag.
    ///
    /// A stale answer only delays consumption by one cycle.
    #[inline(always)]
    pub fn has_new_data(&self) -> bool {
        self.new_data.load(Ordering::Relaxed) != 0
    }

    /// Reads all three indices.
    ///
    /// Only consistent while the lock is held or the peer is idle.
    pub fn indices(&self) -> Indices {
        Indices {
            read: self.read.load(Ordering::Relaxed),
            write: self.write.load(Ordering::Relaxed),
            available: self.available.load(Ordering::Relaxed),
        }
    }

    /// Buffer at `write`, or the raw byte if it names no buffer.
    #[inline(always)]
    pub(crate) fn write_slot(&self) -> Result<Slot, u8> {
        let raw = self.write.load(Ordering::Relaxed);
        Slot::new(raw).ok_or(raw)
    }

    /// Buffer at `read`, or the raw byte if it names no buffer.
    #[inline(always)]
    pub(crate) fn read_slot(&self) -> Result<Slot, u8> {
        let raw = self.read.load(Ordering::Relaxed);
        Slot::new(raw).ok_or(raw)
    }

    /// Puts the set into its initial state: read 0, write 1, available 2,
    /// no new data, unlocked.
    pub(crate) fn reset(&self) {
        self.read.store(0, Ordering::Relaxed);
        self.write.store(1, Ordering::Relaxed);
        self.available.store(2, Ordering::Relaxed);
        self.new_data.store(0, Ordering::Relaxed);
        self.lock.store(0, Ordering::Release);
    }
}

impl Debug for BufferSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indices = self.indices();
        f.debug_struct("BufferSet")
            .field("locked", &(self.lock.load(Ordering::Relaxed) != 0))
            .field("read", &indices.read)
            .field("write", &indices.write)
            .field("available", &indices.available)
            .field("new_data", &self.has_new_data())
            .finish()
    }
}
