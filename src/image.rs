use crate::buffer_set::BufferSet;
use crate::error::SetupError;
use crate::layout::{Direction, RegionHeader, RegionLayout, Slot, OFFSET_FIELD_SIZE, SLOTS};
use crate::lock::LockConfig;
use crate::region::Region;
use std::mem::align_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A validated process image: the shared region interpreted through a
/// [`RegionLayout`].
///
/// Obtained either by [`SharedImage::open`], which trusts nothing it has not
/// checked, or by [`SharedImage::format`], which plays the device's part and
/// writes a fresh image. Exchange endpoints share it through an `Arc`; the
/// region is released when the last endpoint goes away.
#[derive(Debug)]
pub struct SharedImage<R> {
    region: R,
    layout: RegionLayout,
    backoff: Duration,
    // [direction][publisher, consumer]
    claims: [[AtomicBool; 2]; 2],
}

/// Endpoint role within one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Publisher = 0,
    Consumer = 1,
}

impl<R: Region> SharedImage<R> {
    /// Validates an existing image.
    ///
    /// Checks the region size and alignment, then the magic marker, then
    /// (under each buffer set's lock) that the indices are a permutation.
    /// No payload buffer is read or written before all checks pass.
    pub fn open(region: R, layout: RegionLayout, lock: LockConfig) -> Result<Self, SetupError> {
        Self::check_geometry(&region, &layout)?;
        let image = Self::new(region, layout, lock);

        let found = image.header().magic();
        if found != layout.magic() {
            return Err(SetupError::BadMagic {
                found,
                expected: layout.magic(),
            });
        }

        for direction in Direction::ALL {
            let set = image.buffer_set(direction);
            let indices = {
                let _guard = set.lock(image.backoff).acquire();
                set.indices()
            };
            if !indices.is_permutation() {
                return Err(SetupError::CorruptIndices {
                    direction,
                    indices: indices.as_array(),
                });
            }
        }

        log::info!(
            "process image valid: {} bytes, {} buffers of {} bytes",
            image.region.len(),
            2 * SLOTS,
            layout.buffer_size()
        );
        Ok(image)
    }

    /// Writes a fresh image into the region, the way the device driver does
    /// at start-up.
    ///
    /// Both buffer sets start at read 0, write 1, available 2 with no new
    /// data. Every buffer header carries the payload offset and every payload
    /// is zeroed. The magic marker is written last.
    pub fn format(region: R, layout: RegionLayout, lock: LockConfig) -> Result<Self, SetupError> {
        Self::check_geometry(&region, &layout)?;
        let image = Self::new(region, layout, lock);
        let header = image.header();

        header.magic.store(0, Ordering::Relaxed);
        for direction in Direction::ALL {
            image.buffer_set(direction).reset();
            for slot in Slot::ALL {
                let buf = unsafe { image.buffer_raw(direction, slot) };
                buf.fill(0);
                buf[..OFFSET_FIELD_SIZE]
                    .copy_from_slice(&(layout.header_size() as u16).to_ne_bytes());
            }
        }
        header
            .magic
            .store(u32::from_ne_bytes(layout.magic()), Ordering::Release);

        log::debug!("formatted process image of {} bytes", layout.required_len());
        Ok(image)
    }

    fn new(region: R, layout: RegionLayout, lock: LockConfig) -> Self {
        Self {
            region,
            layout,
            backoff: lock.backoff(),
            claims: Default::default(),
        }
    }

    fn check_geometry(region: &R, layout: &RegionLayout) -> Result<(), SetupError> {
        let addr = region.base().as_ptr() as usize;
        let align = align_of::<RegionHeader>();
        if addr % align != 0 {
            return Err(SetupError::Misaligned { addr, align });
        }
        if region.len() < layout.required_len() {
            return Err(SetupError::RegionTooSmall {
                required: layout.required_len(),
                actual: region.len(),
            });
        }
        Ok(())
    }

    #[inline(always)]
    fn header(&self) -> &RegionHeader {
        // Size and alignment were checked at construction.
        unsafe { self.region.base().cast::<RegionHeader>().as_ref() }
    }

    #[inline(always)]
    pub fn buffer_set(&self, direction: Direction) -> &BufferSet {
        self.header().buffer_set(direction)
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub(crate) fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    /// Whole buffer, header included.
    ///
    /// # Safety
    ///
    /// The caller must own `slot` under the triple-buffer discipline for as
    /// long as the slice lives.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    unsafe fn buffer_raw(&self, direction: Direction, slot: Slot) -> &mut [u8] {
        let offset = self.layout.buffer_offset(direction, slot);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.region.base().as_ptr().add(offset),
                self.layout.buffer_size(),
            )
        }
    }

    /// Prepares a buffer for writing: stamps the payload offset into its
    /// header and returns the payload region.
    ///
    /// # Safety
    ///
    /// Same as [`SharedImage::buffer_raw`].
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub(crate) unsafe fn payload_mut(&self, direction: Direction, slot: Slot) -> &mut [u8] {
        let header_size = self.layout.header_size();
        let buf = unsafe { self.buffer_raw(direction, slot) };
        buf[..OFFSET_FIELD_SIZE].copy_from_slice(&(header_size as u16).to_ne_bytes());
        &mut buf[header_size..]
    }

    /// Payload of a buffer as described by its header.
    ///
    /// The offset was written by the other side; an offset pointing outside
    /// the buffer yields an empty payload.
    ///
    /// # Safety
    ///
    /// Same as [`SharedImage::buffer_raw`].
    #[inline(always)]
    pub(crate) unsafe fn payload(&self, direction: Direction, slot: Slot) -> &[u8] {
        let buf: &[u8] = unsafe { self.buffer_raw(direction, slot) };
        let offset = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        if offset < OFFSET_FIELD_SIZE {
            return &[];
        }
        buf.get(offset..).unwrap_or(&[])
    }

    /// Marks an endpoint role as taken; fails if it already was.
    pub(crate) fn claim(&self, direction: Direction, role: Role) -> bool {
        !self.claims[direction.ordinal()][role as usize].swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unclaim(&self, direction: Direction, role: Role) {
        self.claims[direction.ordinal()][role as usize].store(false, Ordering::Release);
    }
}
