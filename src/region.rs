use crate::error::SetupError;
use crate::mmap::{map_device, read_map_size, unmap};
use std::path::Path;
use std::ptr::NonNull;

/// A mapped, directly addressable memory region shared with the device.
///
/// # Safety
///
/// Implementors guarantee that `base()` points to `len()` readable and
/// writable bytes, aligned to at least 4 bytes, that stay mapped at the same
/// address for as long as the value lives. Other parties may modify the
/// memory concurrently, but only following the triple-buffer discipline.
pub unsafe trait Region: Send + Sync {
    fn base(&self) -> NonNull<u8>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A zero-initialised region on the heap.
///
/// Stands in for the device memory when both sides run in one process.
#[derive(Debug)]
pub struct HeapRegion {
    ptr: NonNull<u64>,
    words: usize,
    len: usize,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(std::mem::size_of::<u64>()).max(1);
        let boxed: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u64>();
        Self { ptr, words, len }
    }
}

unsafe impl Region for HeapRegion {
    #[inline(always)]
    fn base(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

/// The memory region of a Linux UIO device, mapped shared.
///
/// The mapping is removed when the value is dropped, which must only happen
/// after the cycle loop has exited; holding the region in the exchange
/// endpoints guarantees that.
#[derive(Debug)]
pub struct UioRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for UioRegion {}
unsafe impl Sync for UioRegion {}

impl UioRegion {
    /// Maps map 0 of a UIO device.
    ///
    /// `map_size_path` is the sysfs attribute holding the map size, e.g.
    /// `/sys/class/uio/uio1/maps/map0/size`.
    pub fn open(
        device: impl AsRef<Path>,
        map_size_path: impl AsRef<Path>,
    ) -> Result<Self, SetupError> {
        let len = read_map_size(map_size_path.as_ref())?;
        log::debug!("uio map size: {:#x}", len);
        let ptr = map_device(device.as_ref(), len)?;
        log::info!(
            "mapped {} ({} bytes) at {:p}",
            device.as_ref().display(),
            len,
            ptr
        );
        Ok(Self { ptr, len })
    }
}

unsafe impl Region for UioRegion {
    #[inline(always)]
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for UioRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { unmap(self.ptr, self.len) } {
            log::error!("munmap of uio region at {:p} failed: {}", self.ptr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_zeroed_and_aligned() {
        let region = HeapRegion::new(6268);
        assert_eq!(region.len(), 6268);
        assert!(!region.is_empty());
        assert_eq!(region.base().as_ptr() as usize % 8, 0);
        let bytes = unsafe { std::slice::from_raw_parts(region.base().as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn heap_region_is_writable_to_the_last_byte() {
        let region = HeapRegion::new(13);
        unsafe {
            region.base().as_ptr().add(12).write(0xEE);
            assert_eq!(region.base().as_ptr().add(12).read(), 0xEE);
        }
    }

    #[test]
    fn uio_open_fails_without_sysfs_size() {
        let res = UioRegion::open("/dev/uio-missing", "/nonexistent/maps/map0/size");
        assert!(matches!(res, Err(SetupError::MapSize { .. })));
    }
}
