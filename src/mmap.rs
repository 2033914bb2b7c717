use crate::error::SetupError;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

/// Parses the contents of a UIO `maps/mapN/size` attribute (`0x00002000`).
pub(crate) fn parse_map_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))?;
    usize::from_str_radix(digits, 16).ok()
}

/// Reads the size of a UIO mapping from sysfs.
pub(crate) fn read_map_size(sysfs_path: &Path) -> Result<usize, SetupError> {
    let text = std::fs::read_to_string(sysfs_path).map_err(|e| SetupError::MapSize {
        path: sysfs_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    match parse_map_size(&text) {
        Some(0) => Err(SetupError::ZeroMapSize),
        Some(size) => Ok(size),
        None => Err(SetupError::MapSize {
            path: sysfs_path.to_path_buf(),
            reason: format!("unexpected contents {:?}", text.trim()),
        }),
    }
}

/// Maps `len` bytes of a device file read/write and shared.
///
/// The descriptor is closed before returning; the mapping stays valid.
pub(crate) fn map_device(path: &Path, len: usize) -> Result<NonNull<u8>, SetupError> {
    let open_err = |source| SetupError::Open {
        path: path.to_path_buf(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| open_err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

    unsafe {
        let fd = libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC);
        if fd == -1 {
            return Err(open_err(std::io::Error::last_os_error()));
        }

        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );

        if addr == libc::MAP_FAILED {
            let source = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(SetupError::Map { len, source });
        }
        libc::close(fd); // mapping stays valid

        NonNull::new(addr as *mut u8).ok_or(SetupError::Map {
            len,
            source: std::io::Error::other("mmap returned a null mapping"),
        })
    }
}

pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), std::io::Error> {
    unsafe {
        if libc::munmap(ptr.as_ptr().cast(), len) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
