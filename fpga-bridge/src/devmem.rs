//! The `/dev/mem` physical memory device.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use crate::DEV_MEM;
use crate::window::MemDevice;

/// Offset argument of the mmap call below. glibc's `mmap64` takes a 64-bit
/// offset even on 32-bit ARM, where `off_t` is `i32` and cannot hold the
/// bridge addresses above 2 GiB.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub type MmapOffset = libc::off64_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub type MmapOffset = libc::off_t;

/// Convert a page-aligned physical address into an mmap offset.
pub fn mmap_offset(map_base: u64) -> io::Result<MmapOffset> {
    MmapOffset::try_from(map_base).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("physical address {:#x} exceeds the mmap offset range", map_base),
        )
    })
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
use libc::mmap64 as sys_mmap;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
use libc::mmap as sys_mmap;

/// Page-granular span covering a physical range.
///
/// `mmap` offsets must be page aligned, so a range starting mid-page is
/// mapped from the enclosing page boundary and the returned pointer is
/// advanced by `page_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub map_base: u64,
    pub page_offset: usize,
    pub map_len: usize,
}

impl PageSpan {
    /// Fails with `InvalidInput` when `len + page_offset` does not fit.
    pub fn new(base: u64, len: usize, page_size: usize) -> io::Result<Self> {
        let page_offset = (base % page_size as u64) as usize;
        let map_len = len.checked_add(page_offset).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapping length {:#x} overflows at page offset {:#x}", len, page_offset),
            )
        })?;
        Ok(Self {
            map_base: base - page_offset as u64,
            page_offset,
            map_len,
        })
    }
}

/// System page size as reported by `sysconf`.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// Physical memory exposed through a character device such as `/dev/mem`.
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
    page_size: usize,
}

impl DevMem {
    pub fn new() -> Self {
        Self::with_path(DEV_MEM)
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            page_size: page_size(),
        }
    }
}

impl Default for DevMem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDevice for DevMem {
    type Handle = File;

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    /// Opens read/write with `O_SYNC` so stores are not buffered.
    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)
    }

    fn map(&self, handle: &File, base: u64, len: usize) -> io::Result<NonNull<u8>> {
        let span = PageSpan::new(base, len, self.page_size)?;
        let offset = mmap_offset(span.map_base)?;

        // SAFETY: a fresh shared mapping chosen by the kernel; the fd is open
        // for the duration of the call.
        let addr = unsafe {
            sys_mmap(
                ptr::null_mut(),
                span.map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                handle.as_raw_fd(),
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the mapping is `map_len >= page_offset` bytes long.
        let reg = unsafe { addr.cast::<u8>().add(span.page_offset) };
        NonNull::new(reg).ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let page_offset = ptr.as_ptr() as usize % self.page_size;
        // SAFETY: `ptr` was advanced by exactly `page_offset` from the
        // page-aligned address mmap returned in `map`.
        let addr = unsafe { ptr.as_ptr().sub(page_offset) };
        // SAFETY: the caller guarantees the range came from `map`.
        // `map` already checked that `len + page_offset` fits.
        let rc = unsafe { libc::munmap(addr.cast::<libc::c_void>(), len + page_offset) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close(&self, handle: File) -> io::Result<()> {
        let fd = handle.into_raw_fd();
        // SAFETY: `fd` is owned here and not used again.
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
