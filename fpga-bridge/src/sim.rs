//! Simulated physical memory.
//!
//! `SimulatedMemory` stands in for `/dev/mem` on machines without the FPGA
//! bridge. It backs a fixed physical range with zeroed RAM that simply
//! echoes stores, counts open handles and live mappings, and can be told to
//! fail any of the open, map, unmap and close steps.

use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::window::MemDevice;

/// Handle returned by [`SimulatedMemory::open`].
#[derive(Debug, PartialEq, Eq)]
pub struct SimHandle(u32);

/// Echoing backing store covering `base..base + size` physical addresses.
pub struct SimulatedMemory {
    base: u64,
    size: usize,
    // Owned `Box<[u32]>` turned into a raw pointer so mappings can alias it
    // without holding Rust references.
    words: NonNull<u32>,

    next_handle: AtomicU32,
    open_handles: AtomicUsize,
    live_mappings: AtomicUsize,
    open_attempts: AtomicUsize,
    map_attempts: AtomicUsize,

    deny_open: AtomicBool,
    fail_map: AtomicBool,
    fail_unmap: AtomicBool,
    fail_close: AtomicBool,
}

// SAFETY: the backing words are only touched through volatile u32 accesses
// made by windows; the bookkeeping is atomic.
unsafe impl Send for SimulatedMemory {}
unsafe impl Sync for SimulatedMemory {}

impl SimulatedMemory {
    /// Create `size` bytes of zeroed memory starting at physical `base`.
    /// `size` is rounded up to a whole number of words.
    pub fn new(base: u64, size: usize) -> Self {
        let nwords = size.div_ceil(4);
        let boxed: Box<[u32]> = vec![0u32; nwords].into_boxed_slice();
        let words = NonNull::from(Box::leak(boxed)).cast::<u32>();
        Self {
            base,
            size: nwords * 4,
            words,
            next_handle: AtomicU32::new(3),
            open_handles: AtomicUsize::new(0),
            live_mappings: AtomicUsize::new(0),
            open_attempts: AtomicUsize::new(0),
            map_attempts: AtomicUsize::new(0),
            deny_open: AtomicBool::new(false),
            fail_map: AtomicBool::new(false),
            fail_unmap: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Make subsequent opens fail with `PermissionDenied`.
    pub fn deny_open(&self, deny: bool) {
        self.deny_open.store(deny, Ordering::SeqCst);
    }

    /// Make subsequent maps fail with `OutOfMemory`.
    pub fn fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent unmaps fail with `InvalidInput`. The mapping stays
    /// counted as live.
    pub fn fail_unmap(&self, fail: bool) {
        self.fail_unmap.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent closes fail with `Interrupted`. Like `close(2)`, the
    /// handle is released anyway.
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Mappings made and not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn map_attempts(&self) -> usize {
        self.map_attempts.load(Ordering::SeqCst)
    }

    fn byte_offset(&self, base: u64, len: usize) -> Option<usize> {
        let start = base.checked_sub(self.base)?;
        let start = usize::try_from(start).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.size).then_some(start)
    }
}

impl MemDevice for SimulatedMemory {
    type Handle = SimHandle;

    fn path(&self) -> PathBuf {
        PathBuf::from("<simulated>")
    }

    fn open(&self) -> io::Result<SimHandle> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if self.deny_open.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(SimHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    fn map(&self, _handle: &SimHandle, base: u64, len: usize) -> io::Result<NonNull<u8>> {
        self.map_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_map.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }
        let offset = self.byte_offset(base, len).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {:#x}+{:#x} outside simulated memory {:#x}+{:#x}",
                    base, len, self.base, self.size
                ),
            )
        })?;
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        // SAFETY: offset + len <= size, so the pointer stays in the allocation.
        Ok(unsafe { self.words.cast::<u8>().add(offset) })
    }

    unsafe fn unmap(&self, _ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        if self.fail_unmap.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.live_mappings.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _handle: SimHandle) -> io::Result<()> {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        Ok(())
    }
}

impl Drop for SimulatedMemory {
    fn drop(&mut self) {
        let nwords = self.size / 4;
        // SAFETY: `words` came from `Box::leak` of a slice of `nwords` words.
        // Windows borrow or share the device, so none is alive here.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.words.as_ptr(),
                nwords,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounds_up_to_words() {
        let mem = SimulatedMemory::new(0xFF70_6000, 0x1A);
        assert_eq!(mem.size(), 0x1C);
    }

    #[test]
    fn test_map_bounds() {
        let mem = SimulatedMemory::new(0x1000, 0x100);
        let h = mem.open().unwrap();
        assert!(mem.map(&h, 0x1000, 0x100).is_ok());
        assert!(mem.map(&h, 0x10F0, 0x10).is_ok());
        assert!(mem.map(&h, 0x0FFC, 0x10).is_err());
        assert!(mem.map(&h, 0x10F0, 0x20).is_err());
        assert_eq!(mem.live_mappings(), 2);
        assert_eq!(mem.map_attempts(), 4);
        mem.close(h).unwrap();
        assert_eq!(mem.open_handles(), 0);
    }

    #[test]
    fn test_fault_injection() {
        let mem = SimulatedMemory::new(0, 0x10);
        mem.deny_open(true);
        let err = mem.open().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(mem.open_handles(), 0);

        mem.deny_open(false);
        mem.fail_map(true);
        let h = mem.open().unwrap();
        assert!(mem.map(&h, 0, 4).is_err());
        assert_eq!(mem.live_mappings(), 0);
        assert_eq!(mem.open_attempts(), 2);
    }

    #[test]
    fn test_release_fault_injection() {
        let mem = SimulatedMemory::new(0, 0x10);
        let h = mem.open().unwrap();
        let ptr = mem.map(&h, 0, 4).unwrap();

        mem.fail_unmap(true);
        let err = unsafe { mem.unmap(ptr, 4) }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(mem.live_mappings(), 1);

        mem.fail_close(true);
        let err = mem.close(h).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(mem.open_handles(), 0);
    }

    #[test]
    fn test_handles_are_distinct() {
        let mem = SimulatedMemory::new(0, 0x10);
        let a = mem.open().unwrap();
        let b = mem.open().unwrap();
        assert_ne!(a, b);
        assert_eq!(mem.open_handles(), 2);
    }
}
