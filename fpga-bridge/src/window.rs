//! Physical memory windows.
//!
//! A [`Window`] owns a device handle and a shared mapping of a physical
//! address range. It is either fully mapped or dropped; there is no
//! half-open state visible to callers. Register accesses are 32 bits wide,
//! naturally aligned, and bounds checked against the mapped length before
//! the hardware is touched.

use std::io;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use thiserror::Error;

/// Width of every register access in bytes.
pub const REGISTER_WIDTH: usize = 4;

/// Errors raised while mapping a window or accessing a register in it.
#[derive(Debug, Error)]
pub enum WindowError {
    #[error("cannot open physical memory device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot map {len:#x} bytes at physical address {base:#010x}: {source}")]
    Mapping {
        base: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("register offset {offset:#x} is outside the {len:#x}-byte window")]
    OutOfBounds { offset: usize, len: usize },

    #[error("register offset {offset:#x} is not aligned to 4 bytes")]
    Misaligned { offset: usize },

    #[error("unknown register `{0}`")]
    UnknownRegister(String),
}

/// Source of physical memory mappings.
///
/// `open` and `close` bracket the lifetime of a device handle, `map` and
/// `unmap` the lifetime of a mapping made through that handle. [`Window`]
/// drives these in the right order on every path, including failures.
pub trait MemDevice {
    type Handle;

    /// Path or name reported in [`WindowError::DeviceOpen`].
    fn path(&self) -> PathBuf;

    fn open(&self) -> io::Result<Self::Handle>;

    /// Map `len` bytes of physical memory starting at `base`, readable and
    /// writable, shared with the rest of the system.
    fn map(&self, handle: &Self::Handle, base: u64, len: usize) -> io::Result<NonNull<u8>>;

    /// Undo a mapping returned by [`MemDevice::map`].
    ///
    /// # Safety
    /// `ptr` and `len` must come from a successful `map` call on this device
    /// and the range must not be accessed afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    fn close(&self, handle: Self::Handle) -> io::Result<()>;
}

impl<D: MemDevice + ?Sized> MemDevice for &D {
    type Handle = D::Handle;

    fn path(&self) -> PathBuf {
        (**self).path()
    }

    fn open(&self) -> io::Result<Self::Handle> {
        (**self).open()
    }

    fn map(&self, handle: &Self::Handle, base: u64, len: usize) -> io::Result<NonNull<u8>> {
        (**self).map(handle, base, len)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: forwarded unchanged, the caller upholds the contract.
        unsafe { (**self).unmap(ptr, len) }
    }

    fn close(&self, handle: Self::Handle) -> io::Result<()> {
        (**self).close(handle)
    }
}

impl<D: MemDevice + ?Sized> MemDevice for Arc<D> {
    type Handle = D::Handle;

    fn path(&self) -> PathBuf {
        (**self).path()
    }

    fn open(&self) -> io::Result<Self::Handle> {
        (**self).open()
    }

    fn map(&self, handle: &Self::Handle, base: u64, len: usize) -> io::Result<NonNull<u8>> {
        (**self).map(handle, base, len)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: forwarded unchanged, the caller upholds the contract.
        unsafe { (**self).unmap(ptr, len) }
    }

    fn close(&self, handle: Self::Handle) -> io::Result<()> {
        (**self).close(handle)
    }
}

/// Check that a 4-byte register at `offset` lies inside a window of `len`
/// bytes and is naturally aligned.
pub fn check_register(offset: usize, len: usize) -> Result<(), WindowError> {
    match offset.checked_add(REGISTER_WIDTH) {
        Some(end) if end <= len => {}
        _ => return Err(WindowError::OutOfBounds { offset, len }),
    }
    if offset % REGISTER_WIDTH != 0 {
        return Err(WindowError::Misaligned { offset });
    }
    Ok(())
}

/// Live mapping state. Taken exactly once on release.
struct Mapped<H> {
    handle: H,
    ptr: NonNull<u8>,
}

/// A mapped range of physical memory.
pub struct Window<D: MemDevice> {
    device: D,
    base: u64,
    len: usize,
    mapped: Option<Mapped<D::Handle>>,
}

// SAFETY: the window only hands out volatile, bounds-checked u32 accesses
// through `&self`. Each access is a single bus-width operation; ordering of
// multi-register sequences is left to the caller.
unsafe impl<D> Send for Window<D>
where
    D: MemDevice + Send,
    D::Handle: Send,
{
}
unsafe impl<D> Sync for Window<D>
where
    D: MemDevice + Sync,
    D::Handle: Sync,
{
}

impl<D: MemDevice> Window<D> {
    /// Open `device` and map `len` bytes at physical address `base`.
    ///
    /// Either both steps succeed or nothing stays acquired: a handle opened
    /// here is closed again before a mapping failure is reported.
    pub fn map(device: D, base: u64, len: usize) -> Result<Self, WindowError> {
        if len == 0 {
            return Err(WindowError::Mapping {
                base,
                len,
                source: io::Error::new(io::ErrorKind::InvalidInput, "window length is zero"),
            });
        }
        if base % REGISTER_WIDTH as u64 != 0 {
            return Err(WindowError::Mapping {
                base,
                len,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "physical base is not 32-bit aligned",
                ),
            });
        }
        if base.checked_add(len as u64).is_none() {
            return Err(WindowError::Mapping {
                base,
                len,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "window end overflows the physical address space",
                ),
            });
        }

        let handle = device.open().map_err(|source| WindowError::DeviceOpen {
            path: device.path(),
            source,
        })?;

        let ptr = match device.map(&handle, base, len) {
            Ok(ptr) => ptr,
            Err(source) => {
                if let Err(e) = device.close(handle) {
                    log::warn!("close of {} after failed map: {}", device.path().display(), e);
                }
                return Err(WindowError::Mapping { base, len, source });
            }
        };

        log::debug!(
            "mapped {:#x} bytes at {:#010x} from {} -> {:p}",
            len,
            base,
            device.path().display(),
            ptr
        );

        Ok(Self {
            device,
            base,
            len,
            mapped: Some(Mapped { handle, ptr }),
        })
    }

    /// Physical base address of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Release the mapping and the device handle.
    ///
    /// Consumes the window, so neither a second release nor any register
    /// view borrowed from it can outlive this call. Failures are logged and
    /// otherwise ignored.
    pub fn unmap(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(Mapped { handle, ptr }) = self.mapped.take() else {
            return;
        };

        // SAFETY: `ptr`/`len` come from the successful map in `Window::map`
        // and `mapped` has been taken, so no further access goes through it.
        if let Err(e) = unsafe { self.device.unmap(ptr, self.len) } {
            log::warn!("unmap of {:#010x}+{:#x} failed: {}", self.base, self.len, e);
        }
        if let Err(e) = self.device.close(handle) {
            log::warn!("close of {} failed: {}", self.device.path().display(), e);
        }
        log::debug!("unmapped {:#x} bytes at {:#010x}", self.len, self.base);
    }

    /// Virtual address of the register at `offset`.
    pub fn register_pointer(&self, offset: usize) -> Result<NonNull<u32>, WindowError> {
        check_register(offset, self.len)?;
        let mapped = self
            .mapped
            .as_ref()
            .ok_or(WindowError::OutOfBounds { offset, len: 0 })?;
        // SAFETY: offset + 4 <= len, so the result stays inside the mapping.
        let reg = unsafe { mapped.ptr.add(offset) };
        Ok(reg.cast::<u32>())
    }

    /// Single volatile 32-bit load from the register at `offset`.
    ///
    /// Every call reaches the device; two reads of the same offset may
    /// legitimately return different values.
    pub fn read(&self, offset: usize) -> Result<u32, WindowError> {
        let reg = self.register_pointer(offset)?;
        // SAFETY: bounds and alignment checked, the mapping is live while
        // `self` is borrowed.
        let value = unsafe { ptr::read_volatile(reg.as_ptr()) };
        log::trace!("read  {:#010x} = {:#010x}", self.base + offset as u64, value);
        Ok(value)
    }

    /// Single volatile 32-bit store to the register at `offset`.
    ///
    /// Never skipped, even when `value` matches the last value written;
    /// the store itself may trigger the hardware.
    pub fn write(&self, offset: usize, value: u32) -> Result<(), WindowError> {
        let reg = self.register_pointer(offset)?;
        log::trace!("write {:#010x} = {:#010x}", self.base + offset as u64, value);
        // SAFETY: see `read`.
        unsafe { ptr::write_volatile(reg.as_ptr(), value) };
        Ok(())
    }

    /// Read the register, pass the value through `f` and write the result.
    ///
    /// This is two independent volatile accesses, not an atomic operation:
    /// a concurrent writer (another thread or the hardware) can change the
    /// register in between. Returns the value written.
    pub fn modify<F>(&self, offset: usize, f: F) -> Result<u32, WindowError>
    where
        F: FnOnce(u32) -> u32,
    {
        let value = f(self.read(offset)?);
        self.write(offset, value)?;
        Ok(value)
    }
}

impl<D: MemDevice> Drop for Window<D> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<D: MemDevice> std::fmt::Debug for Window<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("base", &format_args!("{:#010x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}
