//! User-space access to memory-mapped FPGA bridge registers.
//!
//! A [`Window`] maps a physical address range through a [`MemDevice`]
//! (normally [`DevMem`], i.e. `/dev/mem`) and hands out bounds-checked,
//! volatile 32-bit register accesses. [`RegisterView`] adds names on top.
//!
//! ```no_run
//! use fpga_bridge::{DevMem, RegisterView, Window, peripherals};
//!
//! let mgr = peripherals::fpga_mgr();
//! let window = Window::map(DevMem::new(), mgr.base, mgr.length)?;
//! let view = RegisterView::new(&window, &mgr.registers)?;
//! view.write("gpo", 0x55)?;
//! println!("gpi = {:#010x}", view.read("gpi")?);
//! drop(view);
//! window.unmap();
//! # Ok::<(), fpga_bridge::WindowError>(())
//! ```

pub mod window;
#[cfg(unix)]
pub mod devmem;
pub mod sim;
pub mod registers;
pub mod peripherals;
pub mod monitor;

#[cfg(unix)]
pub use devmem::DevMem;
pub use registers::{Register, RegisterMap, RegisterView};
pub use sim::SimulatedMemory;
pub use window::{MemDevice, Window, WindowError};

/// Default physical memory device on Linux.
pub const DEV_MEM: &str = "/dev/mem";
