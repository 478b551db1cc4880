use clap::{Parser, Subcommand};
use fpga_bridge::monitor::Monitor;
use fpga_bridge::peripherals::{Peripheral, PeripheralMap};
#[cfg(unix)]
use fpga_bridge::DevMem;
use fpga_bridge::{MemDevice, RegisterView, SimulatedMemory, Window};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Physical memory device to map from
    #[arg(long, default_value = fpga_bridge::DEV_MEM)]
    device: PathBuf,

    /// JSON file with additional peripherals (replaces built-ins of the same name)
    #[arg(long)]
    map: Option<PathBuf>,

    /// Run against simulated memory instead of the physical memory device
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List known peripherals and their registers
    List,

    #[command(flatten)]
    Access(Access),
}

/// Commands that map a peripheral's window.
#[derive(Subcommand, Debug)]
enum Access {
    /// Read registers once (all registers when none are named)
    Read {
        peripheral: String,
        registers: Vec<String>,
    },

    /// Write one register
    Write {
        peripheral: String,
        register: String,
        /// Value, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_u32)]
        value: u32,
    },

    /// Drive the LED register with a counter and print all registers
    Watch {
        peripheral: String,

        /// Delay between iterations (default: the peripheral's poll interval)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many iterations (default: until Ctrl-C)
        #[arg(long)]
        count: Option<u64>,

        /// Register to drive (default: the peripheral's LED register)
        #[arg(long)]
        led_register: Option<String>,

        /// Only read, never write
        #[arg(long)]
        read_only: bool,
    },
}

impl Access {
    fn peripheral(&self) -> &str {
        match self {
            Access::Read { peripheral, .. }
            | Access::Write { peripheral, .. }
            | Access::Watch { peripheral, .. } => peripheral.as_str(),
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid 32-bit value `{}`: {}", s, e))
}

static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

#[cfg(unix)]
extern "C" fn on_sigint(_signum: libc::c_int) {
    if let Some(stop) = STOP.get() {
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Route Ctrl-C to `stop` so the watch loop ends and the window is released.
#[cfg(unix)]
fn install_sigint_handler(stop: Arc<AtomicBool>) {
    if STOP.set(stop).is_err() {
        return;
    }
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is signal safe.
    let prev = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if prev == libc::SIG_ERR {
        log::warn!("cannot install SIGINT handler: {}", io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn install_sigint_handler(stop: Arc<AtomicBool>) {
    let _ = STOP.set(stop);
    log::debug!("no SIGINT handler on this platform; watch runs until --count");
}

fn print_peripheral(p: &Peripheral) {
    println!(
        "{:<10} base 0x{:08X}  length 0x{:X}",
        p.name, p.base, p.length
    );
    for reg in p.registers.iter() {
        let led = if p.led_register.as_deref() == Some(reg.name.as_str()) {
            "  (led)"
        } else {
            ""
        };
        println!("    {:<10} {:<10} +0x{:02X}{}", reg.name, reg.label(), reg.offset, led);
    }
}

fn run<D: MemDevice>(
    device: D,
    peripheral: &Peripheral,
    command: Access,
) -> Result<(), Box<dyn std::error::Error>> {
    let window = Window::map(device, peripheral.base, peripheral.length)?;
    let view = RegisterView::new(&window, &peripheral.registers)?;

    match command {
        Access::Read { registers, .. } => {
            if registers.is_empty() {
                for (name, value) in view.snapshot()? {
                    println!("{:<10} 0x{:08X}", name, value);
                }
            } else {
                for name in &registers {
                    println!("{:<10} 0x{:08X}", name, view.read(name)?);
                }
            }
        }
        Access::Write {
            register, value, ..
        } => {
            view.write(&register, value)?;
            log::info!("{}.{} <- 0x{:08X}", peripheral.name, register, value);
        }
        Access::Watch {
            interval_ms,
            count,
            led_register,
            read_only,
            ..
        } => {
            let interval = interval_ms.or(peripheral.poll_interval_ms).unwrap_or(100);
            let led = if read_only {
                None
            } else {
                led_register.or_else(|| peripheral.led_register.clone())
            };

            let stop = Arc::new(AtomicBool::new(false));
            install_sigint_handler(Arc::clone(&stop));
            let mut monitor = Monitor::new(Duration::from_millis(interval)).stop_flag(stop);
            if let Some(n) = count {
                monitor = monitor.iterations(n);
            }

            let done = monitor.run(&view, led.as_deref(), &mut io::stdout().lock())?;
            log::info!("{}: {} iterations", peripheral.name, done);
        }
    }

    drop(view);
    window.unmap();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut peripherals = PeripheralMap::builtin();
    if let Some(path) = &args.map {
        peripherals.load(path)?;
    }

    let access = match args.command {
        Command::List => {
            for p in peripherals.iter() {
                print_peripheral(p);
            }
            return Ok(());
        }
        Command::Access(access) => access,
    };
    let peripheral = peripherals.get(access.peripheral())?.clone();

    if args.simulate {
        let mem = SimulatedMemory::new(peripheral.base, peripheral.length);
        return run(&mem, &peripheral, access);
    }
    run_device(&args.device, &peripheral, access)
}

#[cfg(unix)]
fn run_device(
    path: &Path,
    peripheral: &Peripheral,
    access: Access,
) -> Result<(), Box<dyn std::error::Error>> {
    run(DevMem::with_path(path), peripheral, access)
}

#[cfg(not(unix))]
fn run_device(
    path: &Path,
    _peripheral: &Peripheral,
    _access: Access,
) -> Result<(), Box<dyn std::error::Error>> {
    Err(format!(
        "physical memory device {} is not supported on this platform; use --simulate",
        path.display()
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0xFF"), Ok(0xFF));
        assert_eq!(parse_u32("0X8000_0000"), Ok(0x8000_0000));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("0x1_0000_0000").is_err());
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn test_args_parse_watch() {
        let args = Args::try_parse_from([
            "fpga-bridge", "--simulate", "watch", "fpga-mgr", "--count", "5",
        ])
        .unwrap();
        assert!(args.simulate);
        assert_eq!(args.device, PathBuf::from("/dev/mem"));
        match args.command {
            Command::Access(Access::Watch { peripheral, count, .. }) => {
                assert_eq!(peripheral, "fpga-mgr");
                assert_eq!(count, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_args_parse_list_and_read() {
        let args = Args::try_parse_from(["fpga-bridge", "list"]).unwrap();
        assert!(matches!(args.command, Command::List));

        let args = Args::try_parse_from(["fpga-bridge", "read", "h2f-lw", "reg0", "reg2"]).unwrap();
        let Command::Access(access) = args.command else {
            panic!("expected an access command");
        };
        assert_eq!(access.peripheral(), "h2f-lw");
        assert!(matches!(access, Access::Read { registers, .. } if registers == ["reg0", "reg2"]));
    }

    #[test]
    fn test_simulated_write_then_read() {
        let p = fpga_bridge::peripherals::fpga_mgr();
        let mem = SimulatedMemory::new(p.base, p.length);
        run(
            &mem,
            &p,
            Access::Write {
                peripheral: p.name.clone(),
                register: "gpo".into(),
                value: 0x5A,
            },
        )
        .unwrap();
        assert_eq!(mem.open_handles(), 0);

        let window = Window::map(&mem, p.base, p.length).unwrap();
        assert_eq!(window.read(fpga_bridge::peripherals::FPGA_MGR_GPO).unwrap(), 0x5A);
    }
}
