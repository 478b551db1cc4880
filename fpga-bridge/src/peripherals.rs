//! Peripheral address map.
//!
//! Physical layout of the windows the tool knows about. The built-in table
//! covers the Cyclone V HPS lightweight bridge and FPGA manager; more
//! peripherals can be loaded from a JSON file of the form
//!
//! ```json
//! [
//!   {
//!     "name": "pio",
//!     "base": 4280287232,
//!     "length": 16,
//!     "registers": [{ "name": "data", "offset": 0 }],
//!     "led_register": "data",
//!     "poll_interval_ms": 50
//!   }
//! ]
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registers::RegisterMap;
use crate::window::WindowError;

/// HPS-to-FPGA lightweight bridge.
pub const H2F_LW_BASE: u64 = 0xFF20_0000;
pub const H2F_LW_SIZE: usize = 0x0020_0000;

/// FPGA manager register block.
pub const FPGA_MGR_BASE: u64 = 0xFF70_6000;
pub const FPGA_MGR_SIZE: usize = 0x1C;

pub const FPGA_MGR_STAT: usize = 0x00;
pub const FPGA_MGR_CTRL: usize = 0x04;
pub const FPGA_MGR_GPO: usize = 0x10;
pub const FPGA_MGR_GPI: usize = 0x14;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read peripheral map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid peripheral map {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown peripheral `{0}`")]
    UnknownPeripheral(String),

    #[error("peripheral `{name}`: {source}")]
    Layout {
        name: String,
        #[source]
        source: WindowError,
    },
}

/// One memory-mapped peripheral: where it lives and what it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub name: String,
    pub base: u64,
    pub length: usize,
    pub registers: RegisterMap,
    /// Register the watch loop drives with the LED counter.
    #[serde(default)]
    pub led_register: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl Peripheral {
    /// Reject register tables that do not fit the window, and an LED
    /// register that is not in the table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let layout = |source: WindowError| ConfigError::Layout {
            name: self.name.clone(),
            source,
        };
        self.registers.validate(self.length).map_err(&layout)?;
        if let Some(led) = &self.led_register {
            if self.registers.offset(led).is_none() {
                return Err(layout(WindowError::UnknownRegister(led.clone())));
            }
        }
        Ok(())
    }
}

/// Lightweight bridge: four sequential registers at the start of the window.
pub fn h2f_lw() -> Peripheral {
    Peripheral {
        name: "h2f-lw".to_string(),
        base: H2F_LW_BASE,
        length: H2F_LW_SIZE,
        registers: RegisterMap::new()
            .with_label("reg0", "Reg0", 0x0)
            .with_label("reg1", "Reg1", 0x4)
            .with_label("reg2", "Reg2", 0x8)
            .with_label("reg3", "Reg3", 0xC),
        led_register: Some("reg0".to_string()),
        poll_interval_ms: Some(10),
    }
}

/// FPGA manager status, control and general purpose I/O.
pub fn fpga_mgr() -> Peripheral {
    Peripheral {
        name: "fpga-mgr".to_string(),
        base: FPGA_MGR_BASE,
        length: FPGA_MGR_SIZE,
        registers: RegisterMap::new()
            .with_label("stat", "Status", FPGA_MGR_STAT)
            .with_label("ctrl", "Control", FPGA_MGR_CTRL)
            .with_label("gpi", "GPI", FPGA_MGR_GPI)
            .with_label("gpo", "GPO", FPGA_MGR_GPO),
        led_register: Some("gpo".to_string()),
        poll_interval_ms: Some(100),
    }
}

/// Set of peripherals addressable by name.
#[derive(Debug, Clone, Default)]
pub struct PeripheralMap {
    peripherals: Vec<Peripheral>,
}

impl PeripheralMap {
    pub fn builtin() -> Self {
        Self {
            peripherals: vec![h2f_lw(), fpga_mgr()],
        }
    }

    /// Parse and validate a JSON list of peripherals.
    pub fn from_json(path: &Path, text: &str) -> Result<Vec<Peripheral>, ConfigError> {
        let peripherals: Vec<Peripheral> =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        peripherals.iter().try_for_each(Peripheral::validate)?;
        Ok(peripherals)
    }

    /// Load peripherals from `path`. Entries replace built-ins of the same
    /// name.
    pub fn load(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for p in Self::from_json(path, &text)? {
            log::debug!(
                "peripheral {} at {:#010x}+{:#x} from {}",
                p.name,
                p.base,
                p.length,
                path.display()
            );
            self.insert(p);
        }
        Ok(())
    }

    pub fn insert(&mut self, peripheral: Peripheral) {
        match self.peripherals.iter_mut().find(|p| p.name == peripheral.name) {
            Some(slot) => *slot = peripheral,
            None => self.peripherals.push(peripheral),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Peripheral, ConfigError> {
        self.peripherals
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownPeripheral(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peripheral> {
        self.peripherals.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        for p in PeripheralMap::builtin().iter() {
            p.validate().unwrap();
        }
    }

    #[test]
    fn test_fpga_mgr_layout() {
        let p = fpga_mgr();
        assert_eq!(p.base, 0xFF70_6000);
        assert_eq!(p.registers.offset("gpo"), Some(0x10));
        assert_eq!(p.registers.offset("gpi"), Some(0x14));
        let order: Vec<_> = p.registers.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, ["stat", "ctrl", "gpi", "gpo"]);
        let labels: Vec<_> = p.registers.iter().map(|r| r.label()).collect();
        assert_eq!(labels, ["Status", "Control", "GPI", "GPO"]);
    }

    #[test]
    fn test_unknown_peripheral() {
        let map = PeripheralMap::builtin();
        assert!(map.get("h2f-lw").is_ok());
        assert!(matches!(map.get("hps-gpio"), Err(ConfigError::UnknownPeripheral(_))));
    }

    #[test]
    fn test_json_overrides_builtin() {
        let text = r#"[
            {"name": "h2f-lw", "base": 4280287232, "length": 8,
             "registers": [{"name": "leds", "offset": 0}, {"name": "keys", "offset": 4}],
             "led_register": "leds"},
            {"name": "pio", "base": 4280291328, "length": 4,
             "registers": [{"name": "data", "offset": 0}]}
        ]"#;
        let mut map = PeripheralMap::builtin();
        for p in PeripheralMap::from_json(Path::new("test.json"), text).unwrap() {
            map.insert(p);
        }

        let bridge = map.get("h2f-lw").unwrap();
        assert_eq!(bridge.length, 8);
        assert_eq!(bridge.led_register.as_deref(), Some("leds"));
        assert_eq!(bridge.poll_interval_ms, None);
        assert_eq!(map.get("pio").unwrap().base, 0xFF20_1000);
        assert_eq!(map.iter().count(), 3);
    }

    #[test]
    fn test_json_register_past_window_rejected() {
        let text = r#"[{"name": "bad", "base": 0, "length": 4,
                       "registers": [{"name": "r", "offset": 4}]}]"#;
        let err = PeripheralMap::from_json(Path::new("bad.json"), text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Layout { source: WindowError::OutOfBounds { offset: 4, len: 4 }, .. }
        ));
    }

    #[test]
    fn test_json_led_register_must_exist() {
        let text = r#"[{"name": "bad", "base": 0, "length": 4,
                       "registers": [{"name": "r", "offset": 0}], "led_register": "x"}]"#;
        assert!(matches!(
            PeripheralMap::from_json(Path::new("bad.json"), text),
            Err(ConfigError::Layout { source: WindowError::UnknownRegister(_), .. })
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            PeripheralMap::from_json(Path::new("x.json"), "{"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
