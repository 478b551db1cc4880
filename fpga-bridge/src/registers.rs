//! Named register views over a mapped window.

use serde::{Deserialize, Serialize};

use crate::window::{MemDevice, Window, WindowError, check_register};

/// One named 32-bit register at a byte offset within its window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub offset: usize,
    /// Column heading for tables; the name is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Register {
    pub fn new(name: impl Into<String>, offset: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            label: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Register table in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterMap {
    registers: Vec<Register>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a register. Lookups return the first entry with a given name.
    pub fn with(mut self, name: impl Into<String>, offset: usize) -> Self {
        self.registers.push(Register::new(name, offset));
        self
    }

    /// Append a register with a display label distinct from its name.
    pub fn with_label(
        mut self,
        name: impl Into<String>,
        label: impl Into<String>,
        offset: usize,
    ) -> Self {
        self.registers.push(Register::new(name, offset).labeled(label));
        self
    }

    pub fn offset(&self, name: &str) -> Option<usize> {
        self.registers
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Check every register against a window of `len` bytes.
    pub fn validate(&self, len: usize) -> Result<(), WindowError> {
        self.registers
            .iter()
            .try_for_each(|r| check_register(r.offset, len))
    }
}

impl FromIterator<Register> for RegisterMap {
    fn from_iter<I: IntoIterator<Item = Register>>(iter: I) -> Self {
        Self {
            registers: iter.into_iter().collect(),
        }
    }
}

/// Access to the registers of one window by name.
///
/// The view borrows the window; [`Window::unmap`] takes the window by value,
/// so a view can never be used after its window is gone.
pub struct RegisterView<'w, D: MemDevice> {
    window: &'w Window<D>,
    map: &'w RegisterMap,
}

impl<'w, D: MemDevice> RegisterView<'w, D> {
    /// Build a view, rejecting any register that does not fit the window.
    pub fn new(window: &'w Window<D>, map: &'w RegisterMap) -> Result<Self, WindowError> {
        map.validate(window.len())?;
        Ok(Self { window, map })
    }

    pub fn window(&self) -> &'w Window<D> {
        self.window
    }

    pub fn offset(&self, name: &str) -> Result<usize, WindowError> {
        self.map
            .offset(name)
            .ok_or_else(|| WindowError::UnknownRegister(name.to_string()))
    }

    /// Register names in table order.
    pub fn names(&self) -> impl Iterator<Item = &'w str> {
        self.map.iter().map(|r| r.name.as_str())
    }

    /// Display labels in table order.
    pub fn labels(&self) -> impl Iterator<Item = &'w str> {
        self.map.iter().map(Register::label)
    }

    pub fn read(&self, name: &str) -> Result<u32, WindowError> {
        self.window.read(self.offset(name)?)
    }

    pub fn write(&self, name: &str, value: u32) -> Result<(), WindowError> {
        self.window.write(self.offset(name)?, value)
    }

    /// Read-modify-write by name. Not atomic, see [`Window::modify`].
    pub fn modify<F>(&self, name: &str, f: F) -> Result<u32, WindowError>
    where
        F: FnOnce(u32) -> u32,
    {
        self.window.modify(self.offset(name)?, f)
    }

    /// Read every register once, in table order.
    ///
    /// The reads are independent; registers may change between them.
    pub fn snapshot(&self) -> Result<Vec<(&'w str, u32)>, WindowError> {
        self.map
            .iter()
            .map(|r| self.window.read(r.offset).map(|v| (r.name.as_str(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedMemory;

    const MGR_BASE: u64 = 0xFF70_6000;

    fn fpga_mgr_map() -> RegisterMap {
        RegisterMap::new()
            .with("stat", 0x00)
            .with("ctrl", 0x04)
            .with("gpi", 0x14)
            .with("gpo", 0x10)
    }

    #[test]
    fn test_view_reads_and_writes_by_name() {
        let mem = SimulatedMemory::new(MGR_BASE, 0x1C);
        let window = Window::map(&mem, MGR_BASE, 0x1C).unwrap();
        let map = fpga_mgr_map();
        let view = RegisterView::new(&window, &map).unwrap();

        view.write("gpo", 0xA5).unwrap();
        assert_eq!(view.read("gpo").unwrap(), 0xA5);
        assert_eq!(window.read(0x10).unwrap(), 0xA5);
        assert_eq!(view.offset("gpi").unwrap(), 0x14);
    }

    #[test]
    fn test_unknown_register() {
        let mem = SimulatedMemory::new(MGR_BASE, 0x1C);
        let window = Window::map(&mem, MGR_BASE, 0x1C).unwrap();
        let map = fpga_mgr_map();
        let view = RegisterView::new(&window, &map).unwrap();

        assert!(matches!(
            view.read("nope"),
            Err(WindowError::UnknownRegister(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_view_rejects_register_past_window() {
        let mem = SimulatedMemory::new(MGR_BASE, 0x1C);
        let window = Window::map(&mem, MGR_BASE, 0x14).unwrap();
        let map = fpga_mgr_map();

        assert!(matches!(
            RegisterView::new(&window, &map),
            Err(WindowError::OutOfBounds { offset: 0x14, len: 0x14 })
        ));
    }

    #[test]
    fn test_snapshot_keeps_table_order() {
        let mem = SimulatedMemory::new(MGR_BASE, 0x1C);
        let window = Window::map(&mem, MGR_BASE, 0x1C).unwrap();
        window.write(0x14, 2).unwrap();
        window.write(0x10, 1).unwrap();
        let map = fpga_mgr_map();
        let view = RegisterView::new(&window, &map).unwrap();

        let snap = view.snapshot().unwrap();
        assert_eq!(snap, vec![("stat", 0), ("ctrl", 0), ("gpi", 2), ("gpo", 1)]);
        assert_eq!(view.names().collect::<Vec<_>>(), ["stat", "ctrl", "gpi", "gpo"]);
    }

    #[test]
    fn test_modify_by_name() {
        let mem = SimulatedMemory::new(MGR_BASE, 0x1C);
        let window = Window::map(&mem, MGR_BASE, 0x1C).unwrap();
        let map = fpga_mgr_map();
        let view = RegisterView::new(&window, &map).unwrap();

        view.write("ctrl", 0x0000_0100).unwrap();
        assert_eq!(view.modify("ctrl", |v| v & !0x100).unwrap(), 0);
        assert_eq!(view.read("ctrl").unwrap(), 0);
    }

    #[test]
    fn test_labels_fall_back_to_names() {
        let mem = SimulatedMemory::new(MGR_BASE, 0x1C);
        let window = Window::map(&mem, MGR_BASE, 0x1C).unwrap();
        let map = RegisterMap::new()
            .with_label("stat", "Status", 0x00)
            .with("ctrl", 0x04);
        let view = RegisterView::new(&window, &map).unwrap();

        assert_eq!(view.labels().collect::<Vec<_>>(), ["Status", "ctrl"]);
        assert_eq!(view.read("stat").unwrap(), 0);
        assert!(matches!(view.read("Status"), Err(WindowError::UnknownRegister(_))));
    }

    #[test]
    fn test_register_map_json_shape() {
        let map: RegisterMap = serde_json::from_str(
            r#"[{"name":"reg0","offset":0},{"name":"reg1","offset":4,"label":"Keys"}]"#,
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.offset("reg1"), Some(4));
        let labels: Vec<_> = map.iter().map(Register::label).collect();
        assert_eq!(labels, ["reg0", "Keys"]);
        assert!(map.validate(8).is_ok());
        assert!(map.validate(7).is_err());

        let text = serde_json::to_string(&map).unwrap();
        assert!(text.starts_with(r#"[{"name":"reg0","offset":0},"#));
    }
}
