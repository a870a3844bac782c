//! The register model: an arena of physical registers, bitfield projections
//! onto logical registers, and the per-hart register file. Fields reference
//! physical registers by stable arena id, so the logical layer, linked
//! register views and banked backings never form ownership cycles.

pub mod dependence;
pub mod reserver;

use std::collections::HashMap;

use bitflags::bitflags;
use log::{debug, trace};

use crate::error::Error;
use crate::rng::Rng;

bitflags! {
    /// Physical register attributes.
    pub struct RegisterAttributes: u32 {
        /// The register carries a meaningful value.
        const HAS_VALUE = 1 << 0;
        /// The register may be read by generated code.
        const READABLE  = 1 << 1;
        /// The register may be written by generated code.
        const WRITABLE  = 1 << 2;
        /// The register value is owned by the simulator until first access.
        const READ_ONLY = 1 << 3;
    }
}

/// Register classes, used for reservation and dependence grouping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterType {
    Gpr,
    Fpr,
    VecReg,
    PredReg,
    SysReg,
    Pc,
}

/// Stable arena id of a physical register.
pub type PhysRegId = usize;

/// Behaviour variant of one physical register slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysicalRegisterKind {
    /// Plain storage.
    Normal,
    /// Writes are mirrored into another physical register, modelling aliased
    /// system register views.
    Linked(PhysRegId),
    /// Writes additionally queue a configuration notification for the
    /// virtual memory layer.
    Configure,
    /// Reads as zero, writes are dropped.
    Razwi,
}

/// One physical register.
#[derive(Clone, Debug)]
pub struct PhysicalRegister {
    name: String,
    index: u32,
    size: u32,
    value: u64,
    init_mask: u64,
    reset_value: u64,
    reset_mask: u64,
    attributes: RegisterAttributes,
    reg_type: RegisterType,
    kind: PhysicalRegisterKind,
}

impl PhysicalRegister {
    pub fn new(name: &str, index: u32, size: u32, reg_type: RegisterType) -> Self {
        assert!(size >= 1 && size <= 64, "physical-register-size-out-of-range: {}", size);
        Self {
            name: name.to_string(),
            index,
            size,
            value: 0,
            init_mask: 0,
            reset_value: 0,
            reset_mask: 0,
            attributes: RegisterAttributes::READABLE | RegisterAttributes::WRITABLE,
            reg_type,
            kind: PhysicalRegisterKind::Normal,
        }
    }

    pub fn with_kind(mut self, kind: PhysicalRegisterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_reset(mut self, value: u64, mask: u64) -> Self {
        self.reset_value = value;
        self.reset_mask = mask;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn register_type(&self) -> RegisterType {
        self.reg_type
    }

    pub fn kind(&self) -> PhysicalRegisterKind {
        self.kind
    }

    pub fn attributes(&self) -> RegisterAttributes {
        self.attributes
    }

    /// Architectural reset value and the mask of bits it defines.
    pub fn reset(&self) -> (u64, u64) {
        (self.reset_value, self.reset_mask)
    }

    /// Applies the architectural reset value to the defined bits.
    pub fn apply_reset(&mut self) {
        if self.reset_mask != 0 {
            let (value, mask) = (self.reset_value, self.reset_mask);
            self.set_bits(value, mask);
        }
    }

    /// Mask covering every bit of the register.
    pub fn mask(&self) -> u64 {
        if self.size == 64 {
            u64::MAX
        } else {
            (1u64 << self.size) - 1
        }
    }

    /// Whether all bits selected by `mask` are initialised.
    pub fn is_initialized(&self, mask: u64) -> bool {
        let mask = mask & self.mask();
        matches!(self.kind, PhysicalRegisterKind::Razwi) || (self.init_mask & mask) == mask
    }

    /// Whether any bit is initialised; `partial` reports a strict subset.
    pub fn initialization_state(&self) -> (bool, bool) {
        let full = self.is_initialized(self.mask());
        let partial = !full && self.init_mask != 0;
        (full, partial)
    }

    /// Value of the bits selected by `mask`. Reading bits that were never
    /// given a value is an invariant violation.
    pub fn value(&self, mask: u64) -> u64 {
        if let PhysicalRegisterKind::Razwi = self.kind {
            return 0;
        }
        let mask = mask & self.mask();
        assert!(
            (self.init_mask & mask) == mask,
            "read-uninitialized-register-bits: {} mask 0x{:x} init 0x{:x}",
            self.name,
            mask,
            self.init_mask
        );
        self.value & mask
    }

    /// Value without the initialisation check, for diagnostics only.
    pub fn raw_value(&self) -> u64 {
        self.value
    }

    /// Initialised bit mask.
    pub fn init_mask(&self) -> u64 {
        self.init_mask
    }

    fn set_bits(&mut self, value: u64, mask: u64) {
        if let PhysicalRegisterKind::Razwi = self.kind {
            return;
        }
        let mask = mask & self.mask();
        self.value = (self.value & !mask) | (value & mask);
        self.init_mask |= mask;
        self.attributes |= RegisterAttributes::HAS_VALUE;
    }
}

/// A named bit slice of one physical register.
#[derive(Clone, Debug)]
pub struct RegisterField {
    pub name: String,
    pub lsb: u32,
    pub size: u32,
    pub phys: PhysRegId,
    /// Shift of the field inside the logical register; fields are laid out
    /// in declaration order.
    pub register_lsb: u32,
    /// How an unset field gets its initial value.
    pub init_policy: InitPolicy,
}

impl RegisterField {
    fn mask(&self) -> u64 {
        let bits = if self.size == 64 { u64::MAX } else { (1u64 << self.size) - 1 };
        bits << self.lsb
    }
}

/// Initial-value policy for a field that was never explicitly initialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitPolicy {
    /// Initialise to zero.
    Zero,
    /// Draw a random value.
    Random,
    /// Initialise to a fixed value.
    Fixed(u64),
}

/// Backing layout of a logical register.
#[derive(Clone, Debug)]
pub enum RegisterBacking {
    /// Fields over one or more physicals; covers plain and large registers.
    Simple,
    /// Fields multiplex across alternate physical backings selected by the
    /// value of a selector physical register.
    Banked { selector: PhysRegId, alternates: Vec<Vec<RegisterField>>, current: usize },
}

/// A logical register: an ordered list of fields projected onto physicals.
#[derive(Clone, Debug)]
pub struct Register {
    pub name: String,
    pub index: u32,
    pub reg_type: RegisterType,
    pub size: u32,
    /// Boot-loading priority; zero means the register is not boot loaded.
    pub boot: u32,
    fields: Vec<RegisterField>,
    backing: RegisterBacking,
}

impl Register {
    pub fn new(name: &str, index: u32, reg_type: RegisterType, size: u32) -> Self {
        Self {
            name: name.to_string(),
            index,
            reg_type,
            size,
            boot: 0,
            fields: Vec::new(),
            backing: RegisterBacking::Simple,
        }
    }

    pub fn with_boot(mut self, boot: u32) -> Self {
        self.boot = boot;
        self
    }

    /// Appends a field; fields are packed in declaration order from bit 0.
    pub fn add_field(mut self, name: &str, phys: PhysRegId, lsb: u32, size: u32) -> Self {
        self.push_field(name, phys, lsb, size, InitPolicy::Random);
        self
    }

    /// Appends a field with an explicit init policy.
    pub fn add_field_with_policy(
        mut self,
        name: &str,
        phys: PhysRegId,
        lsb: u32,
        size: u32,
        policy: InitPolicy,
    ) -> Self {
        self.push_field(name, phys, lsb, size, policy);
        self
    }

    fn push_field(&mut self, name: &str, phys: PhysRegId, lsb: u32, size: u32, policy: InitPolicy) {
        let register_lsb = self.fields.iter().map(|f| f.size).sum();
        self.fields.push(RegisterField {
            name: name.to_string(),
            lsb,
            size,
            phys,
            register_lsb,
            init_policy: policy,
        });
    }

    /// Converts the register into a banked register with the given selector
    /// and alternate backings; the declared fields become bank zero.
    pub fn into_banked(mut self, selector: PhysRegId, mut alternates: Vec<Vec<RegisterField>>) -> Self {
        let mut banks = vec![self.fields.clone()];
        banks.append(&mut alternates);
        self.backing = RegisterBacking::Banked { selector, alternates: banks, current: 0 };
        self
    }

    /// The active field list.
    pub fn fields(&self) -> &[RegisterField] {
        match &self.backing {
            RegisterBacking::Simple => &self.fields,
            RegisterBacking::Banked { alternates, current, .. } => &alternates[*current],
        }
    }

    /// Whether the register spans more than one physical register.
    pub fn is_large(&self) -> bool {
        let fields = self.fields();
        fields.iter().any(|f| f.phys != fields[0].phys)
    }
}

/// The per-hart register file.
pub struct RegisterFile {
    physical: Vec<PhysicalRegister>,
    phys_by_name: HashMap<String, PhysRegId>,
    registers: HashMap<String, Register>,
    by_type_index: HashMap<(RegisterType, u32), String>,
    /// Pending configure-register notifications for the VM layer, drained by
    /// the generator after each write batch.
    config_updates: Vec<(String, u64)>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            physical: Vec::new(),
            phys_by_name: HashMap::new(),
            registers: HashMap::new(),
            by_type_index: HashMap::new(),
            config_updates: Vec::new(),
        }
    }

    /// Adds a physical register to the arena and returns its id.
    pub fn add_physical(&mut self, reg: PhysicalRegister) -> PhysRegId {
        let id = self.physical.len();
        self.phys_by_name.insert(reg.name.clone(), id);
        self.physical.push(reg);
        id
    }

    /// Adds a logical register.
    pub fn add_register(&mut self, register: Register) {
        self.by_type_index
            .insert((register.reg_type, register.index), register.name.clone());
        self.registers.insert(register.name.clone(), register);
    }

    pub fn physical(&self, id: PhysRegId) -> &PhysicalRegister {
        &self.physical[id]
    }

    pub fn physical_id(&self, name: &str) -> Option<PhysRegId> {
        self.phys_by_name.get(name).copied()
    }

    pub fn register(&self, name: &str) -> Result<&Register, Error> {
        self.registers.get(name).ok_or_else(|| Error::UnknownRegister(name.to_string()))
    }

    /// Register name for a class and index, e.g. `(Gpr, 3)` to `"x3"`.
    pub fn register_name(&self, reg_type: RegisterType, index: u32) -> Option<&str> {
        self.by_type_index.get(&(reg_type, index)).map(|s| s.as_str())
    }

    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.registers.values()
    }

    /// Assembled value of a logical register. Fails the generator when any
    /// covered bit is uninitialised.
    pub fn register_value(&self, name: &str) -> Result<u64, Error> {
        let register = self.register(name)?;
        let mut value = 0u64;
        for field in register.fields() {
            let raw = self.physical[field.phys].value(field.mask());
            value |= shl64(raw >> field.lsb, field.register_lsb);
        }
        Ok(value)
    }

    /// Value of one named field of a register.
    pub fn register_field_value(&self, name: &str, field_name: &str) -> Result<u64, Error> {
        let register = self.register(name)?;
        for field in register.fields() {
            if field.name == field_name {
                let raw = self.physical[field.phys].value(field.mask());
                return Ok(raw >> field.lsb);
            }
        }
        Err(Error::UnknownRegister(format!("{}.{}", name, field_name)))
    }

    /// Whether every bit of the register is initialised; the second return
    /// reports partial initialisation.
    pub fn is_initialized(&self, name: &str) -> Result<(bool, bool), Error> {
        let register = self.register(name)?;
        let mut full = true;
        let mut any = false;
        for field in register.fields() {
            let phys = &self.physical[field.phys];
            if phys.is_initialized(field.mask()) {
                any = true;
            } else {
                full = false;
                if phys.init_mask() & field.mask() != 0 {
                    any = true;
                }
            }
        }
        Ok((full, !full && any))
    }

    /// Writes a whole logical register, routing through field projections,
    /// linked mirrors, configure notifications and banked re-targeting.
    pub fn write_register(&mut self, name: &str, value: u64) -> Result<(), Error> {
        let fields: Vec<RegisterField> = self.register(name)?.fields().to_vec();
        for field in &fields {
            let field_value = shr64(value, field.register_lsb) << field.lsb;
            self.write_physical_bits(field.phys, field_value, field.mask());
        }
        Ok(())
    }

    /// Writes one named field of a register.
    pub fn write_register_field(&mut self, name: &str, field_name: &str, value: u64) -> Result<(), Error> {
        let fields: Vec<RegisterField> = self.register(name)?.fields().to_vec();
        for field in &fields {
            if field.name == field_name {
                self.write_physical_bits(field.phys, value << field.lsb, field.mask());
                return Ok(());
            }
        }
        Err(Error::UnknownRegister(format!("{}.{}", name, field_name)))
    }

    /// Writes masked bits of a physical register by name; the path simulator
    /// updates arrive on.
    pub fn write_physical_by_name(&mut self, name: &str, value: u64, mask: u64) -> Result<(), Error> {
        let id = self
            .physical_id(name)
            .ok_or_else(|| Error::UnknownRegister(name.to_string()))?;
        self.write_physical_bits(id, value, mask);
        Ok(())
    }

    /// Writes masked bits of a physical register, applying slot behaviour.
    pub fn write_physical_bits(&mut self, id: PhysRegId, value: u64, mask: u64) {
        trace!(
            "write phys {} value 0x{:x} mask 0x{:x}",
            self.physical[id].name,
            value,
            mask
        );
        self.physical[id].set_bits(value, mask);
        match self.physical[id].kind {
            PhysicalRegisterKind::Linked(target) => {
                self.physical[target].set_bits(value, mask);
            }
            PhysicalRegisterKind::Configure => {
                let name = self.physical[id].name.clone();
                let new_value = self.physical[id].raw_value();
                self.config_updates.push((name, new_value));
            }
            _ => {}
        }
        self.retarget_banked(id);
    }

    /// Re-targets banked registers whose selector changed; called directly
    /// instead of through a notification bus.
    fn retarget_banked(&mut self, changed: PhysRegId) {
        let selector_value = self.physical[changed].raw_value();
        for register in self.registers.values_mut() {
            if let RegisterBacking::Banked { selector, alternates, current } = &mut register.backing
            {
                if *selector == changed {
                    let next = (selector_value as usize) % alternates.len();
                    if next != *current {
                        debug!(
                            "banked register {} re-targeted to bank {}",
                            register.name, next
                        );
                        *current = next;
                    }
                }
            }
        }
    }

    /// Drains pending configure-register notifications.
    pub fn take_config_updates(&mut self) -> Vec<(String, u64)> {
        std::mem::take(&mut self.config_updates)
    }

    /// Explicitly initialises a register with a value.
    pub fn initialize_register(&mut self, name: &str, value: u64) -> Result<(), Error> {
        self.write_register(name, value)
    }

    /// Completes an uninitialised or partially initialised register using
    /// each unset field's init policy.
    pub fn initialize_register_randomly(&mut self, name: &str, rng: &mut Rng) -> Result<u64, Error> {
        let fields: Vec<RegisterField> = self.register(name)?.fields().to_vec();
        for field in &fields {
            let phys = &self.physical[field.phys];
            if phys.is_initialized(field.mask()) {
                continue;
            }
            let width_mask = if field.size == 64 { u64::MAX } else { (1u64 << field.size) - 1 };
            let fresh = match field.init_policy {
                InitPolicy::Zero => 0,
                InitPolicy::Fixed(v) => v & width_mask,
                InitPolicy::Random => rng.next_u64() & width_mask,
            };
            self.write_physical_bits(field.phys, fresh << field.lsb, field.mask());
        }
        self.register_value(name)
    }

    /// All registers of a class with a nonzero boot priority, ordered by
    /// priority then index; the boot-loading order.
    pub fn boot_ordered_registers(&self) -> Vec<&Register> {
        let mut regs: Vec<&Register> =
            self.registers.values().filter(|r| r.boot != 0).collect();
        regs.sort_by_key(|r| (r.boot, r.index, r.name.clone()));
        regs
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Shift that yields zero instead of overflowing; large registers project
/// fields past bit 63, which a 64-bit value view simply cannot carry.
fn shl64(value: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        value << shift
    }
}

fn shr64(value: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        value >> shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_gpr() -> (RegisterFile, PhysRegId) {
        let mut file = RegisterFile::new();
        let id = file.add_physical(PhysicalRegister::new("_x1", 1, 64, RegisterType::Gpr));
        file.add_register(Register::new("x1", 1, RegisterType::Gpr, 64).add_field("x1", id, 0, 64));
        (file, id)
    }

    #[test]
    fn uninitialized_read_is_fatal() {
        let (file, _) = file_with_gpr();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            file.register_value("x1").unwrap()
        }));
        assert!(result.is_err());
    }

    #[test]
    fn initialization_tracks_masks() {
        let (mut file, id) = file_with_gpr();
        file.write_physical_bits(id, 0xdead, 0xffff);
        let phys = file.physical(id);
        assert!(phys.is_initialized(0xffff));
        assert!(!phys.is_initialized(0x1_0000));
        let (full, partial) = file.is_initialized("x1").unwrap();
        assert!(!full && partial);
        file.write_register("x1", 0x1234_5678_9abc_def0).unwrap();
        assert_eq!(file.register_value("x1").unwrap(), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn razwi_reads_zero_and_drops_writes() {
        let mut file = RegisterFile::new();
        let id = file.add_physical(
            PhysicalRegister::new("_x0", 0, 64, RegisterType::Gpr)
                .with_kind(PhysicalRegisterKind::Razwi),
        );
        file.add_register(Register::new("x0", 0, RegisterType::Gpr, 64).add_field("x0", id, 0, 64));
        file.write_register("x0", 0xffff).unwrap();
        assert_eq!(file.register_value("x0").unwrap(), 0);
    }

    #[test]
    fn linked_register_mirrors_writes() {
        let mut file = RegisterFile::new();
        let target = file.add_physical(PhysicalRegister::new("_mstatus", 0, 64, RegisterType::SysReg));
        let alias = file.add_physical(
            PhysicalRegister::new("_sstatus", 1, 64, RegisterType::SysReg)
                .with_kind(PhysicalRegisterKind::Linked(target)),
        );
        file.add_register(
            Register::new("sstatus", 1, RegisterType::SysReg, 64).add_field("sstatus", alias, 0, 64),
        );
        file.write_register("sstatus", 0x22).unwrap();
        assert_eq!(file.physical(target).value(u64::MAX), 0x22);
    }

    #[test]
    fn configure_register_queues_notification() {
        let mut file = RegisterFile::new();
        let id = file.add_physical(
            PhysicalRegister::new("_satp", 0, 64, RegisterType::SysReg)
                .with_kind(PhysicalRegisterKind::Configure),
        );
        file.add_register(Register::new("satp", 0, RegisterType::SysReg, 64).add_field("satp", id, 0, 64));
        file.write_register("satp", 0x8000_0000_0000_1234).unwrap();
        let updates = file.take_config_updates();
        assert_eq!(updates, vec![("_satp".to_string(), 0x8000_0000_0000_1234)]);
    }

    #[test]
    fn large_register_spans_two_physicals() {
        let mut file = RegisterFile::new();
        let lo = file.add_physical(PhysicalRegister::new("_v0_0", 0, 64, RegisterType::VecReg));
        let hi = file.add_physical(PhysicalRegister::new("_v0_1", 0, 64, RegisterType::VecReg));
        file.add_register(
            Register::new("v0", 0, RegisterType::VecReg, 128)
                .add_field("lo", lo, 0, 64)
                .add_field("hi", hi, 0, 64),
        );
        let register = file.register("v0").unwrap();
        assert!(register.is_large());
        file.write_register("v0", 0xaaaa).unwrap();
        // Only the low 64 bits are expressible through the u64 write path.
        assert_eq!(file.physical(lo).value(u64::MAX), 0xaaaa);
    }

    #[test]
    fn banked_register_retargets_on_selector_write() {
        let mut file = RegisterFile::new();
        let selector = file.add_physical(PhysicalRegister::new("_sel", 0, 64, RegisterType::SysReg));
        let bank0 = file.add_physical(PhysicalRegister::new("_b0", 0, 64, RegisterType::SysReg));
        let bank1 = file.add_physical(PhysicalRegister::new("_b1", 1, 64, RegisterType::SysReg));
        file.write_physical_bits(selector, 0, u64::MAX);
        let alternate = vec![RegisterField {
            name: "banked".to_string(),
            lsb: 0,
            size: 64,
            phys: bank1,
            register_lsb: 0,
            init_policy: InitPolicy::Zero,
        }];
        file.add_register(
            Register::new("banked", 0, RegisterType::SysReg, 64)
                .add_field("banked", bank0, 0, 64)
                .into_banked(selector, vec![alternate]),
        );
        file.write_register("banked", 0x11).unwrap();
        file.write_physical_bits(selector, 1, u64::MAX);
        file.write_register("banked", 0x22).unwrap();
        assert_eq!(file.physical(bank0).value(u64::MAX), 0x11);
        assert_eq!(file.physical(bank1).value(u64::MAX), 0x22);
    }

    #[test]
    fn random_initialization_honours_policies() {
        let mut file = RegisterFile::new();
        let id = file.add_physical(PhysicalRegister::new("_stvec", 0, 64, RegisterType::SysReg));
        file.add_register(
            Register::new("stvec", 0, RegisterType::SysReg, 64)
                .add_field_with_policy("mode", id, 0, 2, InitPolicy::Zero)
                .add_field_with_policy("base", id, 2, 62, InitPolicy::Random),
        );
        let mut rng = Rng::new(5);
        let value = file.initialize_register_randomly("stvec", &mut rng).unwrap();
        assert_eq!(value & 0x3, 0);
    }
}
