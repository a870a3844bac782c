//! RISC-V 64-bit architecture data: register layout, privilege levels,
//! translation modes, page geometry, exception codes and the spacing
//! constants the generator needs between instruction streams.

use num_derive::FromPrimitive;

use crate::config::Choice;
use crate::register::{
    InitPolicy, PhysicalRegister, PhysicalRegisterKind, Register, RegisterFile, RegisterType,
};

/// RISC-V privilege levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

/// Translation modes encoded in `satp.MODE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum SatpMode {
    Bare = 0,
    Sv39 = 8,
    Sv48 = 9,
}

impl SatpMode {
    /// Number of table levels above the smallest page.
    pub fn levels(self) -> u32 {
        match self {
            SatpMode::Bare => 0,
            SatpMode::Sv39 => 3,
            SatpMode::Sv48 => 4,
        }
    }

    /// Highest translated VA bit.
    pub fn highest_va_bit(self) -> u32 {
        match self {
            SatpMode::Bare => 63,
            SatpMode::Sv39 => 38,
            SatpMode::Sv48 => 47,
        }
    }

    /// Largest translatable virtual address.
    pub fn max_virtual_address(self) -> u64 {
        match self {
            SatpMode::Bare => u64::MAX,
            _ => (1u64 << (self.highest_va_bit() + 1)) - 1,
        }
    }

    /// Bits resolved by each table.
    pub fn table_step(self) -> u32 {
        9
    }

    /// Address bits covered by a leaf at `level`; level 0 is 4 KiB.
    pub fn page_shift(self, level: u32) -> u32 {
        12 + level * self.table_step()
    }

    /// Leaf levels this mode supports, smallest page first.
    pub fn leaf_levels(self) -> Vec<u32> {
        (0..self.levels()).collect()
    }
}

/// Synchronous exception causes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum ExceptionCode {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EnvironmentCallFromU = 8,
    EnvironmentCallFromS = 9,
    EnvironmentCallFromM = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

/// Bytes kept clear between independently generated instruction streams.
pub const INSTRUCTION_SPACE: u32 = 32;

/// Bytes reserved along a taken path for a speculative BNT node.
pub const BNT_RESERVE_SPACE: u32 = 16;

/// Minimum contiguous free bytes required to lay down a not-taken path.
pub const BNT_MIN_SPACE: u32 = 8;

/// PC alignment mask; compressed instructions keep the PC 2-byte aligned.
pub const PC_ALIGN_MASK: u64 = !0x1;

/// GPR name for an index.
pub fn gpr_name(index: u32) -> String {
    format!("x{}", index)
}

/// FPR name for an index.
pub fn fpr_name(index: u32) -> String {
    format!("f{}", index)
}

/// Vector register name for an index.
pub fn vecreg_name(index: u32) -> String {
    format!("v{}", index)
}

/// GPR indices excluded from random operand selection; x0 is hardwired.
pub fn gpr_excludes() -> &'static [u32] {
    &[0]
}

/// Default weights for the page-size choice tree of a translation mode.
pub fn page_size_choices(mode: SatpMode) -> Vec<Choice> {
    let mut choices = vec![Choice::new(0, 10)];
    if mode.levels() >= 2 {
        choices.push(Choice::new(1, 2));
    }
    if mode.levels() >= 3 {
        choices.push(Choice::new(2, 1));
    }
    if mode.levels() >= 4 {
        choices.push(Choice::new(3, 1));
    }
    choices
}

/// Builds the RISC-V 64 register file: GPRs, FPRs, vector registers, the PC
/// and the system registers the generation core touches.
pub fn build_register_file() -> RegisterFile {
    let mut file = RegisterFile::new();

    for index in 0..32u32 {
        let name = gpr_name(index);
        let mut phys = PhysicalRegister::new(&name, index, 64, RegisterType::Gpr);
        if index == 0 {
            phys = phys.with_kind(PhysicalRegisterKind::Razwi);
        }
        let id = file.add_physical(phys);
        let mut register =
            Register::new(&name, index, RegisterType::Gpr, 64).add_field(&name, id, 0, 64);
        if index != 0 {
            register = register.with_boot(2);
        }
        file.add_register(register);
    }

    for index in 0..32u32 {
        let name = fpr_name(index);
        let id = file.add_physical(PhysicalRegister::new(&name, index, 64, RegisterType::Fpr));
        file.add_register(
            Register::new(&name, index, RegisterType::Fpr, 64)
                .add_field(&name, id, 0, 64)
                .with_boot(3),
        );
    }

    // 128-bit vector registers span two physicals each.
    for index in 0..32u32 {
        let name = vecreg_name(index);
        let lo = file.add_physical(PhysicalRegister::new(
            &format!("{}_0", name),
            index,
            64,
            RegisterType::VecReg,
        ));
        let hi = file.add_physical(PhysicalRegister::new(
            &format!("{}_1", name),
            index,
            64,
            RegisterType::VecReg,
        ));
        file.add_register(
            Register::new(&name, index, RegisterType::VecReg, 128)
                .add_field(&format!("{}_0", name), lo, 0, 64)
                .add_field(&format!("{}_1", name), hi, 0, 64),
        );
    }

    let pc = file.add_physical(PhysicalRegister::new("PC", 0, 64, RegisterType::Pc));
    file.add_register(Register::new("PC", 0, RegisterType::Pc, 64).add_field("PC", pc, 0, 64));

    // satp drives translation; every write must reach the VM layer.
    let satp = file.add_physical(
        PhysicalRegister::new("satp", 0x180, 64, RegisterType::SysReg)
            .with_kind(PhysicalRegisterKind::Configure),
    );
    file.add_register(
        Register::new("satp", 0x180, RegisterType::SysReg, 64)
            .add_field_with_policy("PPN", satp, 0, 44, InitPolicy::Zero)
            .add_field_with_policy("ASID", satp, 44, 16, InitPolicy::Zero)
            .add_field_with_policy("MODE", satp, 60, 4, InitPolicy::Zero),
    );

    let mstatus = file.add_physical(
        PhysicalRegister::new("mstatus", 0x300, 64, RegisterType::SysReg)
            .with_kind(PhysicalRegisterKind::Configure),
    );
    file.add_register(
        Register::new("mstatus", 0x300, RegisterType::SysReg, 64)
            .add_field_with_policy("IE", mstatus, 0, 8, InitPolicy::Zero)
            .add_field_with_policy("SPP", mstatus, 8, 1, InitPolicy::Zero)
            .add_field_with_policy("VS", mstatus, 9, 2, InitPolicy::Zero)
            .add_field_with_policy("MPP", mstatus, 11, 2, InitPolicy::Zero)
            .add_field_with_policy("FS", mstatus, 13, 2, InitPolicy::Zero)
            .add_field_with_policy("XS", mstatus, 15, 2, InitPolicy::Zero)
            .add_field_with_policy("MPRV", mstatus, 17, 1, InitPolicy::Zero)
            .add_field_with_policy("SUM", mstatus, 18, 1, InitPolicy::Zero)
            .add_field_with_policy("MXR", mstatus, 19, 1, InitPolicy::Zero)
            .add_field_with_policy("REST", mstatus, 20, 44, InitPolicy::Zero),
    );

    // sstatus is the supervisor view of mstatus.
    let sstatus = file.add_physical(
        PhysicalRegister::new("sstatus", 0x100, 64, RegisterType::SysReg)
            .with_kind(PhysicalRegisterKind::Linked(mstatus)),
    );
    file.add_register(
        Register::new("sstatus", 0x100, RegisterType::SysReg, 64)
            .add_field_with_policy("sstatus", sstatus, 0, 64, InitPolicy::Zero),
    );

    for (name, index) in [
        ("stvec", 0x105u32),
        ("sepc", 0x141),
        ("scause", 0x142),
        ("stval", 0x143),
        ("mtvec", 0x305),
        ("medeleg", 0x302),
        ("mideleg", 0x303),
        ("mepc", 0x341),
        ("mcause", 0x342),
        ("mtval", 0x343),
    ]
    .iter()
    {
        let id = file.add_physical(PhysicalRegister::new(name, *index, 64, RegisterType::SysReg));
        file.add_register(
            Register::new(name, *index, RegisterType::SysReg, 64)
                .add_field_with_policy(name, id, 0, 64, InitPolicy::Zero),
        );
    }

    // Current privilege level, modelled as an internal register.
    let priv_reg = file.add_physical(
        PhysicalRegister::new("PRIV", 0xfff, 2, RegisterType::SysReg)
            .with_kind(PhysicalRegisterKind::Configure),
    );
    file.add_register(
        Register::new("PRIV", 0xfff, RegisterType::SysReg, 2)
            .add_field_with_policy("PRIV", priv_reg, 0, 2, InitPolicy::Zero),
    );

    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn satp_modes_describe_geometry() {
        assert_eq!(SatpMode::Sv39.levels(), 3);
        assert_eq!(SatpMode::Sv48.levels(), 4);
        assert_eq!(SatpMode::Sv39.max_virtual_address(), (1 << 39) - 1);
        assert_eq!(SatpMode::Sv48.page_shift(0), 12);
        assert_eq!(SatpMode::Sv48.page_shift(2), 30);
        assert_eq!(SatpMode::from_u64(9), Some(SatpMode::Sv48));
    }

    #[test]
    fn register_file_wires_views() {
        let mut file = build_register_file();
        // x0 drops writes.
        file.write_register("x0", 0x1234).unwrap();
        assert_eq!(file.register_value("x0").unwrap(), 0);
        // sstatus writes land in mstatus.
        file.write_register("sstatus", 1 << 18).unwrap();
        let mstatus_id = file.physical_id("mstatus").unwrap();
        assert_eq!(file.physical(mstatus_id).value(1 << 18), 1 << 18);
        // satp write queues a configure notification.
        file.write_register("satp", (8u64 << 60) | 0x80000).unwrap();
        let updates = file.take_config_updates();
        assert!(updates.iter().any(|(name, _)| name == "satp"));
        assert_eq!(file.register_field_value("satp", "MODE").unwrap(), 8);
        assert_eq!(file.register_field_value("satp", "PPN").unwrap(), 0x80000);
    }

    #[test]
    fn exception_codes_round_trip_from_raw() {
        assert_eq!(ExceptionCode::from_u32(12), Some(ExceptionCode::InstructionPageFault));
        assert_eq!(ExceptionCode::from_u32(10), None);
    }
}
