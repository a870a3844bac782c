//! Register reservation bookkeeping. Reservations are accumulated per
//! reservation group and per reserver type, so the exception handler, the
//! user template and the unpredictable-register guard can all hold
//! overlapping reservations and release them independently.

use std::collections::HashMap;

use log::debug;

use crate::constraint::ConstraintSet;
use crate::error::Error;
use crate::register::{RegisterFile, RegisterType};

/// Access kinds a reservation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    ReadWrite,
}

/// Disjoint reserver namespaces; reservations of different types do not
/// interfere on unreserve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegReserveType {
    User = 0,
    ExceptionHandler = 1,
    Unpredictable = 2,
}

const RESERVE_TYPE_COUNT: usize = 3;

/// Reservation groups; each group carries one index space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegReserveGroup {
    Gpr,
    FprSimdr,
    VecReg,
    SystemRegister,
}

/// Reserved register indices for one reservation group.
pub struct ReservationConstraint {
    /// Aggregate of every index reserved for read.
    read_reserved: ConstraintSet,
    /// Aggregate of every index reserved for write.
    write_reserved: ConstraintSet,
    /// Read reservations partitioned by reserver type.
    read_by_type: Vec<ConstraintSet>,
    /// Write reservations partitioned by reserver type.
    write_by_type: Vec<ConstraintSet>,
}

impl ReservationConstraint {
    pub fn new() -> Self {
        Self {
            read_reserved: ConstraintSet::new(),
            write_reserved: ConstraintSet::new(),
            read_by_type: (0..RESERVE_TYPE_COUNT).map(|_| ConstraintSet::new()).collect(),
            write_by_type: (0..RESERVE_TYPE_COUNT).map(|_| ConstraintSet::new()).collect(),
        }
    }

    /// Reserves indices for the access and reserver type. Reserving indices
    /// the same reserver already holds is an invariant violation.
    pub fn reserve_registers(
        &mut self,
        indices: &ConstraintSet,
        access: AccessType,
        reserve_type: RegReserveType,
    ) {
        assert!(
            !self.are_registers_reserved(indices, access, reserve_type),
            "register-already-reserved: {} for {:?}/{:?}",
            indices.to_simple_string(),
            access,
            reserve_type
        );
        let slot = reserve_type as usize;
        if matches!(access, AccessType::Read | AccessType::ReadWrite) {
            self.read_by_type[slot].merge_constraint_set(indices);
            self.read_reserved.merge_constraint_set(indices);
        }
        if matches!(access, AccessType::Write | AccessType::ReadWrite) {
            self.write_by_type[slot].merge_constraint_set(indices);
            self.write_reserved.merge_constraint_set(indices);
        }
    }

    /// Releases a prior reservation. The aggregate views only drop an index
    /// once no reserver type still holds it, so overlapping reservers do not
    /// destroy each other's reservations.
    pub fn unreserve_registers(
        &mut self,
        indices: &ConstraintSet,
        access: AccessType,
        reserve_type: RegReserveType,
    ) {
        assert!(
            self.are_registers_reserved(indices, access, reserve_type),
            "register-not-reserved: {} for {:?}/{:?}",
            indices.to_simple_string(),
            access,
            reserve_type
        );
        let slot = reserve_type as usize;
        if matches!(access, AccessType::Read | AccessType::ReadWrite) {
            self.read_by_type[slot].sub_constraint_set(indices);
            let mut dropped = indices.clone();
            for held in &self.read_by_type {
                dropped.sub_constraint_set(held);
            }
            self.read_reserved.sub_constraint_set(&dropped);
        }
        if matches!(access, AccessType::Write | AccessType::ReadWrite) {
            self.write_by_type[slot].sub_constraint_set(indices);
            let mut dropped = indices.clone();
            for held in &self.write_by_type {
                dropped.sub_constraint_set(held);
            }
            self.write_reserved.sub_constraint_set(&dropped);
        }
    }

    /// Whether every index is reserved for the access by the reserver type.
    pub fn are_registers_reserved(
        &self,
        indices: &ConstraintSet,
        access: AccessType,
        reserve_type: RegReserveType,
    ) -> bool {
        let slot = reserve_type as usize;
        match access {
            AccessType::Read => self.read_by_type[slot].contains_constraint_set(indices),
            AccessType::Write => self.write_by_type[slot].contains_constraint_set(indices),
            AccessType::ReadWrite => {
                self.read_by_type[slot].contains_constraint_set(indices)
                    && self.write_by_type[slot].contains_constraint_set(indices)
            }
        }
    }

    /// Removes every index reserved for the access (by any reserver type)
    /// from the candidate constraint.
    pub fn exclude_reserved_by_access(&self, access: AccessType, candidates: &mut ConstraintSet) {
        if matches!(access, AccessType::Read | AccessType::ReadWrite) {
            candidates.sub_constraint_set(&self.read_reserved);
        }
        if matches!(access, AccessType::Write | AccessType::ReadWrite) {
            candidates.sub_constraint_set(&self.write_reserved);
        }
    }

    /// The aggregate reserved sets for an access, when non-empty.
    pub fn has_reserved(
        &self,
        access: AccessType,
    ) -> (Option<&ConstraintSet>, Option<&ConstraintSet>) {
        let read = match access {
            AccessType::Read | AccessType::ReadWrite if !self.read_reserved.is_empty() => {
                Some(&self.read_reserved)
            }
            _ => None,
        };
        let write = match access {
            AccessType::Write | AccessType::ReadWrite if !self.write_reserved.is_empty() => {
                Some(&self.write_reserved)
            }
            _ => None,
        };
        (read, write)
    }
}

impl Default for ReservationConstraint {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-hart register reserver.
pub struct RegisterReserver {
    constraints: HashMap<RegReserveGroup, ReservationConstraint>,
}

impl RegisterReserver {
    pub fn new() -> Self {
        let mut constraints = HashMap::new();
        for group in [
            RegReserveGroup::Gpr,
            RegReserveGroup::FprSimdr,
            RegReserveGroup::VecReg,
            RegReserveGroup::SystemRegister,
        ]
        .iter()
        {
            constraints.insert(*group, ReservationConstraint::new());
        }
        Self { constraints }
    }

    /// Reservation group a register type belongs to.
    pub fn reserve_group(reg_type: RegisterType) -> RegReserveGroup {
        match reg_type {
            RegisterType::Gpr => RegReserveGroup::Gpr,
            RegisterType::Fpr => RegReserveGroup::FprSimdr,
            RegisterType::VecReg | RegisterType::PredReg => RegReserveGroup::VecReg,
            RegisterType::SysReg | RegisterType::Pc => RegReserveGroup::SystemRegister,
        }
    }

    /// Valid index range of a register type.
    pub fn register_index_range(reg_type: RegisterType) -> ConstraintSet {
        match reg_type {
            RegisterType::Gpr | RegisterType::Fpr | RegisterType::VecReg => {
                ConstraintSet::from_range(0, 31)
            }
            RegisterType::PredReg => ConstraintSet::from_range(0, 7),
            RegisterType::SysReg => ConstraintSet::from_range(0, 0xfff),
            RegisterType::Pc => ConstraintSet::from_value(0),
        }
    }

    /// Reserves register indices.
    pub fn reserve(
        &mut self,
        reg_type: RegisterType,
        indices: &ConstraintSet,
        access: AccessType,
        reserve_type: RegReserveType,
    ) {
        debug!(
            "reserve {:?} {} for {:?}/{:?}",
            reg_type,
            indices.to_simple_string(),
            access,
            reserve_type
        );
        let group = Self::reserve_group(reg_type);
        self.constraints.get_mut(&group).unwrap().reserve_registers(indices, access, reserve_type);
    }

    /// Reserves a register looked up by name.
    pub fn reserve_by_name(
        &mut self,
        file: &RegisterFile,
        name: &str,
        access: AccessType,
        reserve_type: RegReserveType,
    ) -> Result<(), Error> {
        let register = file.register(name)?;
        let indices = ConstraintSet::from_value(register.index as u64);
        self.reserve(register.reg_type, &indices, access, reserve_type);
        Ok(())
    }

    /// Releases register indices.
    pub fn unreserve(
        &mut self,
        reg_type: RegisterType,
        indices: &ConstraintSet,
        access: AccessType,
        reserve_type: RegReserveType,
    ) {
        let group = Self::reserve_group(reg_type);
        self.constraints
            .get_mut(&group)
            .unwrap()
            .unreserve_registers(indices, access, reserve_type);
    }

    /// Releases a register looked up by name.
    pub fn unreserve_by_name(
        &mut self,
        file: &RegisterFile,
        name: &str,
        access: AccessType,
        reserve_type: RegReserveType,
    ) -> Result<(), Error> {
        let register = file.register(name)?;
        let indices = ConstraintSet::from_value(register.index as u64);
        self.unreserve(register.reg_type, &indices, access, reserve_type);
        Ok(())
    }

    /// Whether the indices are reserved for the access by the reserver type.
    pub fn is_reserved(
        &self,
        reg_type: RegisterType,
        indices: &ConstraintSet,
        access: AccessType,
        reserve_type: RegReserveType,
    ) -> bool {
        let group = Self::reserve_group(reg_type);
        self.constraints[&group].are_registers_reserved(indices, access, reserve_type)
    }

    /// Whether the indices are reserved for the access by any reserver type.
    pub fn is_reserved_by_any(
        &self,
        reg_type: RegisterType,
        indices: &ConstraintSet,
        access: AccessType,
    ) -> bool {
        let group = Self::reserve_group(reg_type);
        let constraint = &self.constraints[&group];
        let (read, write) = constraint.has_reserved(access);
        match access {
            AccessType::Read => read.map_or(false, |r| r.contains_constraint_set(indices)),
            AccessType::Write => write.map_or(false, |w| w.contains_constraint_set(indices)),
            AccessType::ReadWrite => {
                read.map_or(false, |r| r.contains_constraint_set(indices))
                    && write.map_or(false, |w| w.contains_constraint_set(indices))
            }
        }
    }

    /// The indices of a register type usable for the given access: the full
    /// index range minus every conflicting reservation.
    pub fn usable_index_constraint(&self, reg_type: RegisterType, access: AccessType) -> ConstraintSet {
        let mut candidates = Self::register_index_range(reg_type);
        let group = Self::reserve_group(reg_type);
        self.constraints[&group].exclude_reserved_by_access(access, &mut candidates);
        candidates
    }
}

impl Default for RegisterReserver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_removes_from_usable() {
        let mut reserver = RegisterReserver::new();
        let indices = ConstraintSet::from_range(5, 7);
        reserver.reserve(RegisterType::Gpr, &indices, AccessType::ReadWrite, RegReserveType::User);
        let usable = reserver.usable_index_constraint(RegisterType::Gpr, AccessType::Write);
        assert!(!usable.contains_value(5));
        assert!(!usable.contains_value(7));
        assert!(usable.contains_value(8));
    }

    #[test]
    fn overlapping_reservers_unreserve_independently() {
        let mut reserver = RegisterReserver::new();
        let indices = ConstraintSet::from_value(9);
        reserver.reserve(RegisterType::Gpr, &indices, AccessType::Read, RegReserveType::User);
        reserver.reserve(
            RegisterType::Gpr,
            &indices,
            AccessType::Read,
            RegReserveType::ExceptionHandler,
        );
        reserver.unreserve(RegisterType::Gpr, &indices, AccessType::Read, RegReserveType::User);
        // The exception handler still holds the index.
        assert!(!reserver
            .usable_index_constraint(RegisterType::Gpr, AccessType::Read)
            .contains_value(9));
        reserver.unreserve(
            RegisterType::Gpr,
            &indices,
            AccessType::Read,
            RegReserveType::ExceptionHandler,
        );
        assert!(reserver
            .usable_index_constraint(RegisterType::Gpr, AccessType::Read)
            .contains_value(9));
    }

    #[test]
    fn read_reservation_leaves_write_usable() {
        let mut reserver = RegisterReserver::new();
        let indices = ConstraintSet::from_value(3);
        reserver.reserve(RegisterType::Gpr, &indices, AccessType::Read, RegReserveType::User);
        assert!(!reserver
            .usable_index_constraint(RegisterType::Gpr, AccessType::Read)
            .contains_value(3));
        assert!(reserver
            .usable_index_constraint(RegisterType::Gpr, AccessType::Write)
            .contains_value(3));
        assert!(reserver.is_reserved(
            RegisterType::Gpr,
            &indices,
            AccessType::Read,
            RegReserveType::User
        ));
        assert!(!reserver.is_reserved(
            RegisterType::Gpr,
            &indices,
            AccessType::Write,
            RegReserveType::User
        ));
    }

    #[test]
    #[should_panic(expected = "register-already-reserved")]
    fn double_reserve_is_fatal() {
        let mut reserver = RegisterReserver::new();
        let indices = ConstraintSet::from_value(4);
        reserver.reserve(RegisterType::Gpr, &indices, AccessType::Write, RegReserveType::User);
        reserver.reserve(RegisterType::Gpr, &indices, AccessType::Write, RegReserveType::User);
    }
}
