//! The state agent: push/pop/enable/disable/set of generator state.

use log::debug;
use num_traits::FromPrimitive as _;

use crate::arch::riscv64::PrivilegeLevel;
use crate::error::Error;
use crate::generator::Generator;
use crate::request::{GenStateAction, GenStateRequest, GenStateSpec};

/// Handles one state request.
pub fn handle(generator: &mut Generator, request: GenStateRequest) -> Result<(), Error> {
    match (&request.action, &request.state) {
        (GenStateAction::Push, GenStateSpec::GenMode(flags)) => {
            generator.push_gen_mode(*flags);
            Ok(())
        }
        (GenStateAction::Pop, GenStateSpec::GenMode(flags)) => {
            generator.pop_gen_mode(*flags);
            Ok(())
        }
        (GenStateAction::Enable, GenStateSpec::GenMode(flags)) => {
            generator.enable_gen_mode(*flags);
            Ok(())
        }
        (GenStateAction::Disable, GenStateSpec::GenMode(flags)) => {
            generator.disable_gen_mode(*flags);
            Ok(())
        }
        (GenStateAction::Set, GenStateSpec::Pc(pc)) => {
            debug!("state request sets PC to 0x{:x}", pc);
            generator.gen_pc.set_aligned(*pc);
            generator.restore_loops.handle_pc_update(generator.pc());
            Ok(())
        }
        (GenStateAction::Set, GenStateSpec::PrivilegeLevel(level)) => {
            let level = PrivilegeLevel::from_u32(*level)
                .unwrap_or_else(|| panic!("unsupported-privilege-level: {}", level));
            generator.set_privilege_level(level)
        }
        (GenStateAction::Set, GenStateSpec::BootPc(pc)) => {
            generator.config.boot_pc = *pc;
            Ok(())
        }
        (action, state) => {
            panic!("unsupported-gen-state-request: {:?} on {:?}", action, state)
        }
    }
}
