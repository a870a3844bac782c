//! The query agent: read-only questions answered into the generator's
//! query-result store.

use crate::error::Error;
use crate::generator::Generator;
use crate::request::{GenQueryRequest, GenQueryResult};

/// Handles one query request.
pub fn handle(generator: &mut Generator, request: GenQueryRequest) -> Result<(), Error> {
    let result = match request {
        GenQueryRequest::GenState { name } => match name.as_str() {
            "PC" => GenQueryResult::Value(generator.pc()),
            "LastPC" => GenQueryResult::Value(generator.gen_pc.last_value()),
            "PrivilegeLevel" => GenQueryResult::Value(generator.privilege_level() as u64),
            "GenMode" => GenQueryResult::Value(u64::from(generator.mode().current_mode().bits())),
            "SpeculativeBntLevel" => GenQueryResult::Value(u64::from(generator.speculative_bnt_level())),
            _ => GenQueryResult::Missing,
        },
        GenQueryRequest::PageInfo { address, is_instr: _ } => {
            match generator.translate_va_to_pa(address) {
                Ok((pa, bank)) => GenQueryResult::ValuePair(pa, u64::from(bank.number())),
                Err(_) => GenQueryResult::Missing,
            }
        }
        GenQueryRequest::RegisterIndex { name } => match generator.registers().register(&name) {
            Ok(register) => GenQueryResult::Value(u64::from(register.index)),
            Err(_) => GenQueryResult::Missing,
        },
        GenQueryRequest::InstructionCount => {
            GenQueryResult::Value(generator.results().count() as u64)
        }
    };
    generator.query_results.push(result);
    Ok(())
}
