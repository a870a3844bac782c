//! The exception agent: services exception events discovered on simulator
//! steps, exception returns, and handler-table updates.

use log::{info, warn};
use num_traits::FromPrimitive as _;

use crate::arch::riscv64::ExceptionCode;
use crate::error::Error;
use crate::gen_mode::GenModeFlags;
use crate::generator::{ExceptionContext, Generator};
use crate::request::GenExceptionRequest;

/// Handles one exception request.
pub fn handle(generator: &mut Generator, request: GenExceptionRequest) -> Result<(), Error> {
    match request {
        GenExceptionRequest::HandleException { id, description } => {
            handle_exception(generator, id, description)
        }
        GenExceptionRequest::ExceptionReturn => exception_return(generator),
        GenExceptionRequest::UpdateHandlerAddress { address } => {
            generator.config.exception_handler_base = address;
            Ok(())
        }
    }
}

/// Dispatches an exception into the modelled handler: nested exceptions must
/// be explicitly allowed, low-power causes park the generator instead of
/// entering a handler, and everything else redirects to the handler table.
fn handle_exception(generator: &mut Generator, id: u32, description: String) -> Result<(), Error> {
    if generator.mode().in_exception() && !generator.config.allow_exception_in_exception {
        return Err(Error::ExceptionInException(id));
    }

    let code = ExceptionCode::from_u32(id);
    info!("handling exception {} ({:?}): {}", id, code, description);
    if code.is_none() {
        warn!("exception id {} is not a known synchronous cause", id);
    }

    generator.exception_stack.push(ExceptionContext {
        id,
        description,
        saved_pc: generator.pc(),
    });
    generator.push_gen_mode(GenModeFlags::EXCEPTION);

    // Vectored dispatch into the handler table.
    let handler = generator.config.exception_handler_base + u64::from(id) * 0x40;
    generator.gen_pc.set_aligned(handler);
    Ok(())
}

/// Pops the handler frame on an exception return; the return PC comes from
/// the architectural EPC when the model knows it, the saved PC otherwise.
fn exception_return(generator: &mut Generator) -> Result<(), Error> {
    let frame = match generator.exception_stack.pop() {
        Some(frame) => frame,
        None => {
            warn!("exception return with empty exception stack");
            return Ok(());
        }
    };
    if generator.mode().in_exception() {
        generator.pop_gen_mode(GenModeFlags::EXCEPTION);
    }

    let epc = ["sepc", "mepc"]
        .iter()
        .find_map(|name| match generator.registers.is_initialized(name) {
            Ok((true, _)) => generator.registers.register_value(name).ok(),
            _ => None,
        })
        .unwrap_or(frame.saved_pc);
    info!("exception return to 0x{:x} (frame id {})", epc, frame.id);
    generator.gen_pc.set_aligned(epc);
    generator.update_vm()
}
