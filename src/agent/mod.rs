//! Typed request handlers. Dispatch is a direct request-kind to handler
//! mapping; an agent validates its preconditions, may prepend further
//! requests, and eventually commits a persisted artefact.

pub mod callback;
pub mod exception;
pub mod instruction;
pub mod query;
pub mod sequence;
pub mod state;
pub mod state_transition;
pub mod virtual_memory;

use crate::error::Error;
use crate::generator::Generator;
use crate::request::GenRequest;

/// Routes one request to its agent.
pub fn dispatch(generator: &mut Generator, request: GenRequest) -> Result<(), Error> {
    match request {
        GenRequest::Instruction(request) => instruction::handle(generator, request),
        GenRequest::Sequence(request) => sequence::handle(generator, request),
        GenRequest::State(request) => state::handle(generator, request),
        GenRequest::Exception(request) => exception::handle(generator, request),
        GenRequest::VirtualMemory(request) => virtual_memory::handle(generator, request),
        GenRequest::Callback(request) => callback::handle(generator, request),
        GenRequest::Query(request) => query::handle(generator, request),
        GenRequest::StateTransition(request) => state_transition::handle(generator, request),
    }
}
