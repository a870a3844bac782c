//! The state-transition agent: collects the requested state elements,
//! merges duplicates, and schedules the ordered realising requests.

use log::debug;

use crate::error::Error;
use crate::generator::Generator;
use crate::request::GenStateTransitionRequest;

/// Handles one state-transition request.
pub fn handle(generator: &mut Generator, request: GenStateTransitionRequest) -> Result<(), Error> {
    debug!("state transition with {} elements", request.elements.len());
    for element in request.elements {
        generator.state_transitions.add_element(element);
    }
    let requests = generator.state_transitions.generate_transition();
    generator.prepend_requests(requests);
    Ok(())
}
