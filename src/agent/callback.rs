//! The callback agent: requests crossing back toward the front-end
//! boundary. Handlers are native strategies; the current BNT hook names the
//! sequence a node is serviced under.

use log::{debug, info};

use crate::error::Error;
use crate::generator::Generator;
use crate::request::GenCallbackRequest;

/// Handles one callback request.
pub fn handle(generator: &mut Generator, request: GenCallbackRequest) -> Result<(), Error> {
    match request {
        GenCallbackRequest::Bnt(node) => {
            let hook = generator
                .bnt_hooks
                .bnt_hook()
                .map(|hook| (hook.sequence_name().to_string(), hook.function_name().to_string()));
            match hook {
                Some((sequence, function)) => {
                    info!(
                        "servicing BNT node {} through hook {}:{}",
                        node.id(),
                        sequence,
                        function
                    );
                }
                None => debug!("servicing BNT node {} with no hook installed", node.id()),
            }
            crate::agent::sequence::process_bnt_node(generator, node)
        }
        GenCallbackRequest::Eret => {
            info!("exception-return callback delivered");
            Ok(())
        }
    }
}
