//! This module provides an `Error` type for the crate using the [`thiserror`] crate.

use thiserror::Error;

/// The `Error` type. Every recoverable generation failure is represented
/// here; invariant violations abort through a tagged panic instead, since no
/// caller can meaningfully continue past them.
#[derive(Debug, Error)]
pub enum Error {
    /// A value was requested from an empty constraint set.
    #[error("constraint set is empty")]
    EmptyConstraint,
    /// No value satisfying the operand constraints could be found.
    #[error("no value satisfies constraints: {0}")]
    ConstraintExhausted(String),
    /// The virtual memory system could not map the requested range. Carries
    /// the constraints that were rejected so the caller can retry relaxed.
    #[error("mapping failed for VA 0x{va:x} size 0x{size:x}: {rejected}")]
    MappingFailed {
        /// Start of the range that failed to map.
        va: u64,
        /// Size of the range that failed to map.
        size: u64,
        /// String form of the rejected constraints.
        rejected: String,
    },
    /// The virtual address is not covered by any page of the active mapper.
    #[error("VA 0x{0:x} is not translated")]
    NotTranslated(u64),
    /// The physical address has no virtual mapping in the active mapper.
    #[error("PA 0x{0:x} has no virtual mapping")]
    NoVaForPa(u64),
    /// Registers were reserved by another reserver for the same access.
    #[error("register indices {0} already reserved")]
    RegisterReserved(String),
    /// An unreserve did not match any prior reservation.
    #[error("register indices {0} are not reserved")]
    RegisterNotReserved(String),
    /// A register lookup by name failed.
    #[error("unknown register {0:?}")]
    UnknownRegister(String),
    /// The choice tree or variable for a named choice is empty.
    #[error("choice {0:?} has no usable entries")]
    EmptyChoice(String),
    /// The simulator reported a step failure.
    #[error("simulator step failed: {0}")]
    SimStepFailed(String),
    /// The generator has no simulator attached but one was required.
    #[error("no simulator attached")]
    NoSimulator,
    /// A restore loop request arrived in an unsupported mode.
    #[error("restore loop unsupported here: {0}")]
    RestoreLoopUnsupported(String),
    /// An exception arrived while servicing an exception and nesting is
    /// disallowed by configuration.
    #[error("exception 0x{0:x} while already in exception handling")]
    ExceptionInException(u32),
    /// Wraps [`std::io::Error`] from dump file writing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
