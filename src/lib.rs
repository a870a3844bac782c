//! The rvgen crate is a deterministic instruction-stream generator core for
//! RISC-V CPU verification. Given a sequence of generation requests, it emits
//! committed machine instructions together with a consistent memory image,
//! page tables and architectural register state, such that a faithful
//! simulator started from that image executes the stream without unintended
//! exceptions.
//!
//! The crate models the world the generated test runs in:
//!  * interval-set constraints over addresses, register indices and values,
//!  * a banked sparse memory with per-byte attributes,
//!  * a virtual memory system with regimes, address spaces and page tables,
//!  * the per-hart register file with reservation and dependence tracking,
//!  * branch-not-taken and restore-loop state recording,
//!
//! and couples each committed instruction to an external instruction-set
//! simulator through the [`sim::SimApi`] trait.

pub mod agent;
pub mod arch;
pub mod bnt;
pub mod config;
pub mod constraint;
pub mod data_station;
pub mod error;
pub mod gen_mode;
pub mod gen_pc;
pub mod generator;
pub mod memory;
pub mod pe_state;
pub mod register;
pub mod request;
pub mod restore;
pub mod results;
pub mod rng;
pub mod sim;
pub mod state_element;
pub mod vm;

pub use crate::constraint::{Constraint, ConstraintSet};
pub use crate::error::Error;
pub use crate::gen_mode::GenModeFlags;
pub use crate::generator::{Generator, Instruction};
pub use crate::memory::{MemBank, MemoryManager};
pub use crate::request::GenRequest;
pub use crate::sim::{ExceptionUpdate, MemUpdate, RegUpdate, SimApi};
