//! # debug-host
//!
//! Host side services of an on chip debug server.
//!
//! The crate sits between a debug-port layer (JTAG/SWD probe drivers, register and memory
//! access) and the host machine the debugger runs on. It provides:
//!
//! * [`semihosting`]: the ARM semihosting call dispatcher. When a target traps on a
//!   semihosting instruction, the request is latched into a [`Semihosting`] session and
//!   [`Semihosting::dispatch_pending_call`] decodes the parameter block, performs the
//!   requested host I/O (or stages it for a remote GDB client) and posts the result back
//!   into the target.
//! * [`trace`]: the TPIU/SWO trace capture state machine, which streams captured trace
//!   bytes into files, TCP clients and registered callbacks.
//!
//! The debug-port layer is consumed through the narrow [`Target`] trait.
//!
//! ## Example
//!
//! ```no_run
//! use debug_host::{semihosting::RegisterAbi, Semihosting, Target};
//!
//! fn attach(target: &mut dyn Target) -> Result<Semihosting, debug_host::Error> {
//!     let mut session = Semihosting::new(target, RegisterAbi);
//!     session.enable(target, true)?;
//!     Ok(session)
//! }
//!
//! fn on_semihosting_trap(session: &mut Semihosting, target: &mut dyn Target) -> Result<(), debug_host::Error> {
//!     session.latch_from_registers(target)?;
//!     session.dispatch_pending_call(target)
//! }
//! ```
#![warn(missing_docs)]
#![cfg_attr(probers_docsrs, feature(doc_cfg))]

pub mod config;
mod error;
pub mod semihosting;
pub mod target;
pub mod trace;

#[cfg(any(test, feature = "test"))]
pub mod test_util;

pub use crate::error::Error;
pub use crate::semihosting::Semihosting;
pub use crate::target::{CoreRegister, Endian, Target, TargetError, WordSize};
pub use crate::trace::{TraceError, TraceUnit, TraceUnits};
