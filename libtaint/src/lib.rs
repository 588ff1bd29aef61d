//! # libtaint
//! `libtaint` tracks the flow of data through a running process at byte
//! granularity. Every general purpose register and every 4 byte aligned word
//! of application memory carries a one byte [`Tag`]. Instructions are
//! classified once, when their block is first analyzed, and the resulting
//! [`propagate::Plan`] moves tags from the sources of the instruction to its
//! destinations before the instruction itself executes.
//!
//! The crate is built from the following components:
//!
//! - [`mmap`] - Anonymous page mappings used to back the shadow memory.
//! - [`shadow`] - The shadow memory store. The default [`shadow::lazy::LazyShadow`]
//!   backend reserves the full shadow range read-only, so that every untouched
//!   region reads as the kernel's shared zero page, and commits a private page
//!   the first time a region is written.
//! - [`regs`] and [`context`] - The per thread shadow register bank and the
//!   spill slots used by inline code.
//! - [`instr`] - The canonical instruction model consumed by the rule engine.
//! - [`propagate`] - The rule engine, the inline code lowering and the out of
//!   line emulation of block transfers.
//! - [`fault`] and [`signals`] - Recovery of the protection faults raised when
//!   inline code writes to a region which has not yet been materialized.
//! - [`runtime`] - The process wide [`runtime::Taint`] handle exposing the
//!   query and set API.
//! - [`dump`] - Serialization of every materialized region.
//!
//! Hosts (a dynamic binary instrumentation engine, an emulator, or a test
//! harness) drive the engine through the [`propagate::Emitter`] and
//! [`instr::MachineState`] traits.
#![cfg_attr(not(test), warn(missing_debug_implementations))]

pub mod context;
pub mod dump;
pub mod error;
pub mod fault;
pub mod instr;
pub mod mmap;
pub mod options;
pub mod propagate;
pub mod regs;
pub mod runtime;
pub mod shadow;
pub mod signals;

use core::fmt::Display;

pub use error::Error;
pub use options::{GapPolicy, ShadowBackend, TaintOptions};
pub use runtime::{Taint, ThreadHandle};

/// An address in the application (guest) or in the shadow
pub type GuestAddr = usize;

/// A taint tag, `0` means untainted
pub type Tag = u8;

/// Identifies the client which requested the runtime
pub type ClientId = u32;

/// The tag of data which is not tainted
pub const UNTAINTED: Tag = 0;

/// Report an unrecoverable condition and terminate the process.
///
/// Used for the failures which cannot be reported to the caller, such as those
/// raised whilst recovering from a fault in inline code.
#[cold]
pub fn fatal(msg: impl Display) -> ! {
    log::error!("libtaint: fatal: {msg}");
    std::process::abort()
}
