//! # libtaint_aslr
//! Detection of address leaks on top of [`libtaint`]. Every place where the
//! application learns an address is a taint source, and every buffer handed
//! to an output system call is checked for tainted bytes before the call is
//! made.
//!
//! - Stack addresses derive from `sp` and from the `argv` and `envp` arrays
//!   the kernel places on the initial stack.
//! - Heap addresses are returned by the `brk` and `mmap2` system calls, which
//!   also map shared libraries.
//! - Code addresses appear when an instruction uses `pc` as an operand. This
//!   needs a runtime initialized with `track_pc`.
//!
//! The host calls into an [`AslrGuard`] from its thread, instruction and
//! system call events.
#![cfg_attr(not(test), warn(missing_debug_implementations))]

pub mod guard;
pub mod options;
pub mod syscall;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub use guard::AslrGuard;
pub use options::AslrOptions;
pub use syscall::{Leak, SyscallNumber, SyscallVerdict};

/// The tag given to each class of address
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaintClass {
    Stack = 0x41,
    Text = 0x42,
    Heap = 0x43,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Taint(#[from] libtaint::Error),
    #[error("Failed to parse options: {0}")]
    Options(#[from] toml::de::Error),
    #[error("Failed to read options: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to emit instrumentation: {0}")]
    Emitter(String),
}
