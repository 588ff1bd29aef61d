//! # error
//! The error returned by the public API. Each component has its own error
//! type, which converts into [`Error`].
use std::io;

use thiserror::Error;

use crate::{
    dump::DumpError,
    fault::FaultError,
    mmap::linux::LinuxMmap,
    propagate::{ApplyError, InterpError, LowerError, PropagationError},
    regs::RegisterError,
    shadow::ShadowError,
    signals::SignalError,
};

/// The shadow error of the backends the runtime creates
pub type RuntimeShadowError = ShadowError<LinuxMmap>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Shadow(#[from] RuntimeShadowError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
    #[error(transparent)]
    Apply(#[from] ApplyError<RuntimeShadowError>),
    #[error(transparent)]
    Interp(#[from] InterpError<RuntimeShadowError>),
    #[error(transparent)]
    Fault(#[from] FaultError<RuntimeShadowError>),
    #[error("Failed to emit instrumentation: {0}")]
    Emitter(String),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Dump(#[from] DumpError),
    #[error("Failed to parse options: {0}")]
    Options(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl<E: core::fmt::Debug> From<LowerError<E>> for Error {
    fn from(err: LowerError<E>) -> Self {
        match err {
            LowerError::Propagation(e) => Self::Propagation(e),
            LowerError::Emitter(e) => Self::Emitter(format!("{e:?}")),
        }
    }
}
