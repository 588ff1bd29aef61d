//! # fault
//! Recovery of the protection faults raised by inline code writing to a
//! shadow region which is still backed by the shared zero page.
//!
//! Before every shadow access, inline code saves the application address it
//! is about to translate to [`SpillSlot::AppAddress`]. When the store faults,
//! the handler materializes the region of that address, patches the register
//! which held the stale shadow address and resumes the faulting store.
//!
//! [`handle_shadow_fault`] holds the recovery logic and is shared by the
//! signal handler ([`ShadowFaultHandler`]) and the reference interpreter.
use core::fmt::Debug;
use std::sync::Arc;

use libc::{siginfo_t, ucontext_t};
use log::{debug, trace};
use thiserror::Error;

use crate::{
    GuestAddr,
    context::{SpillSlot, ThreadContext},
    fatal,
    shadow::{PageKind, Shadow},
    signals::{self, Signal, SignalHandler, UcontextState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Not caused by the shadow, hand it to the previous disposition
    Deliver,
    /// The shadow is ready, re-execute the faulting store
    Resume,
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum PatchError {
    #[error("No machine context available")]
    NoContext,
    #[error("No decoder registered to patch the instruction at {0:#x}")]
    NoDecoder(GuestAddr),
    #[error("Unable to identify the faulting register at {0:#x}")]
    UnknownRegister(GuestAddr),
    #[error("Register patching is not supported on this architecture")]
    Unsupported,
}

#[derive(Error, Debug, PartialEq)]
pub enum FaultError<E: Debug> {
    #[error("Failed to materialize shadow: {0:?}")]
    Shadow(E),
    #[error("Saved address {saved:#x} does not match the faulting shadow access {access:#x}")]
    SlotMismatch { access: GuestAddr, saved: GuestAddr },
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// The machine state of the faulting thread
pub trait FaultingState {
    /// Replace the stale shadow address `access`, held by the register the
    /// faulting store dereferences, with `shadow`
    fn patch(&mut self, access: GuestAddr, shadow: GuestAddr) -> Result<(), PatchError>;
}

/// Identifies the register dereferenced by a faulting store, supplied by
/// hosts which know how their inline code was encoded
pub trait FaultDecoder: Debug + Send + Sync {
    /// Index of the faulting store's address register in the machine context
    fn faulting_register(&self, pc: GuestAddr) -> Option<usize>;
}

/// Handle a write fault at `access`, given the application address `saved`
/// that inline code stored in the spill slot.
pub fn handle_shadow_fault<S, F>(
    shadow: &S,
    access: GuestAddr,
    saved: GuestAddr,
    state: &mut F,
) -> Result<FaultAction, FaultError<S::Error>>
where
    S: Shadow + ?Sized,
    F: FaultingState + ?Sized,
{
    match shadow.page_kind(access) {
        None => Ok(FaultAction::Deliver),
        // Another thread committed the region after the store faulted
        Some(PageKind::Private) => {
            trace!("fault - access: {access:#x} already materialized");
            Ok(FaultAction::Resume)
        }
        Some(PageKind::Shared) => {
            let fresh = shadow.materialize(saved).map_err(FaultError::Shadow)?;
            if shadow.page_kind(access) != Some(PageKind::Private) {
                return Err(FaultError::SlotMismatch { access, saved });
            }
            state.patch(access, fresh)?;
            debug!("fault - access: {access:#x}, app: {saved:#x}, shadow: {fresh:#x}");
            Ok(FaultAction::Resume)
        }
    }
}

/// Signal handler recovering shadow faults raised by inline code
#[derive(Debug)]
pub struct ShadowFaultHandler<S: Shadow + ?Sized + 'static> {
    shadow: Arc<S>,
    decoder: Option<Box<dyn FaultDecoder>>,
}

impl<S: Shadow + ?Sized + 'static> ShadowFaultHandler<S> {
    pub fn new(shadow: Arc<S>, decoder: Option<Box<dyn FaultDecoder>>) -> Self {
        Self { shadow, decoder }
    }
}

impl<S: Shadow + ?Sized + 'static> SignalHandler for ShadowFaultHandler<S> {
    unsafe fn handle(
        &mut self,
        signal: Signal,
        info: &mut siginfo_t,
        context: Option<&mut ucontext_t>,
    ) {
        let access = unsafe { info.si_addr() } as GuestAddr;
        let Some(ctx) = ThreadContext::current() else {
            unsafe { signals::deliver_to_previous(signal, info, context) };
            return;
        };
        let saved = unsafe { (*ctx).slot(SpillSlot::AppAddress) };
        let mut state = UcontextState::new(context, self.decoder.as_deref());
        match handle_shadow_fault(&*self.shadow, access, saved, &mut state) {
            Ok(FaultAction::Resume) => {}
            Ok(FaultAction::Deliver) => unsafe {
                signals::deliver_to_previous(signal, info, state.into_context());
            },
            Err(e) => fatal(e),
        }
    }

    fn signals(&self) -> Vec<Signal> {
        vec![Signal::SigSegmentationFault, Signal::SigBus]
    }
}
