//! # signals
//! Registration of the fault handler for `SIGSEGV` and `SIGBUS`. The previous
//! disposition of every signal is kept, so that faults unrelated to the shadow
//! reach the handler the application (or the Rust runtime) installed before
//! us, and so that it can be restored when the runtime shuts down.
use core::{
    cell::UnsafeCell,
    ffi::{c_int, c_void},
    fmt::{self, Display, Formatter},
    mem, ptr,
    sync::atomic::{Ordering, compiler_fence},
};

use libc::{
    SA_NODEFER, SA_ONSTACK, SA_SIGINFO, SIG_DFL, SIG_IGN, SIGBUS, SIGSEGV, sigaction,
    sigemptyset, siginfo_t, ucontext_t,
};
use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::{
    GuestAddr,
    fault::{FaultDecoder, FaultingState, PatchError},
};

/// The signals the fault handler may be registered for
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    /// `SIGBUS` signal id
    SigBus = SIGBUS,
    /// `SIGSEGV` signal id
    SigSegmentationFault = SIGSEGV,
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Signal::SigBus => write!(f, "SIGBUS"),
            Signal::SigSegmentationFault => write!(f, "SIGSEGV"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum SignalError {
    #[error("Failed to set up the {0} handler, errno: {1}")]
    FailedToInstall(Signal, c_int),
    #[error("Failed to restore the {0} handler, errno: {1}")]
    FailedToRestore(Signal, c_int),
    #[error("A handler is already registered for {0}")]
    AlreadyRegistered(Signal),
}

pub trait SignalHandler {
    /// Handle a signal
    ///
    /// # Safety
    /// This is generally not safe to call. It should only be called through the signal it was registered for.
    unsafe fn handle(
        &mut self,
        signal: Signal,
        info: &mut siginfo_t,
        context: Option<&mut ucontext_t>,
    );

    /// Return a list of signals to handle
    fn signals(&self) -> Vec<Signal>;
}

struct HandlerHolder {
    handler: UnsafeCell<*mut dyn SignalHandler>,
    previous: sigaction,
}

unsafe impl Send for HandlerHolder {}

const MAX_SIGNALS: usize = 32;

/// Keep track of which handler is registered for which signal
static mut SIGNAL_HANDLERS: [Option<HandlerHolder>; MAX_SIGNALS] = [const { None }; MAX_SIGNALS];

fn errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

unsafe extern "C" fn handle_signal(sig: c_int, info: *mut siginfo_t, void: *mut c_void) {
    unsafe {
        let Ok(signal) = Signal::try_from(sig) else {
            return;
        };
        let handler = match &*(&raw const SIGNAL_HANDLERS[sig as usize]) {
            Some(holder) => &mut **holder.handler.get(),
            None => return,
        };
        let Some(info) = info.as_mut() else {
            return;
        };
        handler.handle(signal, info, (void as *mut ucontext_t).as_mut());
    }
}

/// Register `handler` for each of its signals.
///
/// # Safety
///
/// The handler pointer will be dereferenced from within the signal handler,
/// the data it points to must not move and must outlive the registration,
/// which ends with [`restore_signal_handlers`].
pub unsafe fn setup_signal_handler<T: 'static + SignalHandler>(
    handler: *mut T,
) -> Result<(), SignalError> {
    unsafe {
        let mut sa: sigaction = mem::zeroed();
        sigemptyset(&raw mut sa.sa_mask);
        sa.sa_flags = SA_NODEFER | SA_SIGINFO | SA_ONSTACK;
        sa.sa_sigaction = handle_signal as usize;
        for sig in (*handler).signals() {
            let slot = &raw mut SIGNAL_HANDLERS[i32::from(sig) as usize];
            if (*slot).is_some() {
                return Err(SignalError::AlreadyRegistered(sig));
            }
            let mut previous: sigaction = mem::zeroed();
            // Published before the handler can run
            ptr::write_volatile(
                slot,
                Some(HandlerHolder {
                    handler: UnsafeCell::new(handler as *mut dyn SignalHandler),
                    previous,
                }),
            );
            compiler_fence(Ordering::SeqCst);
            if sigaction(sig.into(), &raw const sa, &raw mut previous) < 0 {
                ptr::write_volatile(slot, None);
                return Err(SignalError::FailedToInstall(sig, errno()));
            }
            if let Some(holder) = (*slot).as_mut() {
                holder.previous = previous;
            }
            debug!("Installed {sig} handler");
        }
        compiler_fence(Ordering::SeqCst);
        Ok(())
    }
}

/// Reinstate the dispositions which were in place before `handler` was
/// registered.
///
/// # Safety
/// Must not race with [`setup_signal_handler`].
pub unsafe fn restore_signal_handlers<T: 'static + SignalHandler>(
    handler: *mut T,
) -> Result<(), SignalError> {
    unsafe {
        for sig in (*handler).signals() {
            let slot = &raw mut SIGNAL_HANDLERS[i32::from(sig) as usize];
            let Some(holder) = (*slot).as_ref() else {
                continue;
            };
            if !ptr::addr_eq(*holder.handler.get(), handler) {
                warn!("{sig} is registered to another handler");
                continue;
            }
            if sigaction(sig.into(), &raw const holder.previous, ptr::null_mut()) < 0 {
                return Err(SignalError::FailedToRestore(sig, errno()));
            }
            compiler_fence(Ordering::SeqCst);
            ptr::write_volatile(slot, None);
            debug!("Restored {sig} handler");
        }
        Ok(())
    }
}

/// Hand a signal to the disposition which was in place before our handler.
///
/// A previous handler is called directly. For the default (or ignored)
/// disposition, the default is reinstated and the handler returns, so that
/// the faulting instruction raises the signal again and the process
/// terminates as it would have without us.
///
/// # Safety
/// Must only be called from within the handler for `signal`.
pub unsafe fn deliver_to_previous(
    signal: Signal,
    info: &mut siginfo_t,
    context: Option<&mut ucontext_t>,
) {
    unsafe {
        let sig: c_int = signal.into();
        let previous = match &*(&raw const SIGNAL_HANDLERS[sig as usize]) {
            Some(holder) => holder.previous,
            None => {
                let mut dfl: sigaction = mem::zeroed();
                dfl.sa_sigaction = SIG_DFL;
                dfl
            }
        };
        if previous.sa_sigaction == SIG_DFL || previous.sa_sigaction == SIG_IGN {
            let mut dfl: sigaction = mem::zeroed();
            dfl.sa_sigaction = SIG_DFL;
            sigaction(sig, &raw const dfl, ptr::null_mut());
            return;
        }
        let context = context.map_or(ptr::null_mut(), |c| ptr::from_mut(c).cast::<c_void>());
        if previous.sa_flags & SA_SIGINFO != 0 {
            let action: unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                mem::transmute(previous.sa_sigaction);
            action(sig, ptr::from_mut(info), context);
        } else {
            let action: unsafe extern "C" fn(c_int) = mem::transmute(previous.sa_sigaction);
            action(sig);
        }
    }
}

/// The machine context of a thread stopped in a signal handler
pub struct UcontextState<'a> {
    context: Option<&'a mut ucontext_t>,
    decoder: Option<&'a dyn FaultDecoder>,
}

impl fmt::Debug for UcontextState<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UcontextState")
            .field("context", &self.context.as_ref().map(|c| ptr::from_ref(&**c)))
            .field("decoder", &self.decoder)
            .finish()
    }
}

impl<'a> UcontextState<'a> {
    pub fn new(context: Option<&'a mut ucontext_t>, decoder: Option<&'a dyn FaultDecoder>) -> Self {
        Self { context, decoder }
    }

    pub fn into_context(self) -> Option<&'a mut ucontext_t> {
        self.context
    }
}

impl FaultingState for UcontextState<'_> {
    fn patch(&mut self, access: GuestAddr, shadow: GuestAddr) -> Result<(), PatchError> {
        // The shadow base never moves, the register already holds the right address
        if access == shadow {
            return Ok(());
        }
        let context = self.context.as_deref_mut().ok_or(PatchError::NoContext)?;
        let pc = arch::pc(context)?;
        let decoder = self.decoder.ok_or(PatchError::NoDecoder(pc))?;
        let reg = decoder
            .faulting_register(pc)
            .ok_or(PatchError::UnknownRegister(pc))?;
        arch::set_reg(context, reg, shadow).map_err(|_| PatchError::UnknownRegister(pc))
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod arch {
    use libc::{REG_RIP, greg_t, ucontext_t};

    use crate::{GuestAddr, fault::PatchError};

    pub fn pc(context: &ucontext_t) -> Result<GuestAddr, PatchError> {
        Ok(context.uc_mcontext.gregs[REG_RIP as usize] as GuestAddr)
    }

    pub fn set_reg(context: &mut ucontext_t, reg: usize, value: GuestAddr) -> Result<(), PatchError> {
        let slot = context
            .uc_mcontext
            .gregs
            .get_mut(reg)
            .ok_or(PatchError::Unsupported)?;
        *slot = value as greg_t;
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod arch {
    use libc::ucontext_t;

    use crate::{GuestAddr, fault::PatchError};

    pub fn pc(context: &ucontext_t) -> Result<GuestAddr, PatchError> {
        Ok(context.uc_mcontext.pc as GuestAddr)
    }

    pub fn set_reg(context: &mut ucontext_t, reg: usize, value: GuestAddr) -> Result<(), PatchError> {
        let slot = context
            .uc_mcontext
            .regs
            .get_mut(reg)
            .ok_or(PatchError::Unsupported)?;
        *slot = value as u64;
        Ok(())
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod arch {
    use libc::ucontext_t;

    use crate::{GuestAddr, fault::PatchError};

    pub fn pc(_context: &ucontext_t) -> Result<GuestAddr, PatchError> {
        Err(PatchError::Unsupported)
    }

    pub fn set_reg(
        _context: &mut ucontext_t,
        _reg: usize,
        _value: GuestAddr,
    ) -> Result<(), PatchError> {
        Err(PatchError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedDecoder(usize);

    impl FaultDecoder for FixedDecoder {
        fn faulting_register(&self, _pc: GuestAddr) -> Option<usize> {
            Some(self.0)
        }
    }

    #[test]
    fn test_signal_numbers() {
        assert_eq!(i32::from(Signal::SigSegmentationFault), libc::SIGSEGV);
        assert!(matches!(Signal::try_from(libc::SIGBUS), Ok(Signal::SigBus)));
        assert_eq!(Signal::SigBus.to_string(), "SIGBUS");
    }

    #[test]
    fn test_patch_same_address_is_noop() {
        let mut state = UcontextState::new(None, None);
        assert_eq!(state.patch(0x1000, 0x1000), Ok(()));
        assert_eq!(state.patch(0x1000, 0x2000), Err(PatchError::NoContext));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_patch_register() {
        let mut context: ucontext_t = unsafe { mem::zeroed() };
        let decoder = FixedDecoder(libc::REG_RAX as usize);
        let mut state = UcontextState::new(Some(&mut context), Some(&decoder));
        assert_eq!(state.patch(0x1000, 0x2000), Ok(()));
        assert_eq!(context.uc_mcontext.gregs[libc::REG_RAX as usize], 0x2000);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_patch_without_decoder() {
        let mut context: ucontext_t = unsafe { mem::zeroed() };
        context.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x4000;
        let mut state = UcontextState::new(Some(&mut context), None);
        assert_eq!(state.patch(0x1000, 0x2000), Err(PatchError::NoDecoder(0x4000)));
    }
}
