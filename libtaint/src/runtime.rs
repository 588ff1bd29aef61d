//! # runtime
//! The process wide runtime. There is at most one live runtime, shared by
//! every [`Taint`] handle. The first call to [`Taint::init`] creates the
//! shadow memory and installs the fault handler, later calls share it. The
//! runtime is torn down when the last handle is dropped, and a later `init`
//! starts from scratch.
//!
//! Threads obtain their shadow register bank through [`Taint::thread_init`].
use core::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Arc,
};

use log::{error, info, warn};
use spin::Mutex;

use crate::{
    ClientId, Error, GuestAddr, ShadowBackend, Tag, TaintOptions,
    context::ThreadContext,
    dump,
    error::RuntimeShadowError,
    fatal,
    fault::{FaultDecoder, ShadowFaultHandler},
    instr::{Instr, MachineState, Opcode},
    mmap::linux::LinuxMmap,
    propagate::{Emitter, InterpError, Interpreter, LowerError, MetaInstr, Plan, Propagator},
    regs::Reg,
    shadow::{DefaultShadowLayout, Shadow, dense::DenseShadow, lazy::LazyShadow},
    signals::{restore_signal_handlers, setup_signal_handler},
};

/// The shadow as seen by the runtime, whichever backend was selected
pub type DynShadow = dyn Shadow<Error = RuntimeShadowError>;

type FaultHandler = ShadowFaultHandler<DynShadow>;

/// A fault handler registered for its signals, deregistered on drop
#[derive(Debug)]
struct InstalledHandler(NonNull<FaultHandler>);

// The handler is only dereferenced by the signal trampoline and on drop
unsafe impl Send for InstalledHandler {}
unsafe impl Sync for InstalledHandler {}

impl InstalledHandler {
    fn install(handler: FaultHandler) -> Result<Self, Error> {
        let raw = Box::into_raw(Box::new(handler));
        // Owned from here on, so a failed install is undone by drop
        let installed = Self(unsafe { NonNull::new_unchecked(raw) });
        unsafe { setup_signal_handler(raw) }?;
        Ok(installed)
    }
}

impl Drop for InstalledHandler {
    fn drop(&mut self) {
        let raw = self.0.as_ptr();
        if let Err(e) = unsafe { restore_signal_handlers(raw) } {
            error!("Failed to restore signal handlers: {e}");
            // Still registered, leak the handler rather than leave a dangling pointer
            return;
        }
        drop(unsafe { Box::from_raw(raw) });
    }
}

#[derive(Debug)]
struct Runtime {
    id: ClientId,
    options: TaintOptions,
    fault_handler: Option<InstalledHandler>,
    shadow: Arc<DynShadow>,
    propagator: Propagator,
}

impl Runtime {
    fn new(
        id: ClientId,
        options: TaintOptions,
        decoder: Option<Box<dyn FaultDecoder>>,
    ) -> Result<Self, Error> {
        let shadow: Arc<DynShadow> = match options.backend {
            ShadowBackend::Lazy => Arc::new(LazyShadow::<LinuxMmap, DefaultShadowLayout>::new()?),
            ShadowBackend::Dense => Arc::new(DenseShadow::<LinuxMmap, DefaultShadowLayout>::new()?),
        };
        let fault_handler = if options.backend == ShadowBackend::Lazy
            && options.install_fault_handler
        {
            let handler = ShadowFaultHandler::new(shadow.clone(), decoder);
            Some(InstalledHandler::install(handler)?)
        } else {
            None
        };
        let range = shadow.shadow_range();
        info!(
            "Taint runtime initialized - client: {id}, backend: {:?}, shadow: {:#x}-{:#x}",
            options.backend, range.start, range.end
        );
        Ok(Self {
            id,
            propagator: Propagator::new(options.policy, options.track_pc),
            options,
            fault_handler,
            shadow,
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let gaps = self.propagator.gaps().seen();
        if !gaps.is_empty() {
            info!("Unhandled opcodes: {gaps:?}");
        }
        let malformed = self.propagator.gaps().malformed();
        if !malformed.is_empty() {
            info!("Opcodes seen with malformed operands: {malformed:?}");
        }
        info!(
            "Taint runtime exiting - client: {}, materialized regions: {}",
            self.id,
            self.shadow.materialized_regions()
        );
    }
}

/// The live runtime, if any
static RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

/// A handle to the process wide runtime
#[derive(Debug)]
pub struct Taint {
    runtime: ManuallyDrop<Arc<Runtime>>,
}

impl Taint {
    /// Initialize the runtime for client `id`, or share the live one
    pub fn init(id: ClientId, options: TaintOptions) -> Result<Self, Error> {
        Self::init_with_decoder(id, options, None)
    }

    /// As [`Taint::init`], with a decoder which lets the fault handler patch
    /// the register dereferenced by a faulting shadow store
    pub fn init_with_decoder(
        id: ClientId,
        options: TaintOptions,
        decoder: Option<Box<dyn FaultDecoder>>,
    ) -> Result<Self, Error> {
        let mut live = RUNTIME.lock();
        if let Some(runtime) = live.as_ref() {
            if runtime.options != options {
                warn!(
                    "Runtime already initialized by client {} with {:?}, ignoring {options:?}",
                    runtime.id, runtime.options
                );
            }
            return Ok(Self {
                runtime: ManuallyDrop::new(runtime.clone()),
            });
        }
        let runtime = Arc::new(Runtime::new(id, options, decoder)?);
        *live = Some(runtime.clone());
        Ok(Self {
            runtime: ManuallyDrop::new(runtime),
        })
    }

    /// Release this handle, the last one shuts the runtime down
    pub fn exit(self) {
        drop(self);
    }

    /// Whether a runtime is currently live
    #[must_use]
    pub fn is_initialized() -> bool {
        RUNTIME.lock().is_some()
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.runtime.id
    }

    #[must_use]
    pub fn options(&self) -> &TaintOptions {
        &self.runtime.options
    }

    #[must_use]
    pub fn shadow(&self) -> &DynShadow {
        &*self.runtime.shadow
    }

    #[must_use]
    pub fn propagator(&self) -> &Propagator {
        &self.runtime.propagator
    }

    /// Opcodes reported as coverage gaps so far
    #[must_use]
    pub fn gaps(&self) -> Vec<Opcode> {
        self.runtime.propagator.gaps().seen()
    }

    #[must_use]
    pub fn materialized_regions(&self) -> usize {
        self.runtime.shadow.materialized_regions()
    }

    pub fn get_mem_taint(&self, addr: GuestAddr) -> Result<Tag, Error> {
        Ok(self.runtime.shadow.get(addr)?)
    }

    pub fn set_mem_taint(&self, addr: GuestAddr, tag: Tag) -> Result<(), Error> {
        Ok(self.runtime.shadow.set(addr, tag)?)
    }

    pub fn get_reg_taint(&self, ctx: &ThreadContext, reg: Reg) -> Result<Tag, Error> {
        Ok(ctx.get_reg(reg)?)
    }

    pub fn set_reg_taint(&self, ctx: &mut ThreadContext, reg: Reg, tag: Tag) -> Result<(), Error> {
        Ok(ctx.set_reg(reg, tag)?)
    }

    /// Create the shadow register bank of the calling thread and register it
    /// as the thread's current context
    #[must_use]
    pub fn thread_init(&self) -> ThreadHandle {
        ThreadHandle::new(self.runtime.options.track_pc)
    }

    pub fn analyze(&self, instr: &Instr) -> Result<Plan, Error> {
        Ok(self.runtime.propagator.analyze(instr)?)
    }

    /// Propagate the taint of `instr`, which is about to execute with the
    /// register values in `machine`. As with [`Taint::instrument`], a coverage
    /// gap in strict mode terminates the process; [`Taint::analyze`] reports
    /// it as an error instead.
    pub fn propagate<M: MachineState + ?Sized>(
        &self,
        ctx: &mut ThreadContext,
        instr: &Instr,
        machine: &M,
    ) -> Result<(), Error> {
        let plan = match self.runtime.propagator.analyze(instr) {
            Ok(plan) => plan,
            Err(e) => fatal(format_args!("{instr}: {e}")),
        };
        self.runtime
            .propagator
            .apply(&plan, &*self.runtime.shadow, ctx, machine)?;
        Ok(())
    }

    /// Insert the meta code propagating the taint of `instr` through
    /// `emitter`. A coverage gap in strict mode terminates the process.
    pub fn instrument<E: Emitter + ?Sized>(
        &self,
        instr: &Instr,
        emitter: &mut E,
    ) -> Result<Plan, Error> {
        match self.runtime.propagator.instrument(instr, emitter) {
            Ok(plan) => Ok(plan),
            Err(LowerError::Propagation(e)) => fatal(format_args!("{instr}: {e}")),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute meta code on behalf of the thread owning `ctx`. A failure to
    /// recover a shadow fault terminates the process.
    pub fn execute<M: MachineState + ?Sized>(
        &self,
        ctx: &mut ThreadContext,
        code: &[MetaInstr],
        machine: &M,
    ) -> Result<(), Error> {
        match Interpreter::new(&*self.runtime.shadow, machine).run(ctx, code) {
            Ok(()) => Ok(()),
            Err(InterpError::Fault(e)) => fatal(e),
            Err(e) => Err(e.into()),
        }
    }

    /// Write every materialized region to `sink`, returns the number of
    /// regions written
    pub fn dump<W: Write + ?Sized>(&self, sink: &mut W) -> Result<usize, Error> {
        Ok(dump::write_dump(&*self.runtime.shadow, sink)?)
    }

    pub fn dump_to_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, Error> {
        let path = path.as_ref();
        let mut sink = BufWriter::new(File::create(path)?);
        let regions = self.dump(&mut sink)?;
        info!("Dumped {regions} regions to {}", path.display());
        Ok(regions)
    }
}

impl Clone for Taint {
    fn clone(&self) -> Self {
        Self {
            runtime: ManuallyDrop::new(Arc::clone(&self.runtime)),
        }
    }
}

impl Drop for Taint {
    fn drop(&mut self) {
        let mut live = RUNTIME.lock();
        let runtime = unsafe { ManuallyDrop::take(&mut self.runtime) };
        // Ours and the registry's
        if Arc::strong_count(&runtime) == 2 {
            *live = None;
        }
        drop(runtime);
    }
}

/// The shadow register bank of a thread, registered as the thread's current
/// context for as long as the handle lives
#[derive(Debug)]
pub struct ThreadHandle {
    ctx: Box<ThreadContext>,
    _not_send: PhantomData<*mut ()>,
}

impl ThreadHandle {
    fn new(track_pc: bool) -> Self {
        if ThreadContext::current().is_some() {
            warn!("Replacing the current context of this thread");
        }
        let mut ctx = Box::new(ThreadContext::new(track_pc));
        unsafe { ThreadContext::register(&raw mut *ctx) };
        Self {
            ctx,
            _not_send: PhantomData,
        }
    }
}

impl Deref for ThreadHandle {
    type Target = ThreadContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl DerefMut for ThreadHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        ThreadContext::unregister();
    }
}
