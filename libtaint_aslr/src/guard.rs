//! # guard
//! The event handlers of the address leak policy.
use libtaint::{
    GuestAddr, Taint, ThreadHandle,
    context::ThreadContext,
    instr::Instr,
    propagate::{Emitter, MetaInstr, Scratch},
    regs::Reg,
};
use log::{debug, info, warn};

use crate::{AslrOptions, Error, Leak, SyscallNumber, SyscallVerdict, TaintClass};

const WORD: usize = 4;

#[derive(Debug)]
pub struct AslrGuard {
    taint: Taint,
    options: AslrOptions,
}

impl AslrGuard {
    #[must_use]
    pub fn new(taint: Taint, options: AslrOptions) -> Self {
        if !taint.options().track_pc {
            warn!("pc is not tracked, code address leaks will not be detected");
        }
        Self { taint, options }
    }

    #[must_use]
    pub fn taint(&self) -> &Taint {
        &self.taint
    }

    #[must_use]
    pub fn options(&self) -> &AslrOptions {
        &self.options
    }

    /// Set up the calling thread, whose `sp` holds a stack address
    pub fn on_thread_init(&self) -> Result<ThreadHandle, Error> {
        let mut thread = self.taint.thread_init();
        self.taint
            .set_reg_taint(&mut thread, Reg::SP, TaintClass::Stack.into())?;
        Ok(thread)
    }

    /// Taint the `argv` and `envp` pointer arrays of the initial stack. `sp`
    /// is the stack pointer at the entry point of the executable, where the
    /// kernel left `argc` followed by the two null terminated arrays.
    /// `read_word` reads a word of application memory.
    pub fn on_entry<R>(&self, sp: GuestAddr, read_word: R) -> Result<(), Error>
    where
        R: Fn(GuestAddr) -> Option<u32>,
    {
        let Some(argc) = read_word(sp) else {
            warn!("Unable to read argc at {sp:#x}");
            return Ok(());
        };
        let argv = sp + WORD;
        let envp = argv + (argc as usize + 1) * WORD;
        let envc = (0..)
            .map(|i| envp + i * WORD)
            .take_while(|addr| read_word(*addr).is_some_and(|w| w != 0))
            .count();
        self.taint_stack(argv, argc as usize, envp, envc)
    }

    /// Taint `argc` words from `argv` and `envc` words from `envp`
    pub fn taint_stack(
        &self,
        argv: GuestAddr,
        argc: usize,
        envp: GuestAddr,
        envc: usize,
    ) -> Result<(), Error> {
        let words = (0..argc)
            .map(|i| argv + i * WORD)
            .chain((0..envc).map(|i| envp + i * WORD));
        for addr in words {
            self.taint.set_mem_taint(addr, TaintClass::Stack.into())?;
        }
        debug!("Tainted argv: {argv:#x} ({argc}), envp: {envp:#x} ({envc})");
        Ok(())
    }

    /// Taint `pc` if `instr` reads it, so that its propagation marks the
    /// destination as a code address. Must run before the propagation of
    /// `instr`.
    pub fn on_pc_read(&self, ctx: &mut ThreadContext, instr: &Instr) -> Result<(), Error> {
        if instr.reads_pc() && ctx.is_tracked(Reg::PC) {
            self.taint
                .set_reg_taint(ctx, Reg::PC, TaintClass::Text.into())?;
        }
        Ok(())
    }

    /// Inline version of [`AslrGuard::on_pc_read`]. Inserts nothing for
    /// instructions which do not read `pc`.
    pub fn instrument_pc_read<E: Emitter + ?Sized>(
        &self,
        instr: &Instr,
        emitter: &mut E,
    ) -> Result<(), Error> {
        if !instr.reads_pc() || !self.taint.options().track_pc {
            return Ok(());
        }
        let emitter_error = |e: E::Error| Error::Emitter(format!("{e:?}"));
        let tag = emitter.reserve_scratch().map_err(emitter_error)?;
        let addr = match emitter.reserve_scratch() {
            Ok(addr) => addr,
            Err(e) => {
                emitter.release_scratch(tag).map_err(emitter_error)?;
                return Err(emitter_error(e));
            }
        };
        let inserted = Self::insert_pc_taint(emitter, tag, addr);
        let released = emitter
            .release_scratch(addr)
            .and_then(|()| emitter.release_scratch(tag));
        inserted.and(released).map_err(emitter_error)
    }

    fn insert_pc_taint<E: Emitter + ?Sized>(
        emitter: &mut E,
        tag: Scratch,
        addr: Scratch,
    ) -> Result<(), E::Error> {
        emitter.insert(MetaInstr::MoveImm {
            dst: tag,
            imm: TaintClass::Text.into(),
        })?;
        emitter.insert(MetaInstr::RegToShadow {
            dst: addr,
            reg: Reg::PC,
        })?;
        emitter.insert(MetaInstr::StoreByte { addr, src: tag })
    }

    /// Taint the address returned by a successful `brk` or `mmap2`
    pub fn on_post_syscall(
        &self,
        ctx: &mut ThreadContext,
        sysnum: u32,
        succeeded: bool,
    ) -> Result<(), Error> {
        let Ok(syscall) = SyscallNumber::try_from(sysnum) else {
            return Ok(());
        };
        if succeeded && syscall.returns_address() {
            self.taint
                .set_reg_taint(ctx, Reg::R0, TaintClass::Heap.into())?;
        }
        Ok(())
    }

    /// Check the buffer of an output system call for tainted bytes
    pub fn on_pre_syscall(
        &self,
        sysnum: u32,
        buffer: GuestAddr,
        len: usize,
    ) -> Result<SyscallVerdict, Error> {
        let Ok(syscall) = SyscallNumber::try_from(sysnum) else {
            return Ok(SyscallVerdict::Allow);
        };
        if !syscall.is_sink() || len == 0 {
            return Ok(SyscallVerdict::Allow);
        }
        let first = buffer & !(WORD - 1);
        let end = buffer.saturating_add(len);
        for word in (first..end).step_by(WORD) {
            let tag = self.taint.get_mem_taint(word)?;
            if tag == 0 {
                continue;
            }
            let leak = Leak {
                syscall,
                addr: word.max(buffer),
                tag,
            };
            warn!("[ASLR] Address leak: {leak}");
            return Ok(if self.options.fail_address_leaks {
                SyscallVerdict::Fail(leak)
            } else {
                SyscallVerdict::Leak(leak)
            });
        }
        Ok(SyscallVerdict::Allow)
    }

    /// Dump the shadow if configured and release the runtime
    pub fn finish(self) -> Result<(), Error> {
        if let Some(path) = &self.options.dump_taint_on_exit {
            let regions = self.taint.dump_to_file(path)?;
            info!("[ASLR] Dumped {regions} tainted regions");
        }
        self.taint.exit();
        Ok(())
    }
}
