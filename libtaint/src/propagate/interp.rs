//! # interp
//! A reference executor for meta code. It runs the same [`MetaInstr`]
//! sequences a host would translate to native code, against the real shadow
//! memory and register bank, with an in-memory scratch register file.
//!
//! A byte store into a shadow page which is still shared is not attempted.
//! The interpreter takes the same recovery path a native store would take
//! through the signal handler, [`handle_shadow_fault`], and then retries.
use core::{
    fmt::Debug,
    ptr::{self, read_volatile, write_volatile},
};

use log::trace;
use thiserror::Error;

use crate::{
    GuestAddr, Tag,
    context::{SpillSlot, ThreadContext},
    fault::{FaultAction, FaultError, FaultingState, PatchError, handle_shadow_fault},
    instr::MachineState,
    propagate::{ApplyError, MetaInstr, Scratch},
    regs::{Reg, RegisterError},
    shadow::{PageKind, Shadow},
};

/// Number of scratch registers available to meta code
pub const NUM_SCRATCH: usize = 8;

#[derive(Error, Debug, PartialEq)]
pub enum InterpError<E: Debug> {
    #[error("Scratch register {0:?} does not exist")]
    NoSuchScratch(Scratch),
    #[error("Access to {0:#x} is neither shadow memory nor the register bank")]
    WildAccess(GuestAddr),
    #[error("Shadow error: {0:?}")]
    Shadow(E),
    #[error("Fault recovery failed: {0}")]
    Fault(FaultError<E>),
    #[error("Store to {0:#x} still faults after recovery")]
    Unrecoverable(GuestAddr),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("Out of line emulation failed: {0}")]
    Apply(ApplyError<E>),
}

/// Patches the scratch register which held the faulting address
struct ScratchFault<'a> {
    slot: &'a mut GuestAddr,
}

impl FaultingState for ScratchFault<'_> {
    fn patch(&mut self, _access: GuestAddr, shadow: GuestAddr) -> Result<(), PatchError> {
        *self.slot = shadow;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Interpreter<'a, S: Shadow + ?Sized, M: MachineState + ?Sized> {
    shadow: &'a S,
    machine: &'a M,
    scratch: [GuestAddr; NUM_SCRATCH],
}

impl<'a, S, M> Interpreter<'a, S, M>
where
    S: Shadow + ?Sized,
    M: MachineState + ?Sized,
{
    pub fn new(shadow: &'a S, machine: &'a M) -> Self {
        Self {
            shadow,
            machine,
            scratch: [0; NUM_SCRATCH],
        }
    }

    fn get(&self, reg: Scratch) -> Result<GuestAddr, InterpError<S::Error>> {
        self.scratch
            .get(reg.0 as usize)
            .copied()
            .ok_or(InterpError::NoSuchScratch(reg))
    }

    fn slot(&mut self, reg: Scratch) -> Result<&mut GuestAddr, InterpError<S::Error>> {
        self.scratch
            .get_mut(reg.0 as usize)
            .ok_or(InterpError::NoSuchScratch(reg))
    }

    fn bank_reg(ctx: &ThreadContext, addr: GuestAddr) -> Option<Reg> {
        let bank = ctx.reg_bank_range();
        bank.contains(&addr)
            .then(|| Reg::new((addr - bank.start) as u8))
    }

    fn load_byte(&self, ctx: &ThreadContext, addr: GuestAddr) -> Result<Tag, InterpError<S::Error>> {
        if self.shadow.page_kind(addr).is_some() {
            return Ok(unsafe { read_volatile(addr as *const Tag) });
        }
        match Self::bank_reg(ctx, addr) {
            Some(reg) => Ok(ctx.get_reg(reg)?),
            None => Err(InterpError::WildAccess(addr)),
        }
    }

    fn store_byte(
        &mut self,
        ctx: &mut ThreadContext,
        addr_reg: Scratch,
        tag: Tag,
    ) -> Result<(), InterpError<S::Error>> {
        let mut recovered = false;
        loop {
            let addr = self.get(addr_reg)?;
            match self.shadow.page_kind(addr) {
                Some(PageKind::Private) => {
                    unsafe { write_volatile(addr as *mut Tag, tag) };
                    return Ok(());
                }
                Some(PageKind::Shared) if recovered => {
                    return Err(InterpError::Unrecoverable(addr));
                }
                Some(PageKind::Shared) => {
                    let shadow = self.shadow;
                    let saved = ctx.slot(SpillSlot::AppAddress);
                    let mut state = ScratchFault {
                        slot: self.slot(addr_reg)?,
                    };
                    match handle_shadow_fault(shadow, addr, saved, &mut state) {
                        Ok(FaultAction::Resume) => recovered = true,
                        Ok(FaultAction::Deliver) => return Err(InterpError::WildAccess(addr)),
                        Err(e) => return Err(InterpError::Fault(e)),
                    }
                }
                None => {
                    let reg = Self::bank_reg(ctx, addr).ok_or(InterpError::WildAccess(addr))?;
                    ctx.set_reg(reg, tag)?;
                    return Ok(());
                }
            }
        }
    }

    /// Execute `code` on behalf of the thread owning `ctx`
    pub fn run(
        &mut self,
        ctx: &mut ThreadContext,
        code: &[MetaInstr],
    ) -> Result<(), InterpError<S::Error>> {
        for meta in code {
            trace!("interp - {meta:?}");
            match meta {
                MetaInstr::LoadAddress { dst, mem } => {
                    let addr = mem.address(self.machine);
                    *self.slot(*dst)? = addr;
                }
                MetaInstr::SaveSlot { src, slot } => {
                    ctx.set_slot(*slot, self.get(*src)?);
                }
                MetaInstr::AppToShadow { reg } => {
                    let app = self.get(*reg)?;
                    let shadow = self.shadow.translate(app).map_err(InterpError::Shadow)?;
                    *self.slot(*reg)? = shadow;
                }
                MetaInstr::RegToShadow { dst, reg } => {
                    let addr = ptr::from_ref(&*ctx) as GuestAddr + ThreadContext::reg_offset(*reg)?;
                    *self.slot(*dst)? = addr;
                }
                MetaInstr::LoadByte { dst, addr } => {
                    let tag = self.load_byte(ctx, self.get(*addr)?)?;
                    *self.slot(*dst)? = GuestAddr::from(tag);
                }
                MetaInstr::StoreByte { addr, src } => {
                    let tag = self.get(*src)? as Tag;
                    self.store_byte(ctx, *addr, tag)?;
                }
                MetaInstr::MoveImm { dst, imm } => {
                    *self.slot(*dst)? = GuestAddr::from(*imm);
                }
                MetaInstr::Or { dst, src } => {
                    let value = self.get(*dst)? | self.get(*src)?;
                    *self.slot(*dst)? = value;
                }
                MetaInstr::CleanCall(list) => {
                    list.emulate(self.shadow, ctx, self.machine)
                        .map_err(InterpError::Apply)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instr::{Instr, MemRef, Opcode, Registers},
        mmap::linux::LinuxMmap,
        options::GapPolicy,
        propagate::{Emitter, Propagator},
        shadow::{DefaultShadowLayout, lazy::LazyShadow},
    };

    type LS = LazyShadow<LinuxMmap, DefaultShadowLayout>;

    #[derive(Debug, Default)]
    struct Buffer {
        next: u8,
        code: Vec<MetaInstr>,
    }

    impl Emitter for Buffer {
        type Error = ();

        fn reserve_scratch(&mut self) -> Result<Scratch, ()> {
            self.next += 1;
            Ok(Scratch(self.next - 1))
        }

        fn release_scratch(&mut self, _scratch: Scratch) -> Result<(), ()> {
            self.next -= 1;
            Ok(())
        }

        fn insert(&mut self, meta: MetaInstr) -> Result<(), ()> {
            self.code.push(meta);
            Ok(())
        }
    }

    fn run(shadow: &LS, ctx: &mut ThreadContext, regs: &Registers, instr: Instr) {
        let mut buffer = Buffer::default();
        Propagator::new(GapPolicy::Strict, false)
            .instrument(&instr, &mut buffer)
            .unwrap();
        Interpreter::new(shadow, regs).run(ctx, &buffer.code).unwrap();
    }

    #[test]
    fn test_store_to_untouched_region_recovers() {
        let shadow = LS::new().unwrap();
        let mut ctx = ThreadContext::new(false);
        let mut regs = Registers::new();
        regs.set(Reg::R1, 0x0040_0000);
        ctx.set_reg(Reg::R0, 0x43).unwrap();
        let instr = Instr::new(Opcode::Str)
            .dst(MemRef::base_disp(Reg::R1, 8))
            .src(Reg::R0);
        run(&shadow, &mut ctx, &regs, instr);
        assert_eq!(shadow.get(0x0040_0008), Ok(0x43));
        assert_eq!(shadow.materialized_regions(), 1);
        assert_eq!(ctx.slot(SpillSlot::AppAddress), 0x0040_0008);
    }

    #[test]
    fn test_load_from_untouched_region() {
        let shadow = LS::new().unwrap();
        let mut ctx = ThreadContext::new(false);
        ctx.set_reg(Reg::R0, 0x41).unwrap();
        let mut regs = Registers::new();
        regs.set(Reg::R1, 0x0050_0000);
        let instr = Instr::new(Opcode::Ldr).dst(Reg::R0).src(MemRef::base(Reg::R1));
        run(&shadow, &mut ctx, &regs, instr);
        assert_eq!(ctx.get_reg(Reg::R0), Ok(0));
        assert_eq!(shadow.materialized_regions(), 0);
    }

    #[test]
    fn test_union_inline() {
        let shadow = LS::new().unwrap();
        let mut ctx = ThreadContext::new(false);
        ctx.set_reg(Reg::R1, 0x41).unwrap();
        ctx.set_reg(Reg::R2, 0x42).unwrap();
        let instr = Instr::new(Opcode::Add).dst(Reg::R3).src(Reg::R1).src(Reg::R2);
        run(&shadow, &mut ctx, &Registers::new(), instr);
        assert_eq!(ctx.get_reg(Reg::R3), Ok(0x43));
    }

    #[test]
    fn test_wild_access() {
        let shadow = LS::new().unwrap();
        let mut ctx = ThreadContext::new(false);
        let code = [
            MetaInstr::MoveImm {
                dst: Scratch(0),
                imm: 0x10,
            },
            MetaInstr::LoadByte {
                dst: Scratch(1),
                addr: Scratch(0),
            },
        ];
        let regs = Registers::new();
        assert_eq!(
            Interpreter::new(&shadow, &regs).run(&mut ctx, &code),
            Err(InterpError::WildAccess(0x10))
        );
    }
}
