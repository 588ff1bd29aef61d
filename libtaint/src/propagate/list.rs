//! # list
//! Block transfers move a list of registers to or from consecutive words.
//! The list is decoded once, at analysis time, and the transfer is emulated
//! out of line against the live value of the base register.
//!
//! - Load multiple: register `i` of the list takes the tag of the word at
//!   `base + 4 * (i + 1)`.
//! - Store multiple (decrement before): register `i` of a list of `N`
//!   registers is stored to `base - 4 * (N - i)`.
//!
//! A list register which is also the writeback destination is excluded.
use log::trace;

use crate::{
    UNTAINTED,
    context::ThreadContext,
    instr::{Instr, MachineState, Opcode, Operand},
    propagate::{ApplyError, WORD_SIZE},
    regs::Reg,
    shadow::Shadow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// `ldm`
    LoadIncrement,
    /// `stmdb`
    StoreDecrement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTransfer {
    pub kind: ListKind,
    pub base: Reg,
    pub regs: Vec<Reg>,
    pub writeback: Option<Reg>,
}

impl ListTransfer {
    /// Decode a block transfer, `None` if the operands do not have the
    /// expected shape
    #[must_use]
    pub fn from_instr(instr: &Instr) -> Option<Self> {
        let (kind, mem_ops, list_ops) = match instr.opcode {
            Opcode::Ldm => (ListKind::LoadIncrement, &instr.srcs, &instr.dsts),
            Opcode::Stmdb => (ListKind::StoreDecrement, &instr.dsts, &instr.srcs),
            _ => return None,
        };
        let base = mem_ops.first()?.as_mem()?.base;
        let writeback = mem_ops.get(1).and_then(Operand::as_reg);
        let mut regs = list_ops
            .iter()
            .map(Operand::as_reg)
            .collect::<Option<Vec<_>>>()?;
        // The written back base is appended after the list
        if writeback.is_some() && regs.last().copied() == writeback {
            regs.pop();
        }
        Some(Self {
            kind,
            base,
            regs,
            writeback,
        })
    }

    /// The registers whose tags are transferred, with their list position
    pub fn transferred(&self) -> impl Iterator<Item = (usize, Reg)> + '_ {
        self.regs
            .iter()
            .copied()
            .enumerate()
            .filter(move |(_, reg)| Some(*reg) != self.writeback)
    }

    pub fn emulate<S, M>(
        &self,
        shadow: &S,
        ctx: &mut ThreadContext,
        machine: &M,
    ) -> Result<(), ApplyError<S::Error>>
    where
        S: Shadow + ?Sized,
        M: MachineState + ?Sized,
    {
        let base = machine.reg_value(self.base);
        trace!(
            "emulate {:?} - base: {} = {base:#x}, regs: {:?}",
            self.kind, self.base, self.regs
        );
        match self.kind {
            ListKind::LoadIncrement => {
                for (i, reg) in self.transferred() {
                    if !ctx.is_tracked(reg) {
                        continue;
                    }
                    let addr = base.wrapping_add(WORD_SIZE * (i + 1));
                    let tag = shadow.get(addr).map_err(ApplyError::Shadow)?;
                    ctx.set_reg(reg, tag)?;
                }
            }
            ListKind::StoreDecrement => {
                let n = self.regs.len();
                for (i, reg) in self.transferred() {
                    let tag = if ctx.is_tracked(reg) {
                        ctx.get_reg(reg)?
                    } else {
                        UNTAINTED
                    };
                    let addr = base.wrapping_sub(WORD_SIZE * (n - i));
                    shadow.set(addr, tag).map_err(ApplyError::Shadow)?;
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
        instr::{MemRef, Registers},
        mmap::linux::LinuxMmap,
        shadow::{DefaultShadowLayout, lazy::LazyShadow},
    };

    type LS = LazyShadow<LinuxMmap, DefaultShadowLayout>;

    fn pop(base: Reg, list: &[Reg], writeback: bool) -> Instr {
        let mut instr = Instr::new(Opcode::Ldm).src(MemRef::base(base));
        for reg in list {
            instr = instr.dst(*reg);
        }
        if writeback {
            instr = instr.src(base).dst(base);
        }
        instr
    }

    #[test]
    fn test_decode_strips_writeback() {
        let list = ListTransfer::from_instr(&pop(Reg::SP, &[Reg::R4, Reg::PC], true)).unwrap();
        assert_eq!(list.kind, ListKind::LoadIncrement);
        assert_eq!(list.regs, vec![Reg::R4, Reg::PC]);
        assert_eq!(list.writeback, Some(Reg::SP));
    }

    #[test]
    fn test_load_multiple_offsets() {
        let shadow = LS::new().unwrap();
        let mut regs = Registers::new();
        regs.set(Reg::R0, 0x2000);
        shadow.set(0x2004, 0x41).unwrap();
        shadow.set(0x2008, 0x42).unwrap();
        shadow.set(0x200c, 0x43).unwrap();
        let mut ctx = ThreadContext::new(false);
        let list =
            ListTransfer::from_instr(&pop(Reg::R0, &[Reg::R1, Reg::R2, Reg::R3], false)).unwrap();
        list.emulate(&shadow, &mut ctx, &regs).unwrap();
        assert_eq!(ctx.get_reg(Reg::R1), Ok(0x41));
        assert_eq!(ctx.get_reg(Reg::R2), Ok(0x42));
        assert_eq!(ctx.get_reg(Reg::R3), Ok(0x43));
    }

    #[test]
    fn test_load_multiple_excludes_writeback() {
        let shadow = LS::new().unwrap();
        let mut regs = Registers::new();
        regs.set(Reg::R0, 0x3000);
        shadow.set(0x3004, 0x41).unwrap();
        shadow.set(0x3008, 0x42).unwrap();
        let mut ctx = ThreadContext::new(false);
        ctx.set_reg(Reg::R0, 0x43).unwrap();
        let list =
            ListTransfer::from_instr(&pop(Reg::R0, &[Reg::R0, Reg::R1], true)).unwrap();
        list.emulate(&shadow, &mut ctx, &regs).unwrap();
        assert_eq!(ctx.get_reg(Reg::R0), Ok(0x43));
        assert_eq!(ctx.get_reg(Reg::R1), Ok(0x42));
    }

    #[test]
    fn test_store_multiple_offsets() {
        let shadow = LS::new().unwrap();
        let mut regs = Registers::new();
        regs.set(Reg::SP, 0x8000);
        let mut ctx = ThreadContext::new(false);
        ctx.set_reg(Reg::R4, 0x41).unwrap();
        ctx.set_reg(Reg::LR, 0x42).unwrap();
        let push = Instr::new(Opcode::Stmdb)
            .dst(MemRef::base(Reg::SP))
            .dst(Reg::SP)
            .src(Reg::R4)
            .src(Reg::LR)
            .src(Reg::SP);
        let list = ListTransfer::from_instr(&push).unwrap();
        assert_eq!(list.regs, vec![Reg::R4, Reg::LR]);
        list.emulate(&shadow, &mut ctx, &regs).unwrap();
        assert_eq!(shadow.get(0x7ff8), Ok(0x41));
        assert_eq!(shadow.get(0x7ffc), Ok(0x42));
        assert_eq!(shadow.get(0x8000), Ok(0));
    }
}
