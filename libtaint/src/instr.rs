//! # instr
//! The canonical instruction model consumed by the rule engine. A host
//! decodes its native instructions into an [`Instr`]: an [`Opcode`] and the
//! destination and source operands, each a register, an immediate or a
//! memory reference. The model follows the ARM integer instruction set.
//!
//! Block transfers carry the memory operand first:
//!
//! - `ldm base!, {list}`: `srcs = [mem(base), base]`, `dsts = [list.., base]`
//! - `stmdb base!, {list}`: `dsts = [mem(base), base]`, `srcs = [list.., base]`
//!
//! where the trailing `base` operands are only present with writeback.
use core::fmt::{self, Display, Formatter};

use strum_macros::EnumIter;

use crate::{GuestAddr, regs::Reg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    // Loads
    Ldr,
    Ldrb,
    Ldrh,
    Ldrd,
    Ldrex,
    Ldrsb,
    Ldrsh,
    // Stores
    Str,
    Strb,
    Strh,
    Strd,
    Strex,
    // Moves
    Mov,
    Movs,
    Mvn,
    Mvns,
    Movw,
    Movt,
    // Single source transforms
    Sbfx,
    Ubfx,
    Uxtb,
    Uxth,
    Sxtb,
    Sxth,
    Rev,
    Rev16,
    Clz,
    // Two source arithmetic and logic
    Adc,
    Adcs,
    Add,
    Adds,
    Addw,
    Rsb,
    Rsbs,
    Rsc,
    Sbc,
    Sbcs,
    Sub,
    Subw,
    Subs,
    And,
    Ands,
    Bic,
    Bics,
    Eor,
    Eors,
    Mul,
    Orr,
    Orrs,
    Orn,
    Ror,
    Lsl,
    Lsls,
    Lsr,
    Lsrs,
    Asr,
    Asrs,
    Uadd8,
    Uqsub8,
    Sel,
    // Multiply accumulate and long multiply
    Mla,
    Mls,
    Umull,
    Smull,
    // Branches
    B,
    BShort,
    Bl,
    Blx,
    BlxInd,
    Bx,
    Bxj,
    // No taint effect
    Cbz,
    Cbnz,
    Cmn,
    Cmp,
    Tst,
    Teq,
    It,
    Label,
    Svc,
    Ldc,
    Mcr,
    Mrc,
    Nop,
    Pld,
    Dmb,
    Bfi,
    Bfc,
    // Block transfers
    Ldm,
    Stmdb,
    Ldmdb,
    Stm,
    // Table branches and the remaining DSP multiplies
    Tbb,
    Tbh,
    Rrx,
    Smlabb,
    Smulbb,
    /// Any vector or floating point operation
    Simd,
}

/// A memory operand, `[base, index, lsl #shift] + disp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    pub base: Reg,
    pub index: Option<Reg>,
    pub shift: u8,
    pub disp: i32,
}

impl MemRef {
    #[must_use]
    pub const fn base(base: Reg) -> Self {
        Self {
            base,
            index: None,
            shift: 0,
            disp: 0,
        }
    }

    #[must_use]
    pub const fn base_disp(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            shift: 0,
            disp,
        }
    }

    #[must_use]
    pub const fn with_disp(self, disp: i32) -> Self {
        Self { disp, ..self }
    }

    /// The effective address given the live register values
    pub fn address<S: MachineState + ?Sized>(&self, state: &S) -> GuestAddr {
        let mut addr = state.reg_value(self.base);
        if let Some(index) = self.index {
            addr = addr.wrapping_add(state.reg_value(index) << self.shift);
        }
        addr.wrapping_add_signed(self.disp as isize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(MemRef),
}

impl Operand {
    #[must_use]
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_mem(&self) -> Option<MemRef> {
        match self {
            Operand::Mem(mem) => Some(*mem),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

impl From<MemRef> for Operand {
    fn from(mem: MemRef) -> Self {
        Operand::Mem(mem)
    }
}

impl From<i64> for Operand {
    fn from(imm: i64) -> Self {
        Operand::Imm(imm)
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Imm(imm) => write!(f, "#{imm:#x}"),
            Operand::Mem(mem) => {
                write!(f, "[{}", mem.base)?;
                if let Some(index) = mem.index {
                    write!(f, ", {index}, lsl #{}", mem.shift)?;
                }
                if mem.disp != 0 {
                    write!(f, ", #{}", mem.disp)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub pc: GuestAddr,
    pub opcode: Opcode,
    pub dsts: Vec<Operand>,
    pub srcs: Vec<Operand>,
}

impl Instr {
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            pc: 0,
            opcode,
            dsts: Vec::new(),
            srcs: Vec::new(),
        }
    }

    #[must_use]
    pub fn at(mut self, pc: GuestAddr) -> Self {
        self.pc = pc;
        self
    }

    #[must_use]
    pub fn dst(mut self, op: impl Into<Operand>) -> Self {
        self.dsts.push(op.into());
        self
    }

    #[must_use]
    pub fn src(mut self, op: impl Into<Operand>) -> Self {
        self.srcs.push(op.into());
        self
    }

    /// Whether any operand reads the program counter
    #[must_use]
    pub fn reads_pc(&self) -> bool {
        self.srcs.iter().any(|op| match op {
            Operand::Reg(reg) => *reg == Reg::PC,
            Operand::Mem(mem) => mem.base == Reg::PC || mem.index == Some(Reg::PC),
            Operand::Imm(_) => false,
        })
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.pc, self.opcode)?;
        for (i, op) in self.dsts.iter().chain(self.srcs.iter()).enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{op}")?;
        }
        Ok(())
    }
}

/// Live register values of the application thread
pub trait MachineState {
    fn reg_value(&self, reg: Reg) -> GuestAddr;
}

/// A plain register file, for hosts which keep the registers in memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    values: [GuestAddr; crate::regs::NUM_GPRS],
}

impl Registers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, reg: Reg, value: GuestAddr) {
        if reg.is_gpr() {
            self.values[reg.id() as usize] = value;
        }
    }
}

impl MachineState for Registers {
    fn reg_value(&self, reg: Reg) -> GuestAddr {
        if reg.is_gpr() {
            self.values[reg.id() as usize]
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_address() {
        let mut regs = Registers::new();
        regs.set(Reg::R1, 0x1000);
        regs.set(Reg::R2, 0x10);
        let mem = MemRef {
            base: Reg::R1,
            index: Some(Reg::R2),
            shift: 2,
            disp: -4,
        };
        assert_eq!(mem.address(&regs), 0x103c);
        assert_eq!(MemRef::base_disp(Reg::R1, 8).address(&regs), 0x1008);
    }

    #[test]
    fn test_display() {
        let instr = Instr::new(Opcode::Ldr)
            .at(0x8000)
            .dst(Reg::R0)
            .src(MemRef::base_disp(Reg::SP, 4));
        assert_eq!(instr.to_string(), "0x8000: ldr r0, [sp, #4]");
        assert_eq!(Opcode::BlxInd.to_string(), "blxind");
    }

    #[test]
    fn test_reads_pc() {
        let literal = Instr::new(Opcode::Ldr)
            .dst(Reg::R0)
            .src(MemRef::base_disp(Reg::PC, 8));
        assert!(literal.reads_pc());
        let mov = Instr::new(Opcode::Mov).dst(Reg::R0).src(Reg::R1);
        assert!(!mov.reads_pc());
    }
}
