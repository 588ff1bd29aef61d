//! # propagate
//! The propagation rule engine. Every instruction is classified once, when
//! its block is analyzed, into a [`Plan`]: the ordered list of [`Rule`]s
//! which move tags from its sources to its destinations. A plan is then
//! either executed directly by [`Propagator::apply`] (for hosts which call
//! back into the engine for every instruction), or lowered to inline meta
//! instructions by [`Propagator::instrument`].
//!
//! Block transfers are not expressible as a fixed sequence of inline code, so
//! they become a single [`Rule::List`] which is emulated out of line.
//!
//! Registers the engine does not track (registers without a shadow slot, and
//! `pc` unless it is tracked) read as untainted and are never written.
use core::fmt::Debug;

use log::trace;
use thiserror::Error;

use crate::{
    GuestAddr, Tag, UNTAINTED,
    context::ThreadContext,
    instr::{Instr, MachineState, MemRef, Opcode, Operand},
    options::GapPolicy,
    regs::{Reg, RegisterError},
    shadow::Shadow,
};

pub mod gaps;
pub mod interp;
pub mod list;
pub mod lower;

pub use gaps::GapReporter;
pub use interp::{InterpError, Interpreter};
pub use list::{ListKind, ListTransfer};
pub use lower::{Emitter, LowerError, MetaInstr, Scratch};

/// Size of a word of application memory
pub const WORD_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// `tag(dsts[i]) := tag(mem + 4 * i)`
    Load { dsts: Vec<Reg>, mem: MemRef },
    /// `tag(mem + 4 * i) := tag(srcs[i])`, a `None` source stores `0`
    Store { srcs: Vec<Option<Reg>>, mem: MemRef },
    /// `tag(dst) := tag(src)`
    Copy { dst: Reg, src: Reg },
    /// `tag(dst) := 0`
    Clear { dst: Reg },
    /// `tag(dst) := tag(srcs[0]) | tag(srcs[1]) | ...`
    Union { dst: Reg, srcs: Vec<Reg> },
    /// Out of line emulation of a block transfer
    List(ListTransfer),
}

/// The rules selected for one instruction, an empty plan has no taint effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub pc: GuestAddr,
    pub opcode: Opcode,
    pub rules: Vec<Rule>,
}

impl Plan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum PropagationError {
    #[error("Unhandled opcode: {0}")]
    Unhandled(Opcode),
    #[error("Unexpected operands for {opcode} at {pc:#x}")]
    Malformed { opcode: Opcode, pc: GuestAddr },
}

#[derive(Error, Debug, PartialEq)]
pub enum ApplyError<E: Debug> {
    #[error("Shadow error: {0:?}")]
    Shadow(E),
    #[error(transparent)]
    Register(#[from] RegisterError),
}

#[derive(Debug)]
pub struct Propagator {
    policy: GapPolicy,
    track_pc: bool,
    gaps: GapReporter,
}

impl Propagator {
    #[must_use]
    pub fn new(policy: GapPolicy, track_pc: bool) -> Self {
        Self {
            policy,
            track_pc,
            gaps: GapReporter::default(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> GapPolicy {
        self.policy
    }

    #[must_use]
    pub fn track_pc(&self) -> bool {
        self.track_pc
    }

    #[must_use]
    pub fn gaps(&self) -> &GapReporter {
        &self.gaps
    }

    #[inline]
    fn is_tracked(&self, reg: Reg) -> bool {
        reg.is_gpr() && (self.track_pc || reg != Reg::PC)
    }

    /// Select the rules for `instr`. Coverage gaps are reported once per
    /// opcode; in strict mode they are returned as errors, otherwise the
    /// instruction gets an empty plan.
    pub fn analyze(&self, instr: &Instr) -> Result<Plan, PropagationError> {
        let rules = match self.classify(instr) {
            Ok(rules) => rules,
            Err(err) => {
                self.gaps.report(instr.pc, &err);
                match self.policy {
                    GapPolicy::Strict => return Err(err),
                    GapPolicy::Permissive => Vec::new(),
                }
            }
        };
        trace!("analyze - {instr} -> {rules:?}");
        Ok(Plan {
            pc: instr.pc,
            opcode: instr.opcode,
            rules,
        })
    }

    fn classify(&self, instr: &Instr) -> Result<Vec<Rule>, PropagationError> {
        use Opcode::*;
        let malformed = || PropagationError::Malformed {
            opcode: instr.opcode,
            pc: instr.pc,
        };
        let rules = match instr.opcode {
            Ldr | Ldrb | Ldrh | Ldrex | Ldrsb | Ldrsh => self.load(instr, 1).ok_or_else(malformed)?,
            Ldrd => self.load(instr, 2).ok_or_else(malformed)?,
            Str | Strb | Strh => self.store(instr, 1).ok_or_else(malformed)?,
            Strd => self.store(instr, 2).ok_or_else(malformed)?,
            Strex => {
                let mut rules = self.store(instr, 1).ok_or_else(malformed)?;
                // The status register receives 0 or 1
                if let Some(status) = instr.dsts.iter().find_map(Operand::as_reg) {
                    rules.extend(self.clear(status));
                }
                rules
            }
            Mov | Movs | Mvn | Mvns | Movw | Movt | Sbfx | Ubfx | Uxtb | Uxth | Sxtb | Sxth
            | Rev | Rev16 | Clz => self.unary(instr).ok_or_else(malformed)?,
            Adc | Adcs | Add | Adds | Addw | Rsb | Rsbs | Rsc | Sbc | Sbcs | Sub | Subw | Subs
            | And | Ands | Bic | Bics | Eor | Eors | Mul | Orr | Orrs | Orn | Ror | Lsl | Lsls
            | Lsr | Lsrs | Asr | Asrs | Uadd8 | Uqsub8 | Sel => {
                self.binary(instr).ok_or_else(malformed)?
            }
            Mla | Mls | Umull | Smull => self.accumulate(instr).ok_or_else(malformed)?,
            Bl | Blx | BlxInd => {
                let mut rules = self.link();
                rules.extend(self.branch_reg(instr));
                rules
            }
            B | BShort | Bx | Bxj => self.branch_reg(instr),
            Cbz | Cbnz | Cmn | Cmp | Tst | Teq | It | Label | Svc | Ldc | Mcr | Mrc | Nop
            | Pld | Dmb | Bfi | Bfc | Simd => Vec::new(),
            Ldm | Stmdb => vec![Rule::List(ListTransfer::from_instr(instr).ok_or_else(malformed)?)],
            Ldmdb | Stm | Tbb | Tbh | Rrx | Smlabb | Smulbb => {
                return Err(PropagationError::Unhandled(instr.opcode));
            }
        };
        Ok(rules)
    }

    fn first_mem(ops: &[Operand]) -> Option<MemRef> {
        ops.iter().find_map(Operand::as_mem)
    }

    fn load(&self, instr: &Instr, words: usize) -> Option<Vec<Rule>> {
        let mem = Self::first_mem(&instr.srcs)?;
        let dsts = instr.dsts.iter().filter_map(Operand::as_reg).take(words).collect::<Vec<_>>();
        if dsts.len() != words {
            return None;
        }
        let dsts = dsts.into_iter().filter(|r| self.is_tracked(*r)).collect::<Vec<_>>();
        if dsts.is_empty() {
            return Some(Vec::new());
        }
        Some(vec![Rule::Load { dsts, mem }])
    }

    fn store(&self, instr: &Instr, words: usize) -> Option<Vec<Rule>> {
        let mem = Self::first_mem(&instr.dsts)?;
        let srcs = instr
            .srcs
            .iter()
            .filter_map(Operand::as_reg)
            .take(words)
            .map(|r| self.is_tracked(r).then_some(r))
            .collect::<Vec<_>>();
        if srcs.len() != words {
            return None;
        }
        Some(vec![Rule::Store { srcs, mem }])
    }

    fn clear(&self, dst: Reg) -> Option<Rule> {
        self.is_tracked(dst).then_some(Rule::Clear { dst })
    }

    fn copy(&self, dst: Reg, src: Reg) -> Option<Rule> {
        if !self.is_tracked(dst) {
            None
        } else if self.is_tracked(src) {
            Some(Rule::Copy { dst, src })
        } else {
            Some(Rule::Clear { dst })
        }
    }

    fn union(&self, dst: Reg, srcs: &[Reg]) -> Option<Rule> {
        let mut tracked = srcs
            .iter()
            .copied()
            .filter(|r| self.is_tracked(*r))
            .collect::<Vec<_>>();
        tracked.dedup();
        match tracked.as_slice() {
            [] => self.clear(dst),
            [src] => self.copy(dst, *src),
            _ if self.is_tracked(dst) => Some(Rule::Union { dst, srcs: tracked }),
            _ => None,
        }
    }

    /// `dst := op src`, register sources copy, immediates clear
    fn unary(&self, instr: &Instr) -> Option<Vec<Rule>> {
        let dst = instr.dsts.first()?.as_reg()?;
        let rule = match instr.srcs.first()? {
            Operand::Reg(src) => self.copy(dst, *src),
            Operand::Imm(_) => self.clear(dst),
            Operand::Mem(_) => return None,
        };
        Some(rule.into_iter().collect())
    }

    /// `dst := src0 op src1`, classified on the first two sources only, any
    /// further sources are shift operands
    fn binary(&self, instr: &Instr) -> Option<Vec<Rule>> {
        let dst = instr.dsts.first()?.as_reg()?;
        let rule = match instr.srcs.as_slice() {
            [] => return None,
            [Operand::Reg(a)] => self.copy(dst, *a),
            [Operand::Imm(_)] => self.clear(dst),
            [Operand::Reg(a), Operand::Reg(b), ..] => self.union(dst, &[*a, *b]),
            [Operand::Reg(a), Operand::Imm(_), ..] | [Operand::Imm(_), Operand::Reg(a), ..] => {
                self.copy(dst, *a)
            }
            [Operand::Imm(_), Operand::Imm(_), ..] => self.clear(dst),
            _ => return None,
        };
        Some(rule.into_iter().collect())
    }

    /// Every destination receives the union of every register source
    fn accumulate(&self, instr: &Instr) -> Option<Vec<Rule>> {
        let srcs = instr.srcs.iter().filter_map(Operand::as_reg).collect::<Vec<_>>();
        let dsts = instr.dsts.iter().filter_map(Operand::as_reg).collect::<Vec<_>>();
        if dsts.is_empty() || srcs.is_empty() {
            return None;
        }
        Some(dsts.into_iter().filter_map(|dst| self.union(dst, &srcs)).collect())
    }

    /// `tag(lr) := tag(pc)`, only when `pc` is tracked
    fn link(&self) -> Vec<Rule> {
        if self.track_pc {
            vec![Rule::Copy {
                dst: Reg::LR,
                src: Reg::PC,
            }]
        } else {
            Vec::new()
        }
    }

    /// `tag(pc) := tag(target)`, only when `pc` is tracked
    fn branch_reg(&self, instr: &Instr) -> Vec<Rule> {
        match instr.srcs.first() {
            Some(Operand::Reg(target)) if self.track_pc => {
                self.copy(Reg::PC, *target).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Analyze `instr` and insert its meta code through `emitter`
    pub fn instrument<E: Emitter + ?Sized>(
        &self,
        instr: &Instr,
        emitter: &mut E,
    ) -> Result<Plan, LowerError<E::Error>> {
        let plan = self.analyze(instr)?;
        lower::lower(&plan, emitter)?;
        Ok(plan)
    }

    /// Execute a plan against the shadow and the register bank of `ctx`.
    /// The memory addresses are computed from the register values in
    /// `machine`, which must reflect the state before the instruction.
    pub fn apply<S, M>(
        &self,
        plan: &Plan,
        shadow: &S,
        ctx: &mut ThreadContext,
        machine: &M,
    ) -> Result<(), ApplyError<S::Error>>
    where
        S: Shadow + ?Sized,
        M: MachineState + ?Sized,
    {
        for rule in &plan.rules {
            apply_rule(rule, shadow, ctx, machine)?;
        }
        Ok(())
    }
}

/// Address of word `i` of a memory operand
#[inline]
pub(crate) fn word_address<M: MachineState + ?Sized>(mem: &MemRef, i: usize, machine: &M) -> GuestAddr {
    mem.address(machine).wrapping_add(i * WORD_SIZE)
}

fn apply_rule<S, M>(
    rule: &Rule,
    shadow: &S,
    ctx: &mut ThreadContext,
    machine: &M,
) -> Result<(), ApplyError<S::Error>>
where
    S: Shadow + ?Sized,
    M: MachineState + ?Sized,
{
    match rule {
        Rule::Load { dsts, mem } => {
            for (i, dst) in dsts.iter().enumerate() {
                let tag = shadow
                    .get(word_address(mem, i, machine))
                    .map_err(ApplyError::Shadow)?;
                ctx.set_reg(*dst, tag)?;
            }
        }
        Rule::Store { srcs, mem } => {
            for (i, src) in srcs.iter().enumerate() {
                let tag = match src {
                    Some(src) => ctx.get_reg(*src)?,
                    None => UNTAINTED,
                };
                shadow
                    .set(word_address(mem, i, machine), tag)
                    .map_err(ApplyError::Shadow)?;
            }
        }
        Rule::Copy { dst, src } => {
            let tag = ctx.get_reg(*src)?;
            ctx.set_reg(*dst, tag)?;
        }
        Rule::Clear { dst } => ctx.set_reg(*dst, UNTAINTED)?,
        Rule::Union { dst, srcs } => {
            let mut tag: Tag = UNTAINTED;
            for src in srcs {
                tag |= ctx.get_reg(*src)?;
            }
            ctx.set_reg(*dst, tag)?;
        }
        Rule::List(list) => list.emulate(shadow, ctx, machine)?,
    }
    Ok(())
}
