//! # lower
//! Lowering of a [`Plan`] to meta instructions inserted before the
//! application instruction. The host supplies an [`Emitter`], which owns the
//! scratch registers and the translation of each [`MetaInstr`] to native
//! code. Scratch registers are always released, including when emitting
//! fails halfway through a rule.
//!
//! Every access to shadow memory first saves the application address to
//! [`SpillSlot::AppAddress`], so that the fault handler can materialize the
//! right region if the store faults.
use core::fmt::Debug;

use thiserror::Error;

use crate::{
    Tag, UNTAINTED,
    context::SpillSlot,
    instr::MemRef,
    propagate::{ListTransfer, Plan, PropagationError, Rule, WORD_SIZE},
    regs::Reg,
};

/// A scratch register lent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scratch(pub u8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaInstr {
    /// `dst := address(mem)`, using the application's register values
    LoadAddress { dst: Scratch, mem: MemRef },
    /// `slot := src`
    SaveSlot { src: Scratch, slot: SpillSlot },
    /// `reg := translate(reg)`
    AppToShadow { reg: Scratch },
    /// `dst := address of the tag of reg`
    RegToShadow { dst: Scratch, reg: Reg },
    /// `dst := *addr`
    LoadByte { dst: Scratch, addr: Scratch },
    /// `*addr := src`, faults if `addr` is on a shared shadow page
    StoreByte { addr: Scratch, src: Scratch },
    /// `dst := imm`
    MoveImm { dst: Scratch, imm: Tag },
    /// `dst := dst | src`
    Or { dst: Scratch, src: Scratch },
    /// Call the out of line emulation of a block transfer
    CleanCall(ListTransfer),
}

/// The code insertion capability of the host
pub trait Emitter {
    type Error: Debug;

    fn reserve_scratch(&mut self) -> Result<Scratch, Self::Error>;

    fn release_scratch(&mut self, scratch: Scratch) -> Result<(), Self::Error>;

    /// Insert `meta` before the instruction being instrumented
    fn insert(&mut self, meta: MetaInstr) -> Result<(), Self::Error>;
}

#[derive(Error, Debug, PartialEq)]
pub enum LowerError<E: Debug> {
    #[error("Emitter error: {0:?}")]
    Emitter(E),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
}

type LowerResult<T, E> = Result<T, LowerError<E>>;

/// Run `body` with `N` scratch registers, releasing them afterwards
fn with_scratch<E, F, const N: usize>(emitter: &mut E, body: F) -> LowerResult<(), E::Error>
where
    E: Emitter + ?Sized,
    F: FnOnce(&mut E, [Scratch; N]) -> LowerResult<(), E::Error>,
{
    let mut held = Vec::with_capacity(N);
    let mut reserved = Ok(());
    for _ in 0..N {
        match emitter.reserve_scratch() {
            Ok(scratch) => held.push(scratch),
            Err(e) => {
                reserved = Err(LowerError::Emitter(e));
                break;
            }
        }
    }
    let result = reserved.and_then(|()| {
        let regs: [Scratch; N] = core::array::from_fn(|i| held[i]);
        body(emitter, regs)
    });
    let mut released = Ok(());
    for scratch in held.into_iter().rev() {
        if let Err(e) = emitter.release_scratch(scratch) {
            if released.is_ok() {
                released = Err(LowerError::Emitter(e));
            }
        }
    }
    result.and(released)
}

fn emit<E: Emitter + ?Sized>(emitter: &mut E, meta: MetaInstr) -> LowerResult<(), E::Error> {
    emitter.insert(meta).map_err(LowerError::Emitter)
}

/// Emit the meta code for every rule of `plan`
pub fn lower<E: Emitter + ?Sized>(plan: &Plan, emitter: &mut E) -> LowerResult<(), E::Error> {
    for rule in &plan.rules {
        lower_rule(rule, emitter)?;
    }
    Ok(())
}

fn word(mem: &MemRef, i: usize) -> MemRef {
    mem.with_disp(mem.disp.wrapping_add((i * WORD_SIZE) as i32))
}

fn lower_rule<E: Emitter + ?Sized>(rule: &Rule, emitter: &mut E) -> LowerResult<(), E::Error> {
    match rule {
        Rule::Load { dsts, mem } => {
            for (i, dst) in dsts.iter().enumerate() {
                with_scratch::<_, _, 2>(emitter, |em, [app, tag]| {
                    emit(em, MetaInstr::LoadAddress {
                        dst: app,
                        mem: word(mem, i),
                    })?;
                    emit(em, MetaInstr::SaveSlot {
                        src: app,
                        slot: SpillSlot::AppAddress,
                    })?;
                    emit(em, MetaInstr::AppToShadow { reg: app })?;
                    emit(em, MetaInstr::LoadByte { dst: app, addr: app })?;
                    emit(em, MetaInstr::RegToShadow { dst: tag, reg: *dst })?;
                    emit(em, MetaInstr::StoreByte { addr: tag, src: app })
                })?;
            }
        }
        Rule::Store { srcs, mem } => {
            for (i, src) in srcs.iter().enumerate() {
                with_scratch::<_, _, 2>(emitter, |em, [app, tag]| {
                    match src {
                        Some(src) => {
                            emit(em, MetaInstr::RegToShadow { dst: tag, reg: *src })?;
                            emit(em, MetaInstr::LoadByte { dst: tag, addr: tag })?;
                        }
                        None => emit(em, MetaInstr::MoveImm {
                            dst: tag,
                            imm: UNTAINTED,
                        })?,
                    }
                    emit(em, MetaInstr::LoadAddress {
                        dst: app,
                        mem: word(mem, i),
                    })?;
                    emit(em, MetaInstr::SaveSlot {
                        src: app,
                        slot: SpillSlot::AppAddress,
                    })?;
                    emit(em, MetaInstr::AppToShadow { reg: app })?;
                    emit(em, MetaInstr::StoreByte { addr: app, src: tag })
                })?;
            }
        }
        Rule::Copy { dst, src } => with_scratch::<_, _, 2>(emitter, |em, [tag, addr]| {
            emit(em, MetaInstr::RegToShadow { dst: tag, reg: *src })?;
            emit(em, MetaInstr::LoadByte { dst: tag, addr: tag })?;
            emit(em, MetaInstr::RegToShadow { dst: addr, reg: *dst })?;
            emit(em, MetaInstr::StoreByte { addr, src: tag })
        })?,
        Rule::Clear { dst } => with_scratch::<_, _, 2>(emitter, |em, [tag, addr]| {
            emit(em, MetaInstr::MoveImm {
                dst: tag,
                imm: UNTAINTED,
            })?;
            emit(em, MetaInstr::RegToShadow { dst: addr, reg: *dst })?;
            emit(em, MetaInstr::StoreByte { addr, src: tag })
        })?,
        Rule::Union { dst, srcs } => with_scratch::<_, _, 2>(emitter, |em, [acc, tmp]| {
            emit(em, MetaInstr::MoveImm {
                dst: acc,
                imm: UNTAINTED,
            })?;
            for src in srcs {
                emit(em, MetaInstr::RegToShadow { dst: tmp, reg: *src })?;
                emit(em, MetaInstr::LoadByte { dst: tmp, addr: tmp })?;
                emit(em, MetaInstr::Or { dst: acc, src: tmp })?;
            }
            emit(em, MetaInstr::RegToShadow { dst: tmp, reg: *dst })?;
            emit(em, MetaInstr::StoreByte { addr: tmp, src: acc })
        })?,
        Rule::List(list) => emit(emitter, MetaInstr::CleanCall(list.clone()))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instr::{Instr, Opcode},
        options::GapPolicy,
        propagate::Propagator,
    };

    #[derive(Debug, Default)]
    struct Recorder {
        free: Vec<Scratch>,
        held: usize,
        code: Vec<MetaInstr>,
        fail_after: Option<usize>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                free: (0..4).map(Scratch).collect(),
                ..Self::default()
            }
        }
    }

    impl Emitter for Recorder {
        type Error = &'static str;

        fn reserve_scratch(&mut self) -> Result<Scratch, Self::Error> {
            let scratch = self.free.pop().ok_or("out of scratch registers")?;
            self.held += 1;
            Ok(scratch)
        }

        fn release_scratch(&mut self, scratch: Scratch) -> Result<(), Self::Error> {
            self.held -= 1;
            self.free.push(scratch);
            Ok(())
        }

        fn insert(&mut self, meta: MetaInstr) -> Result<(), Self::Error> {
            if self.fail_after == Some(self.code.len()) {
                return Err("insert failed");
            }
            self.code.push(meta);
            Ok(())
        }
    }

    fn lower_instr(instr: Instr, emitter: &mut Recorder) -> LowerResult<(), &'static str> {
        let plan = Propagator::new(GapPolicy::Permissive, false).analyze(&instr)?;
        lower(&plan, emitter)
    }

    #[test]
    fn test_store_saves_app_address_before_translating() {
        let mut em = Recorder::new();
        let mem = MemRef::base_disp(Reg::SP, -4);
        lower_instr(Instr::new(Opcode::Str).dst(mem).src(Reg::R0), &mut em).unwrap();
        let save = em
            .code
            .iter()
            .position(|m| matches!(m, MetaInstr::SaveSlot { .. }))
            .unwrap();
        let translate = em
            .code
            .iter()
            .position(|m| matches!(m, MetaInstr::AppToShadow { .. }))
            .unwrap();
        assert!(save < translate);
        assert!(matches!(em.code.last(), Some(MetaInstr::StoreByte { .. })));
        assert_eq!(em.held, 0);
    }

    #[test]
    fn test_dual_load_offsets() {
        let mut em = Recorder::new();
        let mem = MemRef::base_disp(Reg::R1, 8);
        lower_instr(
            Instr::new(Opcode::Ldrd).dst(Reg::R2).dst(Reg::R3).src(mem),
            &mut em,
        )
        .unwrap();
        let disps = em
            .code
            .iter()
            .filter_map(|m| match m {
                MetaInstr::LoadAddress { mem, .. } => Some(mem.disp),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(disps, vec![8, 12]);
    }

    #[test]
    fn test_block_transfer_is_clean_call() {
        let mut em = Recorder::new();
        let instr = Instr::new(Opcode::Ldm)
            .src(MemRef::base(Reg::SP))
            .dst(Reg::R4)
            .dst(Reg::R5);
        lower_instr(instr, &mut em).unwrap();
        assert!(matches!(em.code.as_slice(), [MetaInstr::CleanCall(_)]));
    }

    #[test]
    fn test_scratch_released_on_error() {
        let mut em = Recorder::new();
        em.fail_after = Some(2);
        let result = lower_instr(
            Instr::new(Opcode::Add).dst(Reg::R0).src(Reg::R1).src(Reg::R2),
            &mut em,
        );
        assert_eq!(result, Err(LowerError::Emitter("insert failed")));
        assert_eq!(em.held, 0);
        assert_eq!(em.free.len(), 4);
    }

    #[test]
    fn test_scratch_released_when_exhausted() {
        let mut em = Recorder::new();
        em.free.truncate(1);
        let result = lower_instr(Instr::new(Opcode::Mov).dst(Reg::R0).src(Reg::R1), &mut em);
        assert_eq!(result, Err(LowerError::Emitter("out of scratch registers")));
        assert_eq!(em.free.len(), 1);
    }
}
