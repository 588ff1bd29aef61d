//! # regs
//! The shadow register bank holds one tag per general purpose register. The
//! bank is a plain `#[repr(C)]` array so that inline code can address a
//! register's tag as the context base plus a fixed offset.
use core::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::Tag;

/// Number of general purpose registers with a shadow slot, `pc` included
pub const NUM_GPRS: usize = 16;

/// A register id as seen by the rule engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u8);

impl Reg {
    pub const R0: Reg = Reg(0);
    pub const R1: Reg = Reg(1);
    pub const R2: Reg = Reg(2);
    pub const R3: Reg = Reg(3);
    pub const R4: Reg = Reg(4);
    pub const R5: Reg = Reg(5);
    pub const R6: Reg = Reg(6);
    pub const R7: Reg = Reg(7);
    pub const R8: Reg = Reg(8);
    pub const R9: Reg = Reg(9);
    pub const R10: Reg = Reg(10);
    pub const R11: Reg = Reg(11);
    pub const R12: Reg = Reg(12);
    pub const SP: Reg = Reg(13);
    pub const LR: Reg = Reg(14);
    pub const PC: Reg = Reg(15);

    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn id(self) -> u8 {
        self.0
    }

    /// Whether the register has a slot in the bank
    #[must_use]
    pub const fn is_gpr(self) -> bool {
        (self.0 as usize) < NUM_GPRS
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Reg::SP => write!(f, "sp"),
            Reg::LR => write!(f, "lr"),
            Reg::PC => write!(f, "pc"),
            r if r.is_gpr() => write!(f, "r{}", r.0),
            r => write!(f, "reg{}", r.0),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum RegisterError {
    #[error("Register {0} has no shadow slot")]
    OutOfRange(Reg),
    #[error("Register {0} is not tracked")]
    Excluded(Reg),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct ShadowRegisters {
    tags: [Tag; NUM_GPRS],
    track_pc: bool,
}

impl ShadowRegisters {
    #[must_use]
    pub const fn new(track_pc: bool) -> Self {
        Self {
            tags: [0; NUM_GPRS],
            track_pc,
        }
    }

    /// Whether the rule engine maintains a tag for `reg`
    #[inline]
    #[must_use]
    pub const fn is_tracked(&self, reg: Reg) -> bool {
        reg.is_gpr() && (self.track_pc || reg.0 != Reg::PC.0)
    }

    fn check(&self, reg: Reg) -> Result<usize, RegisterError> {
        if !reg.is_gpr() {
            Err(RegisterError::OutOfRange(reg))
        } else if !self.is_tracked(reg) {
            Err(RegisterError::Excluded(reg))
        } else {
            Ok(reg.0 as usize)
        }
    }

    pub fn get(&self, reg: Reg) -> Result<Tag, RegisterError> {
        Ok(self.tags[self.check(reg)?])
    }

    pub fn set(&mut self, reg: Reg, tag: Tag) -> Result<(), RegisterError> {
        let idx = self.check(reg)?;
        self.tags[idx] = tag;
        Ok(())
    }

    /// Byte offset of the tag of `reg` from the start of the bank
    pub const fn offset(reg: Reg) -> Result<usize, RegisterError> {
        if reg.is_gpr() {
            Ok(reg.0 as usize)
        } else {
            Err(RegisterError::OutOfRange(reg))
        }
    }

    pub fn clear(&mut self) {
        self.tags = [0; NUM_GPRS];
    }

    #[must_use]
    pub fn tags(&self) -> &[Tag; NUM_GPRS] {
        &self.tags
    }
}
