//! # context
//! A [`ThreadContext`] is the per thread state of the engine: the shadow
//! register bank and the spill slots written by inline code. The layout is
//! fixed so that inline code can address both with constant offsets from the
//! context base.
//!
//! The context of the running thread is published through a thread local
//! pointer. The fault handler uses it to find the saved application address,
//! and out of line emulation uses it to find the register bank.
use core::{
    cell::Cell,
    mem::{offset_of, size_of},
    ptr,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    GuestAddr, Tag,
    regs::{Reg, RegisterError, ShadowRegisters},
};

/// Number of spill slots per context
pub const NUM_SPILL_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum SpillSlot {
    /// The application address dereferenced by the current shadow access
    AppAddress = 0,
    /// Free for use by the host
    Host0 = 1,
    Host1 = 2,
    Host2 = 3,
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct ThreadContext {
    regs: ShadowRegisters,
    slots: [GuestAddr; NUM_SPILL_SLOTS],
}

thread_local! {
    static CURRENT: Cell<*mut ThreadContext> = const { Cell::new(ptr::null_mut()) };
}

impl ThreadContext {
    #[must_use]
    pub fn new(track_pc: bool) -> Self {
        Self {
            regs: ShadowRegisters::new(track_pc),
            slots: [0; NUM_SPILL_SLOTS],
        }
    }

    pub fn get_reg(&self, reg: Reg) -> Result<Tag, RegisterError> {
        self.regs.get(reg)
    }

    pub fn set_reg(&mut self, reg: Reg, tag: Tag) -> Result<(), RegisterError> {
        self.regs.set(reg, tag)
    }

    #[inline]
    #[must_use]
    pub fn is_tracked(&self, reg: Reg) -> bool {
        self.regs.is_tracked(reg)
    }

    #[must_use]
    pub fn regs(&self) -> &ShadowRegisters {
        &self.regs
    }

    #[must_use]
    pub fn slot(&self, slot: SpillSlot) -> GuestAddr {
        self.slots[usize::from(slot)]
    }

    pub fn set_slot(&mut self, slot: SpillSlot, value: GuestAddr) {
        self.slots[usize::from(slot)] = value;
    }

    /// Offset of the tag of `reg` from the context base
    pub const fn reg_offset(reg: Reg) -> Result<usize, RegisterError> {
        match ShadowRegisters::offset(reg) {
            Ok(offset) => Ok(offset_of!(ThreadContext, regs) + offset),
            Err(e) => Err(e),
        }
    }

    /// Offset of a spill slot from the context base
    #[must_use]
    pub fn slot_offset(slot: SpillSlot) -> usize {
        offset_of!(ThreadContext, slots) + usize::from(slot) * size_of::<GuestAddr>()
    }

    /// Address range of the register bank, used to validate inline accesses
    #[must_use]
    pub fn reg_bank_range(&self) -> core::ops::Range<GuestAddr> {
        let base = ptr::from_ref(self) as GuestAddr + offset_of!(ThreadContext, regs);
        base..base + crate::regs::NUM_GPRS
    }

    /// Publish `ctx` as the context of the calling thread.
    ///
    /// # Safety
    /// `ctx` must remain valid, and must not move, until [`ThreadContext::unregister`]
    /// is called on the same thread.
    pub unsafe fn register(ctx: *mut ThreadContext) {
        CURRENT.with(|c| c.set(ctx));
    }

    pub fn unregister() {
        CURRENT.with(|c| c.set(ptr::null_mut()));
    }

    /// The context of the calling thread, if one is registered
    #[must_use]
    pub fn current() -> Option<*mut ThreadContext> {
        CURRENT
            .try_with(Cell::get)
            .ok()
            .filter(|ctx| !ctx.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_offsets_address_bank() {
        let mut ctx = ThreadContext::new(true);
        ctx.set_reg(Reg::R3, 0x43).unwrap();
        let base = ptr::from_ref(&ctx) as GuestAddr;
        let offset = ThreadContext::reg_offset(Reg::R3).unwrap();
        assert_eq!(unsafe { *((base + offset) as *const Tag) }, 0x43);
        assert!(ctx.reg_bank_range().contains(&(base + offset)));
    }

    #[test]
    fn test_slot_offsets() {
        let mut ctx = ThreadContext::new(false);
        ctx.set_slot(SpillSlot::AppAddress, 0x1000);
        let base = ptr::from_ref(&ctx) as GuestAddr;
        let offset = ThreadContext::slot_offset(SpillSlot::AppAddress);
        assert_eq!(unsafe { *((base + offset) as *const GuestAddr) }, 0x1000);
    }

    #[test]
    fn test_register_current() {
        assert!(ThreadContext::current().is_none());
        let mut ctx = Box::new(ThreadContext::new(false));
        unsafe { ThreadContext::register(&raw mut *ctx) };
        assert_eq!(ThreadContext::current(), Some(&raw mut *ctx));
        ThreadContext::unregister();
        assert!(ThreadContext::current().is_none());
    }
}
