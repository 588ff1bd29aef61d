//! # syscall
//! The ARM EABI system calls the guard acts on.
use core::fmt::{self, Display, Formatter};

use libtaint::{GuestAddr, Tag};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::TaintClass;

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNumber {
    Write = 4,
    Brk = 45,
    Mmap2 = 192,
    Send = 289,
}

impl SyscallNumber {
    /// Whether the call returns a fresh heap or library address in `r0`
    #[must_use]
    pub fn returns_address(self) -> bool {
        matches!(self, Self::Brk | Self::Mmap2)
    }

    /// Whether the call sends the buffer in its second argument out of the
    /// process
    #[must_use]
    pub fn is_sink(self) -> bool {
        matches!(self, Self::Write | Self::Send)
    }
}

/// A tainted byte found in a buffer about to leave the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leak {
    pub syscall: SyscallNumber,
    pub addr: GuestAddr,
    pub tag: Tag,
}

impl Leak {
    /// The class of the leaked address, if the tag is a single class
    #[must_use]
    pub fn class(&self) -> Option<TaintClass> {
        TaintClass::try_from(self.tag).ok()
    }
}

impl Display for Leak {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} leaks {} address at {:#x} (tag: {:#x})",
            self.syscall,
            self.class()
                .map_or_else(|| "mixed".to_string(), |c| format!("{c:?}").to_lowercase()),
            self.addr,
            self.tag
        )
    }
}

/// What the host should do with a system call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallVerdict {
    /// Nothing to report
    Allow,
    /// Let the call proceed, a leak was reported
    Leak(Leak),
    /// Skip the call and make it return `-1`
    Fail(Leak),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers() {
        assert_eq!(SyscallNumber::try_from(192).unwrap(), SyscallNumber::Mmap2);
        assert!(SyscallNumber::try_from(3).is_err());
        assert!(SyscallNumber::Brk.returns_address());
        assert!(!SyscallNumber::Send.returns_address());
        assert!(SyscallNumber::Send.is_sink());
    }

    #[test]
    fn test_leak_display() {
        let leak = Leak {
            syscall: SyscallNumber::Write,
            addr: 0x1000,
            tag: 0x43,
        };
        assert_eq!(leak.class(), Some(TaintClass::Heap));
        assert_eq!(
            leak.to_string(),
            "Write leaks heap address at 0x1000 (tag: 0x43)"
        );
        let mixed = Leak { tag: 0x47, ..leak };
        assert_eq!(mixed.class(), None);
    }
}
