//! # linux
//! This implementation of `Mmap` uses the `rustix` crate to make direct
//! `syscalls` to allocate pages. Since the fault handler commits shadow pages
//! from within a signal handler, the mappings must not go through any
//! allocator or lock in `libc`.
use core::{ffi::c_void, ptr::null_mut, slice::from_raw_parts};

use log::trace;
use rustix::{
    io::Errno,
    mm::{Advice, MapFlags, ProtFlags, madvise, mmap_anonymous, munmap},
};
use thiserror::Error;

use crate::{GuestAddr, mmap::Mmap};

const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Ord, PartialOrd, PartialEq, Eq, Debug)]
pub struct LinuxMmap {
    addr: GuestAddr,
    len: usize,
}

impl LinuxMmap {
    fn map_anonymous(len: usize, prot: ProtFlags) -> Result<Self, LinuxMapError> {
        unsafe {
            let addr = mmap_anonymous(null_mut(), len, prot, MapFlags::PRIVATE | MapFlags::NORESERVE)
                .map_err(|errno| LinuxMapError::FailedToMap(len, errno))?
                as GuestAddr;
            trace!("Mapped: {:#x}-{:#x} ({prot:?})", addr, addr + len);
            Ok(Self { addr, len })
        }
    }
}

impl Mmap for LinuxMmap {
    type Error = LinuxMapError;

    fn map(len: usize) -> Result<Self, Self::Error> {
        Self::map_anonymous(len, ProtFlags::READ | ProtFlags::WRITE)
    }

    fn reserve(len: usize) -> Result<Self, Self::Error> {
        Self::map_anonymous(len, ProtFlags::READ)
    }

    fn commit(addr: GuestAddr, len: usize) -> Result<(), Self::Error> {
        unsafe {
            mmap_anonymous(
                addr as *mut c_void,
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::NORESERVE,
            )
            .map_err(|errno| LinuxMapError::FailedToCommit(addr, len, errno))?;
        }
        trace!("Committed: {:#x}-{:#x}", addr, addr + len);
        Ok(())
    }

    fn dont_dump(addr: GuestAddr, len: usize) -> Result<(), Self::Error> {
        trace!("dont_dump - addr: {addr:#x}, len: {len:#x}");
        unsafe {
            madvise(addr as *mut c_void, len, Advice::LinuxDontDump)
                .map_err(|errno| LinuxMapError::FailedToMadviseDontDump(addr, len, errno))
        }
    }

    fn page_size() -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => DEFAULT_PAGE_SIZE,
        }
    }

    fn resident(addr: GuestAddr, len: usize, residency: &mut [u8]) -> Result<(), Self::Error> {
        let pages = len.div_ceil(Self::page_size());
        if residency.len() < pages {
            return Err(LinuxMapError::ResidencyTooShort(pages, residency.len()));
        }
        let ret = unsafe { libc::mincore(addr as *mut c_void, len, residency.as_mut_ptr()) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL);
            return Err(LinuxMapError::FailedToQueryResidency(
                addr,
                len,
                Errno::from_raw_os_error(errno),
            ));
        }
        Ok(())
    }

    fn addr(&self) -> GuestAddr {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for LinuxMmap {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { munmap(self.addr as *mut c_void, self.len) } {
            log::error!(
                "Failed to unmap: {:#x}-{:#x}, errno: {errno}",
                self.addr,
                self.addr + self.len
            );
            return;
        }
        trace!("Unmapped: {:#x}-{:#x}", self.addr, self.addr + self.len);
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum LinuxMapError {
    #[error("Failed to map - len: {0:#x}, errno: {1}")]
    FailedToMap(usize, Errno),
    #[error("Failed to commit: {0:#x}, len: {1:#x}, errno: {2}")]
    FailedToCommit(GuestAddr, usize, Errno),
    #[error("Failed to madvise DONTDUMP - addr: {0:#x}, len: {1:#x}, errno: {2}")]
    FailedToMadviseDontDump(GuestAddr, usize, Errno),
    #[error("Failed to query residency - addr: {0:#x}, len: {1:#x}, errno: {2}")]
    FailedToQueryResidency(GuestAddr, usize, Errno),
    #[error("Residency buffer too short - pages: {0}, len: {1}")]
    ResidencyTooShort(usize, usize),
}

#[cfg(test)]
mod tests {
    use core::ptr::{read_volatile, write_volatile};

    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn test_reserve_reads_zero() {
        let map = LinuxMmap::reserve(PAGE * 4).unwrap();
        assert!(map.as_slice().iter().all(|b| *b == 0));
        assert_eq!(map.len(), PAGE * 4);
    }

    #[test]
    fn test_commit_makes_page_writable() {
        let map = LinuxMmap::reserve(PAGE * 4).unwrap();
        let page = map.addr() + PAGE;
        LinuxMmap::commit(page, PAGE).unwrap();
        unsafe {
            write_volatile((page + 8) as *mut u8, 0x41);
            assert_eq!(read_volatile((page + 8) as *const u8), 0x41);
        }
        assert_eq!(map.as_slice()[PAGE + 8], 0x41);
        assert_eq!(map.as_slice()[8], 0);
    }

    #[test]
    fn test_resident_after_write() {
        let map = LinuxMmap::map(PAGE * 4).unwrap();
        unsafe { write_volatile((map.addr() + PAGE * 2) as *mut u8, 0x42) };
        let mut residency = [0u8; 4];
        LinuxMmap::resident(map.addr(), map.len(), &mut residency).unwrap();
        assert_eq!(residency.map(|r| r & 1), [0, 0, 1, 0]);
        assert!(LinuxMmap::resident(map.addr(), map.len(), &mut residency[..2]).is_err());
    }

    #[test]
    fn test_map_is_writable() {
        let map = LinuxMmap::map(PAGE).unwrap();
        unsafe { write_volatile(map.addr() as *mut u8, 0x43) };
        assert_eq!(map.as_slice()[0], 0x43);
    }
}
