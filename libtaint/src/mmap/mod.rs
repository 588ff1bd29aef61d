//! # mmap
//! This module provides implementations for creating memory mappings. These
//! back the shadow memory, either as a single writable reservation or as a
//! read-only reservation whose pages are later replaced one region at a time.
use core::fmt::Debug;

use crate::GuestAddr;

pub mod linux;

pub trait Mmap: Sized + Debug + Send + Sync {
    type Error: Debug + PartialEq;

    /// Map `len` bytes of readable, writable, anonymous memory. The pages are
    /// not backed until they are touched.
    fn map(len: usize) -> Result<Self, Self::Error>;

    /// Reserve `len` bytes of read-only anonymous memory. Every page of the
    /// reservation reads as zero and shares the same physical zero page until
    /// it is replaced with [`Mmap::commit`]. Writes to it fault.
    fn reserve(len: usize) -> Result<Self, Self::Error>;

    /// Replace the pages `addr..addr + len`, which must lie inside an existing
    /// mapping, with private, writable, zero filled pages. The replacement is
    /// atomic with respect to other threads accessing the range.
    fn commit(addr: GuestAddr, len: usize) -> Result<(), Self::Error>;

    /// Exclude the range from core dumps
    fn dont_dump(addr: GuestAddr, len: usize) -> Result<(), Self::Error>;

    /// Size of the pages reported by [`Mmap::resident`]
    fn page_size() -> usize;

    /// Fill `residency` with one entry per page of `addr..addr + len`, the
    /// lowest bit of an entry is set if the page is backed by memory
    fn resident(addr: GuestAddr, len: usize, residency: &mut [u8]) -> Result<(), Self::Error>;

    fn addr(&self) -> GuestAddr;

    fn len(&self) -> usize;

    fn as_slice(&self) -> &[u8];
}
