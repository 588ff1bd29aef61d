//! # shadow
//! The shadow memory holds one [`Tag`] for every 4 byte word of application
//! memory. The application window and the granularity are described by a
//! [`ShadowLayout`], the storage strategy by a [`Shadow`] implementation:
//!
//! - [`lazy::LazyShadow`] reserves the whole shadow read-only and commits a
//!   private page for a region the first time it is written.
//! - [`dense::DenseShadow`] maps the whole shadow writable up front.
//!
//! Both backends share the same translation, so inline code emitted against
//! one works against the other.
use core::{
    fmt::Debug,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::{GuestAddr, Tag, mmap::Mmap};

pub mod dense;
pub mod lazy;

pub trait ShadowLayout: Debug + Send + Sync + 'static {
    /// Lowest application address covered by the shadow
    const APP_START: GuestAddr;
    /// Highest application address covered by the shadow (inclusive)
    const APP_LAST: GuestAddr;
    /// `log2` of the number of application bytes sharing one tag
    const GRANULE_SHIFT: u32 = 2;
    /// Size of the unit in which the shadow is materialized
    const REGION_SIZE: usize = 4096;

    /// Size of the shadow required to cover the application window
    fn shadow_len() -> usize {
        let len = ((Self::APP_LAST - Self::APP_START) >> Self::GRANULE_SHIFT) + 1;
        len.next_multiple_of(Self::REGION_SIZE)
    }

    /// Number of application bytes covered by one region
    fn region_app_size() -> usize {
        Self::REGION_SIZE << Self::GRANULE_SHIFT
    }
}

/// Layout for a 32-bit application, the whole address space is covered by
/// 1 GiB of shadow.
#[derive(Debug)]
pub struct DefaultShadowLayout;

impl ShadowLayout for DefaultShadowLayout {
    const APP_START: GuestAddr = 0;
    const APP_LAST: GuestAddr = 0xffff_ffff;
}

/// State of the shadow page backing a shadow address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Still the shared read-only zero page, a write will fault
    Shared,
    /// A private page owned by the region
    Private,
}

/// A materialized region as seen by [`Shadow::iterate`]
#[derive(Debug, Clone, Copy)]
pub struct ShadowRegion<'a> {
    /// First application address covered by the region
    pub app_base: GuestAddr,
    /// Address of the first tag of the region
    pub shadow_base: GuestAddr,
    /// The tags, one per application word
    pub tags: &'a [Tag],
}

pub trait Shadow: Debug + Send + Sync {
    type Error: Debug;

    /// The address of the tag for the word containing `addr`
    fn translate(&self, addr: GuestAddr) -> Result<GuestAddr, Self::Error>;

    /// The tag of the word containing `addr`, never written words read `0`
    fn get(&self, addr: GuestAddr) -> Result<Tag, Self::Error>;

    /// Set the tag of the word containing `addr`, materializing its region if
    /// needed
    fn set(&self, addr: GuestAddr, tag: Tag) -> Result<(), Self::Error>;

    /// Classify a shadow address, `None` if it does not belong to the shadow
    fn page_kind(&self, shadow_addr: GuestAddr) -> Option<PageKind>;

    /// Make sure the region holding the tag of `addr` is backed by a private
    /// page and return the address of the tag. Idempotent.
    fn materialize(&self, addr: GuestAddr) -> Result<GuestAddr, Self::Error>;

    /// Visit every materialized region in address order, stop when the
    /// visitor returns `false`
    fn iterate(&self, visitor: &mut dyn FnMut(&ShadowRegion<'_>) -> bool);

    /// Number of regions backed by a private page
    fn materialized_regions(&self) -> usize;

    /// The shadow addresses owned by this store
    fn shadow_range(&self) -> Range<GuestAddr>;
}

#[derive(Error, Debug, PartialEq)]
pub enum ShadowError<M: Mmap> {
    #[error("Invalid application address: {0:#x}")]
    InvalidAddress(GuestAddr),
    #[error("Failed to map shadow: {0:?}")]
    MmapError(M::Error),
    #[error("Region {0:#x} was materialized twice")]
    DoubleMaterialization(GuestAddr),
}

/// Translation shared by both backends
#[derive(Debug)]
struct Translation<L: ShadowLayout> {
    base: GuestAddr,
    _layout: core::marker::PhantomData<L>,
}

impl<L: ShadowLayout> Translation<L> {
    const fn new(base: GuestAddr) -> Self {
        Self {
            base,
            _layout: core::marker::PhantomData,
        }
    }

    #[inline]
    fn translate<M: Mmap>(&self, addr: GuestAddr) -> Result<GuestAddr, ShadowError<M>> {
        if !(L::APP_START..=L::APP_LAST).contains(&addr) {
            return Err(ShadowError::InvalidAddress(addr));
        }
        Ok(self.base + ((addr - L::APP_START) >> L::GRANULE_SHIFT))
    }

    #[inline]
    fn region_index(&self, shadow_addr: GuestAddr) -> usize {
        (shadow_addr - self.base) / L::REGION_SIZE
    }

    #[inline]
    fn region_base(&self, index: usize) -> GuestAddr {
        self.base + index * L::REGION_SIZE
    }

    #[inline]
    fn region_app_base(&self, index: usize) -> GuestAddr {
        L::APP_START + index * L::region_app_size()
    }

    fn contains(&self, shadow_addr: GuestAddr) -> bool {
        (self.base..self.base + L::shadow_len()).contains(&shadow_addr)
    }
}

/// One bit per region
#[derive(Debug)]
struct RegionBitmap {
    words: Box<[AtomicU64]>,
}

impl RegionBitmap {
    fn new(regions: usize) -> Self {
        let words = (0..regions.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    #[inline]
    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64].load(Ordering::Acquire) & (1 << (index % 64)) != 0
    }

    /// Returns whether the bit was previously clear
    #[inline]
    fn set(&self, index: usize) -> bool {
        let bit = 1 << (index % 64);
        self.words[index / 64].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            let mut bits = w.load(Ordering::Acquire);
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }
}
