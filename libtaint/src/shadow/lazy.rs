//! # lazy
//! The lazy shadow reserves the whole shadow range read-only. Until a region
//! is written, all of its tags read as the kernel's shared zero page and a
//! write to it raises a protection fault. Materializing a region replaces its
//! page with a private, writable, zero filled one in a single `mmap` call, so
//! another thread reading the region concurrently either sees the old shared
//! page or the new one, never a partially installed page.
//!
//! Materialization is serialized by a single lock. The bitmap recording the
//! private regions is re-checked whilst holding the lock, so two threads
//! racing on the same region commit one page.
use core::{
    ops::Range,
    ptr::{read_volatile, write_volatile},
    slice::from_raw_parts,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, trace};
use spin::Mutex;

use crate::{
    GuestAddr, Tag,
    mmap::Mmap,
    shadow::{
        PageKind, RegionBitmap, Shadow, ShadowError, ShadowLayout, ShadowRegion, Translation,
    },
};

#[derive(Debug)]
pub struct LazyShadow<M: Mmap, L: ShadowLayout> {
    reservation: M,
    translation: Translation<L>,
    private: RegionBitmap,
    materialized: AtomicUsize,
    lock: Mutex<()>,
}

impl<M: Mmap, L: ShadowLayout> LazyShadow<M, L> {
    pub fn new() -> Result<Self, ShadowError<M>> {
        let len = L::shadow_len();
        let reservation = M::reserve(len).map_err(ShadowError::MmapError)?;
        M::dont_dump(reservation.addr(), len).map_err(ShadowError::MmapError)?;
        debug!(
            "lazy shadow - app: {:#x}-{:#x}, shadow: {:#x}-{:#x}",
            L::APP_START,
            L::APP_LAST,
            reservation.addr(),
            reservation.addr() + len
        );
        Ok(Self {
            translation: Translation::new(reservation.addr()),
            private: RegionBitmap::new(len / L::REGION_SIZE),
            materialized: AtomicUsize::new(0),
            lock: Mutex::new(()),
            reservation,
        })
    }

    fn materialize_region(&self, index: usize) -> Result<(), ShadowError<M>> {
        if self.private.is_set(index) {
            return Ok(());
        }
        let _guard = self.lock.lock();
        if self.private.is_set(index) {
            return Ok(());
        }
        let base = self.translation.region_base(index);
        M::commit(base, L::REGION_SIZE).map_err(ShadowError::MmapError)?;
        if !self.private.set(index) {
            return Err(ShadowError::DoubleMaterialization(base));
        }
        self.materialized.fetch_add(1, Ordering::Relaxed);
        trace!(
            "materialize - app: {:#x}, shadow: {base:#x}",
            self.translation.region_app_base(index)
        );
        Ok(())
    }
}

impl<M: Mmap, L: ShadowLayout> Shadow for LazyShadow<M, L> {
    type Error = ShadowError<M>;

    #[inline]
    fn translate(&self, addr: GuestAddr) -> Result<GuestAddr, Self::Error> {
        self.translation.translate(addr)
    }

    fn get(&self, addr: GuestAddr) -> Result<Tag, Self::Error> {
        let shadow = self.translate(addr)?;
        Ok(unsafe { read_volatile(shadow as *const Tag) })
    }

    fn set(&self, addr: GuestAddr, tag: Tag) -> Result<(), Self::Error> {
        let shadow = self.materialize(addr)?;
        unsafe { write_volatile(shadow as *mut Tag, tag) };
        Ok(())
    }

    fn page_kind(&self, shadow_addr: GuestAddr) -> Option<PageKind> {
        if !self.translation.contains(shadow_addr) {
            return None;
        }
        if self.private.is_set(self.translation.region_index(shadow_addr)) {
            Some(PageKind::Private)
        } else {
            Some(PageKind::Shared)
        }
    }

    fn materialize(&self, addr: GuestAddr) -> Result<GuestAddr, Self::Error> {
        let shadow = self.translate(addr)?;
        self.materialize_region(self.translation.region_index(shadow))?;
        Ok(shadow)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(&ShadowRegion<'_>) -> bool) {
        for index in self.private.iter() {
            let shadow_base = self.translation.region_base(index);
            let region = ShadowRegion {
                app_base: self.translation.region_app_base(index),
                shadow_base,
                tags: unsafe { from_raw_parts(shadow_base as *const Tag, L::REGION_SIZE) },
            };
            if !visitor(&region) {
                break;
            }
        }
    }

    fn materialized_regions(&self) -> usize {
        self.materialized.load(Ordering::Relaxed)
    }

    fn shadow_range(&self) -> Range<GuestAddr> {
        self.reservation.addr()..self.reservation.addr() + self.reservation.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mmap::linux::LinuxMmap, shadow::DefaultShadowLayout};

    type LS = LazyShadow<LinuxMmap, DefaultShadowLayout>;

    #[test]
    fn test_untouched_reads_zero() {
        let shadow = LS::new().unwrap();
        assert_eq!(shadow.get(0x1000), Ok(0));
        assert_eq!(shadow.get(0xffff_fffc), Ok(0));
        assert_eq!(shadow.materialized_regions(), 0);
    }

    #[test]
    fn test_set_materializes_once() {
        let shadow = LS::new().unwrap();
        let target = 0x0804_8000;
        let kind = shadow.page_kind(shadow.translate(target).unwrap());
        assert_eq!(kind, Some(PageKind::Shared));
        shadow.set(target, 0x41).unwrap();
        shadow.set(target + 4, 0x42).unwrap();
        assert_eq!(shadow.get(target), Ok(0x41));
        assert_eq!(shadow.get(target + 3), Ok(0x41));
        assert_eq!(shadow.get(target + 4), Ok(0x42));
        assert_eq!(shadow.materialized_regions(), 1);
        let kind = shadow.page_kind(shadow.translate(target).unwrap());
        assert_eq!(kind, Some(PageKind::Private));
    }

    #[test]
    fn test_translate_scales_by_four() {
        let shadow = LS::new().unwrap();
        let base = shadow.shadow_range().start;
        assert_eq!(shadow.translate(0), Ok(base));
        assert_eq!(shadow.translate(7), Ok(base + 1));
        assert_eq!(shadow.translate(0x4000), Ok(base + 0x1000));
    }

    #[test]
    fn test_page_kind_outside() {
        let shadow = LS::new().unwrap();
        assert_eq!(shadow.page_kind(shadow.shadow_range().end), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_invalid_address() {
        let shadow = LS::new().unwrap();
        assert_eq!(
            shadow.set(0x1_0000_0000, 1),
            Err(ShadowError::InvalidAddress(0x1_0000_0000))
        );
        assert_eq!(shadow.materialized_regions(), 0);
    }

    #[test]
    fn test_iterate_skips_shared() {
        let shadow = LS::new().unwrap();
        shadow.set(0x10_0000, 0x43).unwrap();
        shadow.set(0x8000, 0x41).unwrap();
        let mut seen = Vec::new();
        shadow.iterate(&mut |region| {
            seen.push((region.app_base, region.tags[0]));
            true
        });
        assert_eq!(seen, vec![(0x8000, 0x41), (0x10_0000, 0x43)]);
    }
}
