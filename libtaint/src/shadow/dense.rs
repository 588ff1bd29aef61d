//! # dense
//! The dense shadow maps the whole shadow range writable when it is created.
//! Physical pages are still only allocated by the kernel when first touched,
//! but inline code never faults. Inline code writes tags without telling the
//! store, so iteration asks the kernel which shadow pages are resident and
//! visits the regions among them holding a tag. A bitmap additionally records
//! the regions written through [`Shadow::set`] and [`Shadow::materialize`].
use core::{
    ops::Range,
    ptr::{read_volatile, write_volatile},
    slice::from_raw_parts,
};

use log::{debug, warn};

use crate::{
    GuestAddr, Tag,
    mmap::Mmap,
    shadow::{
        PageKind, RegionBitmap, Shadow, ShadowError, ShadowLayout, ShadowRegion, Translation,
    },
};

#[derive(Debug)]
pub struct DenseShadow<M: Mmap, L: ShadowLayout> {
    mapping: M,
    translation: Translation<L>,
    touched: RegionBitmap,
}

impl<M: Mmap, L: ShadowLayout> DenseShadow<M, L> {
    pub fn new() -> Result<Self, ShadowError<M>> {
        let len = L::shadow_len();
        let mapping = M::map(len).map_err(ShadowError::MmapError)?;
        M::dont_dump(mapping.addr(), len).map_err(ShadowError::MmapError)?;
        debug!(
            "dense shadow - app: {:#x}-{:#x}, shadow: {:#x}-{:#x}",
            L::APP_START,
            L::APP_LAST,
            mapping.addr(),
            mapping.addr() + len
        );
        Ok(Self {
            translation: Translation::new(mapping.addr()),
            touched: RegionBitmap::new(len / L::REGION_SIZE),
            mapping,
        })
    }

    /// Per page residency of the whole shadow, `None` if the kernel could not
    /// tell, in which case every page must be assumed resident
    fn residency(&self) -> Option<Vec<u8>> {
        let pages = self.mapping.len().div_ceil(M::page_size());
        let mut residency = vec![0; pages];
        match M::resident(self.mapping.addr(), self.mapping.len(), &mut residency) {
            Ok(()) => Some(residency),
            Err(e) => {
                warn!("Unable to query shadow residency: {e:?}");
                None
            }
        }
    }

    /// Visit the written regions in address order
    fn visit_written(&self, visitor: &mut dyn FnMut(&ShadowRegion<'_>) -> bool) {
        let residency = self.residency();
        let page = M::page_size();
        for index in 0..self.mapping.len() / L::REGION_SIZE {
            let shadow_base = self.translation.region_base(index);
            let offset = shadow_base - self.mapping.addr();
            let resident = residency.as_ref().is_none_or(|residency| {
                residency[offset / page..(offset + L::REGION_SIZE).div_ceil(page)]
                    .iter()
                    .any(|r| r & 1 != 0)
            });
            if !resident && !self.touched.is_set(index) {
                continue;
            }
            let region = ShadowRegion {
                app_base: self.translation.region_app_base(index),
                shadow_base,
                tags: unsafe { from_raw_parts(shadow_base as *const Tag, L::REGION_SIZE) },
            };
            if !self.touched.is_set(index) && region.tags.iter().all(|t| *t == 0) {
                continue;
            }
            if !visitor(&region) {
                break;
            }
        }
    }
}

impl<M: Mmap, L: ShadowLayout> Shadow for DenseShadow<M, L> {
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
        self.translation
            .contains(shadow_addr)
            .then_some(PageKind::Private)
    }

    fn materialize(&self, addr: GuestAddr) -> Result<GuestAddr, Self::Error> {
        let shadow = self.translate(addr)?;
        self.touched.set(self.translation.region_index(shadow));
        Ok(shadow)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(&ShadowRegion<'_>) -> bool) {
        self.visit_written(visitor);
    }

    fn materialized_regions(&self) -> usize {
        let mut regions = 0;
        self.visit_written(&mut |_| {
            regions += 1;
            true
        });
        regions
    }

    fn shadow_range(&self) -> Range<GuestAddr> {
        self.mapping.addr()..self.mapping.addr() + self.mapping.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mmap::linux::LinuxMmap, shadow::DefaultShadowLayout};

    type DS = DenseShadow<LinuxMmap, DefaultShadowLayout>;

    #[test]
    fn test_dense_set_get() {
        let shadow = DS::new().unwrap();
        assert_eq!(shadow.get(0xbeef_0000), Ok(0));
        shadow.set(0xbeef_0000, 0x42).unwrap();
        assert_eq!(shadow.get(0xbeef_0002), Ok(0x42));
        assert_eq!(shadow.materialized_regions(), 1);
    }

    #[test]
    fn test_dense_iterates_inline_writes() {
        let shadow = DS::new().unwrap();
        shadow.set(0x0001_0000, 0x41).unwrap();
        // A store emitted inline, which bypasses the store
        let inline = shadow.translate(0x0800_0010).unwrap();
        unsafe { write_volatile(inline as *mut Tag, 0x42) };
        // Reading an untouched region does not make it visible
        assert_eq!(shadow.get(0x0900_0000), Ok(0));

        let mut seen = Vec::new();
        shadow.iterate(&mut |region| {
            seen.push((region.app_base, region.tags.iter().filter(|t| **t != 0).count()));
            true
        });
        assert_eq!(seen, vec![(0x0001_0000, 1), (0x0800_0000, 1)]);
        assert_eq!(shadow.materialized_regions(), 2);
    }

    #[test]
    fn test_dense_never_shared() {
        let shadow = DS::new().unwrap();
        let addr = shadow.translate(0x1234).unwrap();
        assert_eq!(shadow.page_kind(addr), Some(PageKind::Private));
    }
}
