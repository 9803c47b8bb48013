//! Software MMU
//!
//! A fixed arena of page-aligned frames with per-space page tables kept in
//! ordered maps. Page-table frames are still drawn from the arena (one per
//! `PT_REGION` of user space, plus a root per space) so exhaustion behaves
//! like the hardware walker: a mapping can fail with `NoMem` even when the
//! data frame was available.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use x86_64::PhysAddr;

use exokern_abi::memlayout::{PAGE_SIZE, PT_REGION};
use exokern_abi::{PagePerm, SysError, SysResult};

use super::{Frame, Mmu, Space, UserPage};

/// Physical address of arena frame 0
const PHYS_BASE: u64 = 0x10_0000;

#[repr(C, align(4096))]
struct PageBuf(UnsafeCell<[u8; PAGE_SIZE as usize]>);

#[derive(Debug, Clone, Copy)]
struct Pte {
    frame: Frame,
    perm: PagePerm,
}

#[derive(Debug, Default)]
struct SoftSpace {
    /// Region index -> page-table frame
    tables: BTreeMap<u64, Frame>,
    /// Page number -> entry
    ptes: BTreeMap<u64, Pte>,
}

pub struct SoftMmu {
    pages: Box<[PageBuf]>,
    refs: Vec<u32>,
    allocated: Vec<bool>,
    free: Vec<usize>,
    spaces: BTreeMap<Space, SoftSpace>,
}

impl SoftMmu {
    pub fn new(frames: usize) -> Self {
        let pages = (0..frames)
            .map(|_| PageBuf(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            pages,
            refs: alloc::vec![0; frames],
            allocated: alloc::vec![false; frames],
            free: (0..frames).rev().collect(),
            spaces: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Frames currently handed out, page tables included
    pub fn frames_in_use(&self) -> usize {
        self.pages.len() - self.free.len()
    }

    pub fn spaces(&self) -> usize {
        self.spaces.len()
    }

    fn index(&self, frame: Frame) -> usize {
        let addr = frame.start_address().as_u64();
        let index = addr.wrapping_sub(PHYS_BASE) / PAGE_SIZE;
        assert!(
            addr >= PHYS_BASE && (index as usize) < self.pages.len(),
            "frame {:#x} is not in the arena",
            addr
        );
        index as usize
    }

    fn frame_at(index: usize) -> Frame {
        Frame::containing_address(PhysAddr::new(PHYS_BASE + index as u64 * PAGE_SIZE))
    }

    fn page_number(page: UserPage) -> u64 {
        page.start_address().as_u64() / PAGE_SIZE
    }

    fn region(page: UserPage) -> u64 {
        page.start_address().as_u64() / PT_REGION
    }
}

impl Mmu for SoftMmu {
    fn create_space(&mut self) -> SysResult<Space> {
        let root = self.allocate_frame().ok_or(SysError::NoMem)?;
        self.incref(root);
        let space = Space::new(root);
        self.spaces.insert(space, SoftSpace::default());
        Ok(space)
    }

    fn destroy_space(&mut self, space: Space) {
        let Some(soft) = self.spaces.remove(&space) else {
            return;
        };
        for pte in soft.ptes.values() {
            self.decref(pte.frame);
        }
        for table in soft.tables.values() {
            self.decref(*table);
        }
        self.decref(space.root());
    }

    fn allocate_frame(&mut self) -> Option<Frame> {
        let index = self.free.pop()?;
        // SAFETY: the frame is free, nothing else points into it
        unsafe { (*self.pages[index].0.get()).fill(0) };
        self.allocated[index] = true;
        self.refs[index] = 0;
        Some(Self::frame_at(index))
    }

    fn free_frame(&mut self, frame: Frame) {
        let index = self.index(frame);
        assert!(self.allocated[index], "double free of frame {:#x}", frame.start_address().as_u64());
        self.allocated[index] = false;
        self.refs[index] = 0;
        self.free.push(index);
    }

    fn incref(&mut self, frame: Frame) {
        let index = self.index(frame);
        self.refs[index] += 1;
    }

    fn decref(&mut self, frame: Frame) {
        let index = self.index(frame);
        self.refs[index] = self.refs[index].saturating_sub(1);
        if self.refs[index] == 0 {
            self.free_frame(frame);
        }
    }

    fn refcount(&self, frame: Frame) -> u32 {
        self.refs[self.index(frame)]
    }

    fn map(&mut self, space: Space, page: UserPage, frame: Frame, perm: PagePerm) -> SysResult<()> {
        let region = Self::region(page);
        let needs_table = !self
            .spaces
            .get(&space)
            .ok_or(SysError::InvalidArg)?
            .tables
            .contains_key(&region);
        if needs_table {
            let table = self.allocate_frame().ok_or(SysError::NoMem)?;
            self.incref(table);
            if let Some(soft) = self.spaces.get_mut(&space) {
                soft.tables.insert(region, table);
            }
        }

        // Take the new reference first so remapping a frame onto itself
        // never drops it to zero
        self.incref(frame);
        let old = self
            .spaces
            .get_mut(&space)
            .and_then(|soft| soft.ptes.insert(Self::page_number(page), Pte { frame, perm }));
        if let Some(old) = old {
            self.decref(old.frame);
        }
        Ok(())
    }

    fn unmap(&mut self, space: Space, page: UserPage) {
        let old = self
            .spaces
            .get_mut(&space)
            .and_then(|soft| soft.ptes.remove(&Self::page_number(page)));
        if let Some(old) = old {
            self.decref(old.frame);
        }
    }

    fn lookup(&self, space: Space, page: UserPage) -> Option<(Frame, PagePerm)> {
        let pte = self.spaces.get(&space)?.ptes.get(&Self::page_number(page))?;
        Some((pte.frame, pte.perm))
    }

    fn table_present(&self, space: Space, page: UserPage) -> bool {
        self.spaces
            .get(&space)
            .map_or(false, |soft| soft.tables.contains_key(&Self::region(page)))
    }

    fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        self.pages[self.index(frame)].0.get() as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::gate::user_page;

    #[test]
    fn test_frames_are_page_aligned() {
        let mut mmu = SoftMmu::new(4);
        let frame = mmu.allocate_frame().unwrap();
        assert_eq!(mmu.frame_ptr(frame) as usize % PAGE_SIZE as usize, 0);
        assert_eq!(frame.start_address().as_u64() % PAGE_SIZE, 0);
    }

    #[test]
    fn test_decref_frees_at_zero() {
        let mut mmu = SoftMmu::new(4);
        let frame = mmu.allocate_frame().unwrap();
        mmu.incref(frame);
        mmu.incref(frame);
        assert_eq!(mmu.frames_in_use(), 1);
        mmu.decref(frame);
        assert_eq!(mmu.frames_in_use(), 1);
        mmu.decref(frame);
        assert_eq!(mmu.frames_in_use(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut mmu = SoftMmu::new(2);
        assert!(mmu.allocate_frame().is_some());
        assert!(mmu.allocate_frame().is_some());
        assert!(mmu.allocate_frame().is_none());
    }

    #[test]
    fn test_remap_same_frame_keeps_it() {
        let mut mmu = SoftMmu::new(8);
        let space = mmu.create_space().unwrap();
        let page = user_page(0x40_0000).unwrap();
        let frame = mmu.allocate_frame().unwrap();
        mmu.map(space, page, frame, PagePerm::USER_RW).unwrap();
        mmu.map(space, page, frame, PagePerm::USER_RO).unwrap();
        assert_eq!(mmu.refcount(frame), 1);
        assert_eq!(mmu.lookup(space, page), Some((frame, PagePerm::USER_RO)));
    }

    #[test]
    fn test_destroy_space_releases_everything() {
        let mut mmu = SoftMmu::new(16);
        let space = mmu.create_space().unwrap();
        for va in [0x40_0000u64, 0x40_1000, 0x80_0000] {
            let frame = mmu.allocate_frame().unwrap();
            mmu.map(space, user_page(va).unwrap(), frame, PagePerm::USER_RW).unwrap();
        }
        // root + 2 tables + 3 pages
        assert_eq!(mmu.frames_in_use(), 6);
        assert!(mmu.table_present(space, user_page(0x40_0000).unwrap()));
        assert!(!mmu.table_present(space, user_page(0x100_0000).unwrap()));
        mmu.destroy_space(space);
        assert_eq!(mmu.frames_in_use(), 0);
        assert_eq!(mmu.spaces(), 0);
    }
}
