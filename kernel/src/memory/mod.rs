//! Memory management interface
//!
//! The kernel core never walks page tables itself. Frame allocation,
//! reference counting and the page-table primitives are supplied by an
//! [`Mmu`]; everything that changes a user mapping goes through [`gate`].
//!
//! Frames are reference counted implicitly: `map` takes a reference on the
//! frame it installs and drops the one it replaces, and a frame whose count
//! reaches zero goes back to the allocator.

pub mod gate;
#[cfg(any(test, feature = "hosted"))]
pub mod soft;

use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use exokern_abi::memlayout::PAGE_SIZE;
use exokern_abi::{PagePerm, SysResult};

pub type Frame = PhysFrame<Size4KiB>;
pub type UserPage = Page<Size4KiB>;

/// Address-space handle: the root page-table frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Space(Frame);

impl Space {
    pub fn new(root: Frame) -> Self {
        Space(root)
    }

    pub fn root(self) -> Frame {
        self.0
    }
}

/// Physical memory and page-table primitives
pub trait Mmu {
    /// New empty user address space
    fn create_space(&mut self) -> SysResult<Space>;

    /// Drop every mapping and page table of `space`
    fn destroy_space(&mut self, space: Space);

    /// Zero-filled frame with no references, `None` when memory is exhausted
    fn allocate_frame(&mut self) -> Option<Frame>;

    fn free_frame(&mut self, frame: Frame);

    fn incref(&mut self, frame: Frame);

    /// Drop a reference, freeing the frame when it was the last one
    fn decref(&mut self, frame: Frame);

    fn refcount(&self, frame: Frame) -> u32;

    /// Install `frame` at `page`, replacing (and releasing) any prior
    /// mapping. Fails with `NoMem` if a page table cannot be allocated, in
    /// which case nothing changed.
    fn map(&mut self, space: Space, page: UserPage, frame: Frame, perm: PagePerm) -> SysResult<()>;

    /// Remove the mapping at `page`; no-op if there is none
    fn unmap(&mut self, space: Space, page: UserPage);

    fn lookup(&self, space: Space, page: UserPage) -> Option<(Frame, PagePerm)>;

    /// Does the page table covering `page` exist?
    fn table_present(&self, space: Space, page: UserPage) -> bool;

    /// Kernel pointer to the `PAGE_SIZE` bytes of an allocated frame
    fn frame_ptr(&self, frame: Frame) -> *mut u8;

    /// Kernel pointer to a physical address inside an allocated frame
    fn phys_ptr(&self, addr: PhysAddr) -> *mut u8 {
        let frame = Frame::containing_address(addr);
        let offset = addr - frame.start_address();
        // SAFETY: offset < PAGE_SIZE and frame_ptr covers the whole frame
        unsafe { self.frame_ptr(frame).add(offset as usize) }
    }

    fn copy_frame(&self, dst: Frame, src: Frame) {
        let (dst, src) = (self.frame_ptr(dst), self.frame_ptr(src));
        // SAFETY: both pointers cover a full frame; copy handles dst == src
        unsafe { core::ptr::copy(src, dst, PAGE_SIZE as usize) }
    }

    /// Copy out of physical memory; the range must stay inside one frame.
    fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]) {
        let len = clamp_to_frame(addr, buf.len());
        // SAFETY: `len` keeps the copy inside the frame holding `addr`
        unsafe { core::ptr::copy_nonoverlapping(self.phys_ptr(addr), buf.as_mut_ptr(), len) }
    }

    /// Copy into physical memory; the range must stay inside one frame.
    fn write_phys(&self, addr: PhysAddr, bytes: &[u8]) {
        let len = clamp_to_frame(addr, bytes.len());
        // SAFETY: as for read_phys
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.phys_ptr(addr), len) }
    }
}

fn clamp_to_frame(addr: PhysAddr, len: usize) -> usize {
    let room = PAGE_SIZE - (addr.as_u64() & (PAGE_SIZE - 1));
    debug_assert!(len as u64 <= room, "physical copy crosses a frame boundary");
    len.min(room as usize)
}
