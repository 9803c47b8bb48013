//! Checked user/kernel memory copies
//!
//! The kernel reaches user memory through the owning space's page tables,
//! never through the user pointer itself. Every byte of a range must be
//! mapped USER (and WRITABLE for writes) before anything is copied.

use exokern_abi::memlayout::{page_offset, page_round_down, PAGE_SIZE, UTOP};
use exokern_abi::{PteFlags, SysError};
use x86_64::structures::paging::Page;
use x86_64::VirtAddr;

use crate::memory::{Mmu, Space, UserPage};

/// Error codes for usercopy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyError {
    /// Address is not in user space
    NotUserSpace,
    /// Address range overflows
    Overflow,
    /// Page not mapped or not accessible
    PageFault,
    /// Insufficient permissions (e.g., writing to read-only)
    Permission,
}

impl From<UserCopyError> for SysError {
    fn from(_: UserCopyError) -> SysError {
        SysError::Fault
    }
}

/// User-space memory slice, validated against one address space
#[derive(Debug, Clone, Copy)]
pub struct UserSlice {
    space: Space,
    ptr: u64,
    len: usize,
    writable: bool,
}

impl UserSlice {
    /// Create read-only user slice
    pub fn ro<M: Mmu>(mmu: &M, space: Space, ptr: u64, len: usize) -> Result<Self, UserCopyError> {
        validate_user_region(mmu, space, ptr, len, false)?;
        Ok(Self { space, ptr, len, writable: false })
    }

    /// Create read-write user slice
    pub fn rw<M: Mmu>(mmu: &M, space: Space, ptr: u64, len: usize) -> Result<Self, UserCopyError> {
        validate_user_region(mmu, space, ptr, len, true)?;
        Ok(Self { space, ptr, len, writable: true })
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read into kernel buffer
    pub fn read_to<M: Mmu>(&self, mmu: &M, buf: &mut [u8]) -> Result<usize, UserCopyError> {
        let to_read = buf.len().min(self.len);
        copy_from_user(mmu, self.space, &mut buf[..to_read], self.ptr)?;
        Ok(to_read)
    }

    /// Write from kernel buffer
    pub fn write_from<M: Mmu>(&self, mmu: &M, buf: &[u8]) -> Result<usize, UserCopyError> {
        if !self.writable {
            return Err(UserCopyError::Permission);
        }
        let to_write = buf.len().min(self.len);
        copy_to_user(mmu, self.space, self.ptr, &buf[..to_write])?;
        Ok(to_write)
    }
}

fn page_of(va: u64) -> UserPage {
    Page::containing_address(VirtAddr::new_truncate(va))
}

/// Validate a user pointer range without copying
pub fn validate_user_region<M: Mmu>(
    mmu: &M,
    space: Space,
    ptr: u64,
    len: usize,
    write: bool,
) -> Result<(), UserCopyError> {
    if len == 0 {
        return Ok(());
    }
    let end = ptr.checked_add(len as u64).ok_or(UserCopyError::Overflow)?;
    if end > UTOP {
        return Err(UserCopyError::NotUserSpace);
    }
    let mut va = page_round_down(ptr);
    while va < end {
        let (_, perm) = mmu.lookup(space, page_of(va)).ok_or(UserCopyError::PageFault)?;
        if !perm.flags().contains(PteFlags::USER | PteFlags::PRESENT) {
            return Err(UserCopyError::PageFault);
        }
        if write && !perm.is_writable() {
            return Err(UserCopyError::Permission);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Copy data from user space to kernel buffer
pub fn copy_from_user<M: Mmu>(
    mmu: &M,
    space: Space,
    dst: &mut [u8],
    src_ptr: u64,
) -> Result<(), UserCopyError> {
    validate_user_region(mmu, space, src_ptr, dst.len(), false)?;
    let mut done = 0;
    while done < dst.len() {
        let va = src_ptr + done as u64;
        let chunk = chunk_len(va, dst.len() - done);
        let (frame, _) = mmu.lookup(space, page_of(va)).ok_or(UserCopyError::PageFault)?;
        mmu.read_phys(frame.start_address() + page_offset(va), &mut dst[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copy data from kernel buffer to user space
pub fn copy_to_user<M: Mmu>(
    mmu: &M,
    space: Space,
    dst_ptr: u64,
    src: &[u8],
) -> Result<(), UserCopyError> {
    validate_user_region(mmu, space, dst_ptr, src.len(), true)?;
    let mut done = 0;
    while done < src.len() {
        let va = dst_ptr + done as u64;
        let chunk = chunk_len(va, src.len() - done);
        let (frame, _) = mmu.lookup(space, page_of(va)).ok_or(UserCopyError::PageFault)?;
        mmu.write_phys(frame.start_address() + page_offset(va), &src[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

fn chunk_len(va: u64, remaining: usize) -> usize {
    remaining.min((PAGE_SIZE - page_offset(va)) as usize)
}
