//! Address-space permission gate
//!
//! The only code that installs or removes user mappings. Arguments arrive
//! already decoded: a [`UserPage`] is below `UTOP` and aligned, a
//! [`PagePerm`] holds only the permitted bits. Ownership of the target
//! environments is checked by the caller before any of these run.

use x86_64::VirtAddr;

use exokern_abi::memlayout::is_user_page;
use exokern_abi::{PagePerm, SysError, SysResult};

use super::{Mmu, Space, UserPage};

/// Decode a raw user address; it must be page-aligned and below `UTOP`.
pub fn user_page(va: u64) -> SysResult<UserPage> {
    if !is_user_page(va) {
        return Err(SysError::InvalidArg);
    }
    let addr = VirtAddr::try_new(va).map_err(|_| SysError::InvalidArg)?;
    UserPage::from_start_address(addr).map_err(|_| SysError::InvalidArg)
}

/// Install a fresh zeroed frame at `page`, replacing any prior mapping.
pub fn alloc<M: Mmu>(mmu: &mut M, space: Space, page: UserPage, perm: PagePerm) -> SysResult<()> {
    let frame = mmu.allocate_frame().ok_or(SysError::NoMem)?;
    if let Err(e) = mmu.map(space, page, frame, perm) {
        mmu.free_frame(frame);
        return Err(e);
    }
    #[cfg(feature = "mem-trace")]
    crate::log_trace!("[GATE] alloc {:#x} -> {:#x} perm {:#x}",
        page.start_address().as_u64(), frame.start_address().as_u64(), perm.bits());
    Ok(())
}

/// Alias the frame at `src_page` into `dst` at `dst_page`.
pub fn map<M: Mmu>(
    mmu: &mut M,
    src: Space,
    src_page: UserPage,
    dst: Space,
    dst_page: UserPage,
    perm: PagePerm,
) -> SysResult<()> {
    let (frame, held) = mmu.lookup(src, src_page).ok_or(SysError::InvalidArg)?;
    if !held.permits(perm) {
        return Err(SysError::InvalidArg);
    }
    mmu.map(dst, dst_page, frame, perm)?;
    #[cfg(feature = "mem-trace")]
    crate::log_trace!("[GATE] map {:#x} -> {:#x} frame {:#x} perm {:#x}",
        src_page.start_address().as_u64(), dst_page.start_address().as_u64(),
        frame.start_address().as_u64(), perm.bits());
    Ok(())
}

/// Remove the mapping at `page`. Absence is not an error.
pub fn unmap<M: Mmu>(mmu: &mut M, space: Space, page: UserPage) {
    mmu.unmap(space, page);
    #[cfg(feature = "mem-trace")]
    crate::log_trace!("[GATE] unmap {:#x}", page.start_address().as_u64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::soft::SoftMmu;
    use exokern_abi::memlayout::{PAGE_SIZE, UTOP};
    use exokern_abi::PteFlags;
    use proptest::prelude::*;

    const VA: u64 = 0x10_0000;

    fn setup() -> (SoftMmu, Space) {
        let mut mmu = SoftMmu::new(64);
        let space = mmu.create_space().unwrap();
        (mmu, space)
    }

    fn page(va: u64) -> UserPage {
        user_page(va).unwrap()
    }

    #[test]
    fn test_user_page_rejects_bad_addresses() {
        assert!(user_page(VA).is_ok());
        assert_eq!(user_page(VA + 1), Err(SysError::InvalidArg));
        assert_eq!(user_page(UTOP), Err(SysError::InvalidArg));
        assert_eq!(user_page(u64::MAX & !(PAGE_SIZE - 1)), Err(SysError::InvalidArg));
    }

    #[test]
    fn test_alloc_installs_zeroed_frame() {
        let (mut mmu, space) = setup();
        // Dirty a frame, release it, and make sure alloc hands it back clean
        alloc(&mut mmu, space, page(VA), PagePerm::USER_RW).unwrap();
        let (frame, _) = mmu.lookup(space, page(VA)).unwrap();
        mmu.write_phys(frame.start_address(), &[0xAA; 64]);
        unmap(&mut mmu, space, page(VA));

        alloc(&mut mmu, space, page(VA), PagePerm::USER_RO).unwrap();
        let (frame, perm) = mmu.lookup(space, page(VA)).unwrap();
        assert_eq!(perm, PagePerm::USER_RO);
        let mut buf = [0xFFu8; PAGE_SIZE as usize];
        mmu.read_phys(frame.start_address(), &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_alloc_replaces_prior_mapping() {
        let (mut mmu, space) = setup();
        alloc(&mut mmu, space, page(VA), PagePerm::USER_RW).unwrap();
        let before = mmu.frames_in_use();
        let (old, _) = mmu.lookup(space, page(VA)).unwrap();
        alloc(&mut mmu, space, page(VA), PagePerm::USER_RW).unwrap();
        let (new, _) = mmu.lookup(space, page(VA)).unwrap();
        assert_ne!(old, new);
        assert_eq!(mmu.frames_in_use(), before);
    }

    #[test]
    fn test_alloc_out_of_memory() {
        let mut mmu = SoftMmu::new(2);
        let space = mmu.create_space().unwrap();
        // Root and data frame use both frames, leaving none for the page table
        assert_eq!(alloc(&mut mmu, space, page(VA), PagePerm::USER_RW), Err(SysError::NoMem));
        assert!(mmu.lookup(space, page(VA)).is_none());
    }

    #[test]
    fn test_map_aliases_same_frame() {
        let (mut mmu, a) = setup();
        let b = mmu.create_space().unwrap();
        alloc(&mut mmu, a, page(VA), PagePerm::USER_RW).unwrap();
        map(&mut mmu, a, page(VA), b, page(2 * VA), PagePerm::USER_RO).unwrap();
        let (fa, _) = mmu.lookup(a, page(VA)).unwrap();
        let (fb, pb) = mmu.lookup(b, page(2 * VA)).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(pb, PagePerm::USER_RO);
        assert_eq!(mmu.refcount(fa), 2);
    }

    #[test]
    fn test_map_refuses_write_upgrade() {
        let (mut mmu, a) = setup();
        alloc(&mut mmu, a, page(VA), PagePerm::USER_RO).unwrap();
        assert_eq!(
            map(&mut mmu, a, page(VA), a, page(2 * VA), PagePerm::USER_RW),
            Err(SysError::InvalidArg)
        );
        let cow = PagePerm::USER_RO.with(PteFlags::COW);
        alloc(&mut mmu, a, page(VA), cow).unwrap();
        assert_eq!(
            map(&mut mmu, a, page(VA), a, page(2 * VA), PagePerm::USER_RW),
            Err(SysError::InvalidArg)
        );
        assert!(mmu.lookup(a, page(2 * VA)).is_none());
    }

    #[test]
    fn test_map_missing_source() {
        let (mut mmu, a) = setup();
        assert_eq!(
            map(&mut mmu, a, page(VA), a, page(2 * VA), PagePerm::USER_RO),
            Err(SysError::InvalidArg)
        );
    }

    #[test]
    fn test_unmap_is_idempotent() {
        let (mut mmu, space) = setup();
        alloc(&mut mmu, space, page(VA), PagePerm::USER_RW).unwrap();
        let in_use = mmu.frames_in_use();
        unmap(&mut mmu, space, page(VA));
        unmap(&mut mmu, space, page(VA));
        assert!(mmu.lookup(space, page(VA)).is_none());
        assert_eq!(mmu.frames_in_use(), in_use - 1);
    }

    proptest! {
        #[test]
        fn prop_alloc_then_lookup(index in 0u64..0x7_FFFD, optional in 0u64..16) {
            let (mut mmu, space) = setup();
            let va = index * PAGE_SIZE;
            let mut flags = PagePerm::MANDATORY;
            if optional & 1 != 0 { flags |= PteFlags::WRITABLE; }
            if optional & 2 != 0 { flags |= PteFlags::AVAIL; }
            if optional & 4 != 0 { flags |= PteFlags::SHARE; }
            if optional & 8 != 0 { flags |= PteFlags::COW; }
            let perm = PagePerm::new(flags).unwrap();

            alloc(&mut mmu, space, page(va), perm).unwrap();
            let (frame, got) = mmu.lookup(space, page(va)).unwrap();
            prop_assert_eq!(got, perm);
            let mut buf = [1u8; PAGE_SIZE as usize];
            mmu.read_phys(frame.start_address(), &mut buf);
            prop_assert!(buf.iter().all(|b| *b == 0));
        }
    }
}
