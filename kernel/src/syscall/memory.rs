//! Page syscalls
//!
//! Decode raw arguments, resolve and owner-check the environments, then hand
//! off to the permission gate. Every check happens before the first
//! mutation.

use exokern_abi::memlayout::page_round_down;
use exokern_abi::{EnvId, PagePerm, SysError, SysResult};

use super::{Reply, DONE};
use crate::memory::gate::{self, user_page};
use crate::memory::{Mmu, Space};
use crate::Kernel;

impl<M: Mmu> Kernel<M> {
    fn owned_space(&self, caller: EnvId, id: u64) -> SysResult<Space> {
        let id = self.envs.resolve(caller, EnvId::from_raw(id)?, true)?;
        Ok(self.envs.get(id).ok_or(SysError::BadTarget)?.space)
    }

    pub(super) fn sys_page_alloc(&mut self, caller: EnvId, id: u64, va: u64, perm: u64) -> SysResult<Reply> {
        let space = self.owned_space(caller, id)?;
        let page = user_page(va)?;
        let perm = PagePerm::from_bits(perm)?;
        gate::alloc(&mut self.mmu, space, page, perm)?;
        DONE
    }

    pub(super) fn sys_page_map(
        &mut self,
        caller: EnvId,
        src_id: u64,
        src_va: u64,
        dst_id: u64,
        dst_va: u64,
        perm: u64,
    ) -> SysResult<Reply> {
        let src = self.owned_space(caller, src_id)?;
        let dst = self.owned_space(caller, dst_id)?;
        let (src_page, dst_page) = (user_page(src_va)?, user_page(dst_va)?);
        let perm = PagePerm::from_bits(perm)?;
        gate::map(&mut self.mmu, src, src_page, dst, dst_page, perm)?;
        DONE
    }

    pub(super) fn sys_page_unmap(&mut self, caller: EnvId, id: u64, va: u64) -> SysResult<Reply> {
        let space = self.owned_space(caller, id)?;
        let page = user_page(va)?;
        gate::unmap(&mut self.mmu, space, page);
        DONE
    }

    /// Permission bits of the caller's mapping covering `va`, 0 if none
    pub(super) fn sys_page_query(&mut self, caller: EnvId, va: u64) -> SysResult<Reply> {
        let space = self.envs.get(caller).ok_or(SysError::BadTarget)?.space;
        let page = user_page(page_round_down(va))?;
        let bits = self.mmu.lookup(space, page).map_or(0, |(_, perm)| perm.bits());
        Ok(Reply::Value(bits))
    }

    /// 1 if the page table covering `va` exists in the caller
    pub(super) fn sys_region_query(&mut self, caller: EnvId, va: u64) -> SysResult<Reply> {
        let space = self.envs.get(caller).ok_or(SysError::BadTarget)?.space;
        let page = user_page(page_round_down(va))?;
        Ok(Reply::Value(u64::from(self.mmu.table_present(space, page))))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{call, kernel, running};
    use super::super::Outcome;
    use crate::memory::gate::user_page;
    use crate::memory::Mmu;
    use exokern_abi::memlayout::{PAGE_SIZE, PT_REGION, USTACKTOP, UTEXT, UTOP};
    use exokern_abi::{EnvId, PteFlags, SysError, Syscall};
    use proptest::prelude::*;

    const P: u64 = PteFlags::PRESENT.bits();
    const W: u64 = PteFlags::WRITABLE.bits();
    const U: u64 = PteFlags::USER.bits();

    fn err(e: SysError) -> Outcome {
        Outcome::Return(e.as_i64())
    }

    #[test]
    fn test_alloc_query_unmap() {
        let mut k = kernel(16);
        running(&mut k);
        assert_eq!(call(&mut k, Syscall::PageQuery, &[UTEXT + 8]), Outcome::Return(0));
        assert_eq!(call(&mut k, Syscall::RegionQuery, &[UTEXT]), Outcome::Return(0));

        assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, UTEXT, P | U | W]), Outcome::Return(0));
        assert_eq!(call(&mut k, Syscall::PageQuery, &[UTEXT + 8]), Outcome::Return((P | U | W) as i64));
        assert_eq!(call(&mut k, Syscall::RegionQuery, &[UTEXT + PT_REGION - 1]), Outcome::Return(1));

        assert_eq!(call(&mut k, Syscall::PageUnmap, &[0, UTEXT]), Outcome::Return(0));
        assert_eq!(call(&mut k, Syscall::PageUnmap, &[0, UTEXT]), Outcome::Return(0));
        assert_eq!(call(&mut k, Syscall::PageQuery, &[UTEXT]), Outcome::Return(0));
    }

    #[test]
    fn test_alloc_argument_errors() {
        let mut k = kernel(16);
        running(&mut k);
        let bad = err(SysError::InvalidArg);
        assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, UTEXT + 1, P | U]), bad);
        assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, UTOP, P | U]), bad);
        assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, UTEXT, U]), bad);
        assert_eq!(call(&mut k, Syscall::PageQuery, &[UTOP]), bad);
    }

    #[test]
    fn test_alloc_out_of_memory() {
        let mut k = kernel(4);
        running(&mut k);
        // root, stack table, stack page, then one frame left for a table
        assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, UTEXT, P | U]), err(SysError::NoMem));
        assert_eq!(k.mmu().frames_in_use(), 3);
    }

    #[test]
    fn test_map_between_parent_and_child() {
        let mut k = kernel(32);
        let parent = running(&mut k);
        let child = match call(&mut k, Syscall::Exofork, &[]) {
            Outcome::Return(id) => EnvId(id as u32),
            other => panic!("{:?}", other),
        };
        let c = child.as_u64();

        assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, UTEXT, P | U | W]), Outcome::Return(0));
        assert_eq!(call(&mut k, Syscall::PageMap, &[0, UTEXT, c, UTEXT, P | U]), Outcome::Return(0));
        // Read-only source cannot be upgraded
        assert_eq!(call(&mut k, Syscall::PageMap, &[c, UTEXT, 0, UTEXT + PAGE_SIZE, P | U | W]), err(SysError::InvalidArg));
        // Nothing mapped at the source
        assert_eq!(call(&mut k, Syscall::PageMap, &[0, UTEXT + PAGE_SIZE, c, UTEXT, P | U]), err(SysError::InvalidArg));

        let page = user_page(UTEXT).unwrap();
        let (pf, _) = k.mmu().lookup(k.env(parent).unwrap().space, page).unwrap();
        let (cf, cperm) = k.mmu().lookup(k.env(child).unwrap().space, page).unwrap();
        assert_eq!(pf, cf);
        assert!(!cperm.is_writable());
        assert_eq!(k.mmu().refcount(pf), 2);
    }

    #[test]
    fn test_map_requires_owning_both() {
        let mut k = kernel(32);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();
        k.env_run(a);
        let stack = USTACKTOP - PAGE_SIZE;
        assert_eq!(
            call(&mut k, Syscall::PageMap, &[b.as_u64(), stack, 0, UTEXT, P | U]),
            err(SysError::PermissionDenied)
        );
        assert_eq!(
            call(&mut k, Syscall::PageMap, &[0, stack, b.as_u64(), UTEXT, P | U]),
            err(SysError::PermissionDenied)
        );
        assert_eq!(k.mmu().lookup(k.env(b).unwrap().space, user_page(UTEXT).unwrap()), None);
    }

    proptest! {
        #[test]
        fn prop_foreign_perm_bits_rejected(bit in 3u32..64, va_page in 0u64..1024) {
            prop_assume!(!(9..=11).contains(&bit));
            let stray = 1u64 << bit;
            let va = UTEXT + va_page * PAGE_SIZE;
            let mut k = kernel(16);
            running(&mut k);
            let before = k.mmu().frames_in_use();

            prop_assert_eq!(call(&mut k, Syscall::PageAlloc, &[0, va, P | U | stray]), err(SysError::InvalidArg));
            prop_assert_eq!(call(&mut k, Syscall::PageQuery, &[va]), Outcome::Return(0));
            prop_assert_eq!(k.mmu().frames_in_use(), before);
        }
    }
}
