//! Environment table
//!
//! Fixed-capacity table of user environments. Ids carry a generation in the
//! bits above the slot index so a stale id never resolves to the slot's
//! next occupant.

use alloc::vec::Vec;

use x86_64::VirtAddr;

use exokern_abi::env::{LOG2NENV, NENV};
use exokern_abi::{EnvId, EnvStatus, PagePerm, SysError, SysResult, Trapframe};

use crate::memory::{Space, UserPage};

/// Rendezvous state of one environment
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcState {
    /// Blocked in `ipc_recv`; set only by the environment itself
    pub recving: bool,
    /// Where a transferred page lands
    pub dst: Option<UserPage>,
    pub from: EnvId,
    pub value: u32,
    /// Permission of the transferred page, `None` if no page moved
    pub perm: Option<PagePerm>,
}

#[derive(Debug, Clone)]
pub struct Env {
    pub id: EnvId,
    /// `EnvId::SELF` for environments created by the kernel
    pub parent: EnvId,
    pub status: EnvStatus,
    pub space: Space,
    pub tf: Trapframe,
    pub pgfault_upcall: Option<VirtAddr>,
    pub ipc: IpcState,
    pub runs: u64,
}

pub struct EnvTable {
    slots: Vec<Option<Env>>,
    /// Last id handed out per slot, for generation bumps
    last_ids: Vec<u32>,
}

impl EnvTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, NENV);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            last_ids: alloc::vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live environments
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a free slot for a new NOT_RUNNABLE environment.
    pub fn alloc(&mut self, parent: EnvId, space: Space, tf: Trapframe) -> SysResult<EnvId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SysError::NoFreeEnv)?;

        let mut generation = self.last_ids[index].wrapping_add(1 << LOG2NENV) & !(NENV as u32 - 1);
        if generation as i32 <= 0 {
            generation = 1 << LOG2NENV;
        }
        let id = EnvId(generation | index as u32);
        self.last_ids[index] = id.0;

        self.slots[index] = Some(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            space,
            tf,
            pgfault_upcall: None,
            ipc: IpcState::default(),
            runs: 0,
        });
        Ok(id)
    }

    /// Release the slot, handing back the environment record.
    pub fn free(&mut self, id: EnvId) -> Option<Env> {
        self.get(id)?;
        self.slots.get_mut(id.index())?.take()
    }

    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.index())?
            .as_ref()
            .filter(|env| env.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots
            .get_mut(id.index())?
            .as_mut()
            .filter(|env| env.id == id)
    }

    /// Resolve `id` on behalf of `caller`.
    ///
    /// `EnvId::SELF` names the caller. With `check_owner`, the target must
    /// be the caller or one of its direct children.
    pub fn resolve(&self, caller: EnvId, id: EnvId, check_owner: bool) -> SysResult<EnvId> {
        if id.is_self() {
            return self.get(caller).map(|env| env.id).ok_or(SysError::BadTarget);
        }
        let env = self.get(id).ok_or(SysError::BadTarget)?;
        if check_owner && env.id != caller && env.parent != caller {
            return Err(SysError::PermissionDenied);
        }
        Ok(env.id)
    }

    /// Slot contents in index order, for the scheduler
    pub fn slot(&self, index: usize) -> Option<&Env> {
        self.slots.get(index)?.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::soft::SoftMmu;
    use crate::memory::Mmu;

    fn space() -> Space {
        SoftMmu::new(1).create_space().unwrap()
    }

    #[test]
    fn test_ids_are_generation_tagged() {
        let mut table = EnvTable::new(4);
        let a = table.alloc(EnvId::SELF, space(), Trapframe::default()).unwrap();
        assert_eq!(a, EnvId(0x400));
        table.free(a).unwrap();
        let b = table.alloc(EnvId::SELF, space(), Trapframe::default()).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn test_table_full() {
        let mut table = EnvTable::new(2);
        table.alloc(EnvId::SELF, space(), Trapframe::default()).unwrap();
        table.alloc(EnvId::SELF, space(), Trapframe::default()).unwrap();
        assert_eq!(
            table.alloc(EnvId::SELF, space(), Trapframe::default()),
            Err(SysError::NoFreeEnv)
        );
    }

    #[test]
    fn test_resolve_ownership() {
        let mut table = EnvTable::new(8);
        let parent = table.alloc(EnvId::SELF, space(), Trapframe::default()).unwrap();
        let child = table.alloc(parent, space(), Trapframe::default()).unwrap();
        let stranger = table.alloc(EnvId::SELF, space(), Trapframe::default()).unwrap();

        assert_eq!(table.resolve(parent, EnvId::SELF, true), Ok(parent));
        assert_eq!(table.resolve(parent, child, true), Ok(child));
        assert_eq!(table.resolve(child, parent, true), Err(SysError::PermissionDenied));
        assert_eq!(table.resolve(parent, stranger, true), Err(SysError::PermissionDenied));
        assert_eq!(table.resolve(parent, stranger, false), Ok(stranger));
        assert_eq!(table.resolve(parent, EnvId(0x7ff), false), Err(SysError::BadTarget));
    }
}
