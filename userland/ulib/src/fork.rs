//! Copy-on-write fork
//!
//! The child is built in stages, each a distinct type, so the order the
//! protocol depends on is checked by the compiler:
//!
//! `Allocated` → `Stacked` (exception stack) → `Armed` (upcall registered,
//! requires [`HandlerInstalled`]) → `Duplicated` (address space shared
//! copy-on-write) → runnable.
//!
//! A [`Child`] dropped before it is started is destroyed, so any `?` on the
//! way out leaves nothing behind.

use core::marker::PhantomData;

use exokern_abi::memlayout::{PAGE_SIZE, PT_REGION, USTACKTOP, UXSTACKTOP};
use exokern_abi::{EnvId, EnvStatus, PagePerm, SysResult};

use crate::memory::UserMemory;
use crate::pgfault::{cow_fault, set_pgfault_handler, HandlerInstalled};
use crate::syscall::SysCalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    Parent(EnvId),
    Child,
}

pub struct Allocated;
pub struct Stacked;
pub struct Armed;
pub struct Duplicated;

/// A child under construction
pub struct Child<'a, S: SysCalls, State> {
    sys: &'a S,
    id: EnvId,
    /// Destroy the child on drop
    owned: bool,
    _state: PhantomData<State>,
}

impl<'a, S: SysCalls, State> Child<'a, S, State> {
    pub fn id(&self) -> EnvId {
        self.id
    }

    fn advance<Next>(mut self) -> Child<'a, S, Next> {
        self.owned = false;
        Child { sys: self.sys, id: self.id, owned: true, _state: PhantomData }
    }
}

impl<S: SysCalls, State> Drop for Child<'_, S, State> {
    fn drop(&mut self) {
        if self.owned {
            let _ = self.sys.env_destroy(self.id);
        }
    }
}

impl<'a, S: SysCalls> Child<'a, S, Allocated> {
    /// Take ownership of a freshly exoforked child
    pub fn allocated(sys: &'a S, id: EnvId) -> Self {
        Child { sys, id, owned: true, _state: PhantomData }
    }

    /// Give the child its own exception stack; never shared, never COW.
    pub fn install_stack(self) -> SysResult<Child<'a, S, Stacked>> {
        self.sys.page_alloc(self.id, UXSTACKTOP - PAGE_SIZE, PagePerm::USER_RW)?;
        Ok(self.advance())
    }
}

impl<'a, S: SysCalls> Child<'a, S, Stacked> {
    /// Register the same upcall as ours with the child.
    pub fn arm(self, _handler: &HandlerInstalled) -> SysResult<Child<'a, S, Armed>> {
        self.sys.env_set_pgfault_upcall(self.id, self.sys.upcall_entry())?;
        Ok(self.advance())
    }
}

impl<'a, S: SysCalls> Child<'a, S, Armed> {
    /// Share every page below the user stack top with the child.
    pub fn duplicate(self) -> SysResult<Child<'a, S, Duplicated>> {
        for region in (0..USTACKTOP).step_by(PT_REGION as usize) {
            if !self.sys.table_present(region) {
                continue;
            }
            let end = (region + PT_REGION).min(USTACKTOP);
            for va in (region..end).step_by(PAGE_SIZE as usize) {
                if let Some(perm) = self.sys.page_perm(va) {
                    duppage(self.sys, self.id, va, perm)?;
                }
            }
        }
        Ok(self.advance())
    }
}

impl<'a, S: SysCalls> Child<'a, S, Duplicated> {
    /// Make the child runnable and hand it over.
    pub fn start(mut self) -> SysResult<EnvId> {
        self.sys.env_set_status(self.id, EnvStatus::Runnable)?;
        self.owned = false;
        Ok(self.id)
    }
}

/// Map our page at `va` into `child`.
///
/// Shared pages go across untouched. Writable and COW pages become COW on
/// both sides; ours must be remapped explicitly even when it was COW
/// already. Read-only pages are simply aliased.
fn duppage<S: SysCalls>(sys: &S, child: EnvId, va: u64, perm: PagePerm) -> SysResult<()> {
    if perm.is_shared() {
        sys.page_map(EnvId::SELF, va, child, va, perm)
    } else if perm.is_writable() || perm.is_cow() {
        let cow = perm.to_cow();
        sys.page_map(EnvId::SELF, va, child, va, cow)?;
        sys.page_map(EnvId::SELF, va, EnvId::SELF, va, cow)
    } else {
        sys.page_map(EnvId::SELF, va, child, va, perm)
    }
}

/// Fork with copy-on-write sharing of the whole address space.
///
/// Returns `Parent(child)` in the caller and, on bare metal, `Child` in the
/// new environment. On failure the half-built child is destroyed and the
/// caller is left as it was, apart from pages already turned COW.
pub fn fork<S: SysCalls + UserMemory>(sys: &S) -> SysResult<ForkResult> {
    let installed = set_pgfault_handler(sys, cow_fault::<S>)?;

    let id = match sys.exofork()? {
        ForkResult::Child => return Ok(ForkResult::Child),
        ForkResult::Parent(id) => id,
    };

    let child = Child::allocated(sys, id)
        .install_stack()?
        .arm(&installed)?
        .duplicate()?
        .start()?;
    Ok(ForkResult::Parent(child))
}
