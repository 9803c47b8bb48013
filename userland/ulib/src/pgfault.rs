//! User-level page-fault handling
//!
//! The kernel reflects faults to the environment's upcall with a
//! [`UTrapframe`] on the exception stack; the upcall calls whatever handler
//! is installed here, then resumes the faulting instruction.

use core::fmt;

use exokern_abi::memlayout::{page_round_down, PAGE_SIZE, PFTEMP, UXSTACKTOP};
use exokern_abi::{EnvId, FaultCode, PagePerm, PteFlags, SysError, SysResult, UTrapframe};

use crate::memory::UserMemory;
use crate::syscall::SysCalls;

pub type FaultHandler<S> = fn(&S, &UTrapframe) -> Result<(), FaultError>;

/// Why a fault could not be resolved. All of these end the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Nothing mapped at the faulting address
    NotMapped(u64),
    /// A write to a page that is read-only for real
    NotCopyOnWrite(u64),
    /// A read fault; only writes are ever resolvable
    NotWrite(u64),
    Syscall(SysError),
}

impl From<SysError> for FaultError {
    fn from(e: SysError) -> Self {
        FaultError::Syscall(e)
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::NotMapped(va) => write!(f, "fault at {:#x}: page not mapped", va),
            FaultError::NotCopyOnWrite(va) => write!(f, "fault at {:#x}: page is not copy-on-write", va),
            FaultError::NotWrite(va) => write!(f, "read fault at {:#x}", va),
            FaultError::Syscall(e) => write!(f, "fault handler syscall failed: {}", e),
        }
    }
}

/// Proof that this environment has an exception stack, a registered upcall
/// and a handler. Needed before any page may be made copy-on-write.
#[derive(Debug)]
pub struct HandlerInstalled(());

/// Install `handler`. The first call also allocates the exception stack
/// and registers the upcall with the kernel.
pub fn set_pgfault_handler<S: SysCalls>(sys: &S, handler: FaultHandler<S>) -> SysResult<HandlerInstalled> {
    if sys.fault_handler().is_none() {
        sys.page_alloc(EnvId::SELF, UXSTACKTOP - PAGE_SIZE, PagePerm::USER_RW)?;
        sys.env_set_pgfault_upcall(EnvId::SELF, sys.upcall_entry())?;
    }
    sys.set_fault_handler(handler);
    Ok(HandlerInstalled(()))
}

/// Resolve a write to a copy-on-write page with a private writable copy.
pub fn cow_fault<S: SysCalls + UserMemory>(sys: &S, utf: &UTrapframe) -> Result<(), FaultError> {
    let va = utf.fault_va;
    let page = page_round_down(va);

    if !FaultCode::from_bits_truncate(utf.err).contains(FaultCode::WRITE) {
        return Err(FaultError::NotWrite(va));
    }
    let perm = sys.page_perm(page).ok_or(FaultError::NotMapped(va))?;
    if !perm.is_cow() {
        return Err(FaultError::NotCopyOnWrite(va));
    }

    sys.page_alloc(EnvId::SELF, PFTEMP, PagePerm::USER_RW)?;
    sys.copy(PFTEMP, page, PAGE_SIZE as usize);
    let private = perm.without(PteFlags::COW).with(PteFlags::WRITABLE);
    sys.page_map(EnvId::SELF, PFTEMP, EnvId::SELF, page, private)?;
    sys.page_unmap(EnvId::SELF, PFTEMP)?;
    Ok(())
}
