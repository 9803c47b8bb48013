//! Page-fault upcalls
//!
//! A user page fault is reflected back to the faulting environment: the
//! kernel pushes a [`UTrapframe`] on the user exception stack and resumes
//! the environment at its registered upcall. A fault taken while already on
//! the exception stack nests below the interrupted frame, leaving its red
//! zone plus one word (the trampoline's return slot) untouched.

use x86_64::VirtAddr;

use exokern_abi::memlayout::{PAGE_SIZE, RED_ZONE, UXSTACKTOP};
use exokern_abi::{FaultCode, UTrapframe};

use crate::memory::Mmu;
use crate::usercopy::copy_to_user;
use crate::Kernel;

/// Result of delivering a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Environment resumes at its upcall with `rsp` at the pushed record
    Upcall(VirtAddr),
    /// Environment could not take the fault and was destroyed
    Destroyed,
}

/// Bottom of the user exception stack
const UXSTACKBOTTOM: u64 = UXSTACKTOP - PAGE_SIZE;

impl<M: Mmu> Kernel<M> {
    /// Reflect a page fault at `fault_va` to the current environment.
    ///
    /// # Panics
    ///
    /// With no current environment: the fault came from the kernel itself.
    pub fn page_fault(&mut self, fault_va: u64, code: FaultCode) -> FaultOutcome {
        let Some(id) = self.curenv else {
            panic!("kernel page fault at {:#x} ({:?})", fault_va, code);
        };
        let Some(env) = self.envs.get(id) else {
            panic!("page fault in vanished env {}", id);
        };
        let (tf, space) = (env.tf, env.space);

        let Some(upcall) = env.pgfault_upcall else {
            crate::log_warn!("[TRAP] env {} fault va {:#x} ip {:#x}: no upcall", id, fault_va, tf.rip);
            self.env_destroy(id);
            return FaultOutcome::Destroyed;
        };

        let top = if (UXSTACKBOTTOM..UXSTACKTOP).contains(&tf.rsp) {
            tf.rsp.saturating_sub(RED_ZONE + 8)
        } else {
            UXSTACKTOP
        };
        let at = top.saturating_sub(UTrapframe::SIZE as u64);
        if at < UXSTACKBOTTOM {
            crate::log_warn!("[TRAP] env {} exception stack overflow at {:#x}", id, fault_va);
            self.env_destroy(id);
            return FaultOutcome::Destroyed;
        }

        let utf = UTrapframe {
            fault_va,
            err: code.bits(),
            regs: tf.regs,
            rip: tf.rip,
            rflags: tf.rflags,
            rsp: tf.rsp,
        };
        if copy_to_user(&self.mmu, space, at, &utf.to_bytes()).is_err() {
            crate::log_warn!("[TRAP] env {} has no usable exception stack", id);
            self.env_destroy(id);
            return FaultOutcome::Destroyed;
        }

        if let Some(env) = self.envs.get_mut(id) {
            env.tf.rip = upcall.as_u64();
            env.tf.rsp = at;
        }
        FaultOutcome::Upcall(VirtAddr::new(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::gate::{self, user_page};
    use crate::memory::soft::SoftMmu;
    use crate::usercopy::copy_from_user;
    use exokern_abi::memlayout::{USTACKTOP, UTEXT};
    use exokern_abi::{EnvId, PagePerm};

    const UPCALL: u64 = UTEXT + 0x100;

    fn env_with_upcall(k: &mut Kernel<SoftMmu>, xstack: bool) -> EnvId {
        let id = k.env_create(UTEXT).unwrap();
        let space = k.env(id).unwrap().space;
        if xstack {
            gate::alloc(k.mmu_mut(), space, user_page(UXSTACKBOTTOM).unwrap(), PagePerm::USER_RW).unwrap();
        }
        k.env_mut(id).unwrap().pgfault_upcall = Some(VirtAddr::new(UPCALL));
        k.env_run(id);
        id
    }

    fn read_utf(k: &Kernel<SoftMmu>, id: EnvId, at: u64) -> UTrapframe {
        let mut bytes = [0u8; UTrapframe::SIZE];
        copy_from_user(k.mmu(), k.env(id).unwrap().space, &mut bytes, at).unwrap();
        UTrapframe::from_bytes(&bytes)
    }

    fn kernel() -> Kernel<SoftMmu> {
        Kernel::new(SoftMmu::new(64), KernelConfig::default()).unwrap()
    }

    #[test]
    fn test_fault_pushes_record_at_stack_top() {
        let mut k = kernel();
        let id = env_with_upcall(&mut k, true);
        k.env_mut(id).unwrap().tf.rip = 0x80_1234;

        let outcome = k.page_fault(0x40_0010, FaultCode::WRITE | FaultCode::USER);
        let at = UXSTACKTOP - UTrapframe::SIZE as u64;
        assert_eq!(outcome, FaultOutcome::Upcall(VirtAddr::new(at)));

        let utf = read_utf(&k, id, at);
        assert_eq!(utf.fault_va, 0x40_0010);
        assert_eq!(utf.rip, 0x80_1234);
        assert_eq!(utf.rsp, USTACKTOP);
        assert_eq!(utf.err, (FaultCode::WRITE | FaultCode::USER).bits());

        let tf = k.env(id).unwrap().tf;
        assert_eq!((tf.rip, tf.rsp), (UPCALL, at));
    }

    #[test]
    fn test_nested_fault_skips_red_zone() {
        let mut k = kernel();
        let id = env_with_upcall(&mut k, true);
        let FaultOutcome::Upcall(first) = k.page_fault(0x40_0000, FaultCode::WRITE) else {
            panic!("first fault not delivered");
        };
        let second = k.page_fault(0x40_1000, FaultCode::WRITE);
        let expected = first.as_u64() - RED_ZONE - 8 - UTrapframe::SIZE as u64;
        assert_eq!(second, FaultOutcome::Upcall(VirtAddr::new(expected)));
        assert_eq!(read_utf(&k, id, expected).rsp, first.as_u64());
    }

    #[test]
    fn test_fault_without_upcall_destroys() {
        let mut k = kernel();
        let id = k.env_create(UTEXT).unwrap();
        k.env_run(id);
        assert_eq!(k.page_fault(0, FaultCode::USER), FaultOutcome::Destroyed);
        assert!(k.env(id).is_none());
    }

    #[test]
    fn test_fault_without_exception_stack_destroys() {
        let mut k = kernel();
        let id = env_with_upcall(&mut k, false);
        assert_eq!(k.page_fault(0x40_0000, FaultCode::WRITE), FaultOutcome::Destroyed);
        assert!(k.env(id).is_none());
        assert_eq!(k.mmu().frames_in_use(), 0);
    }

    #[test]
    fn test_exception_stack_overflow_destroys() {
        let mut k = kernel();
        let id = env_with_upcall(&mut k, true);
        let mut outcomes = Vec::new();
        for _ in 0..64 {
            let outcome = k.page_fault(0x40_0000, FaultCode::WRITE);
            outcomes.push(outcome);
            if outcome == FaultOutcome::Destroyed {
                break;
            }
        }
        assert_eq!(outcomes.last(), Some(&FaultOutcome::Destroyed));
        assert!(k.env(id).is_none());
    }
}
