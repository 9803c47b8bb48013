//! Environment syscalls

use x86_64::VirtAddr;

use exokern_abi::memlayout::UTOP;
use exokern_abi::{EnvId, EnvStatus, SysError, SysResult, Trapframe};

use super::{Reply, DONE};
use crate::memory::Mmu;
use crate::usercopy::copy_from_user;
use crate::Kernel;

impl<M: Mmu> Kernel<M> {
    pub(super) fn sys_env_destroy(&mut self, caller: EnvId, id: u64) -> SysResult<Reply> {
        let target = self.envs.resolve(caller, EnvId::from_raw(id)?, true)?;
        if target == caller {
            crate::log!("[ENV] {} exiting", caller);
        } else {
            crate::log!("[ENV] {} destroying {}", caller, target);
        }
        self.env_destroy(target);
        DONE
    }

    pub(super) fn sys_yield(&mut self) -> SysResult<Reply> {
        self.sched_yield();
        DONE
    }

    /// Blank child: caller's registers, caller's id as parent, empty address
    /// space. The child sees 0 from this call once it runs.
    pub(super) fn sys_exofork(&mut self, caller: EnvId) -> SysResult<Reply> {
        let mut tf = self.envs.get(caller).ok_or(SysError::BadTarget)?.tf;
        tf.regs.rax = 0;
        let child = self.env_alloc(caller, tf)?;
        Ok(Reply::Value(child.as_u64()))
    }

    pub(super) fn sys_env_set_status(&mut self, caller: EnvId, id: u64, status: u64) -> SysResult<Reply> {
        let status = EnvStatus::try_from(status)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::InvalidArg);
        }
        let target = self.envs.resolve(caller, EnvId::from_raw(id)?, true)?;
        let env = self.envs.get_mut(target).ok_or(SysError::BadTarget)?;
        if env.status == EnvStatus::Running || env.ipc.recving {
            return Err(SysError::BadTarget);
        }
        env.status = status;
        DONE
    }

    /// Replace `id`'s registers with the frame at `tf_va` in the caller.
    pub(super) fn sys_env_set_trapframe(&mut self, caller: EnvId, id: u64, tf_va: u64) -> SysResult<Reply> {
        let target = self.envs.resolve(caller, EnvId::from_raw(id)?, true)?;
        let space = self.envs.get(caller).ok_or(SysError::BadTarget)?.space;

        let mut raw = [0u8; Trapframe::SIZE];
        if let Err(e) = copy_from_user(&self.mmu, space, &mut raw, tf_va) {
            crate::log_warn!("[SYSCALL] env {} set_trapframe {:#x}: {:?}", caller, tf_va, e);
            self.env_destroy(caller);
            return Err(e.into());
        }

        let mut tf = Trapframe::from_bytes(&raw);
        tf.sanitize();
        self.envs.get_mut(target).ok_or(SysError::BadTarget)?.tf = tf;
        DONE
    }

    pub(super) fn sys_env_set_pgfault_upcall(&mut self, caller: EnvId, id: u64, entry: u64) -> SysResult<Reply> {
        if entry >= UTOP {
            return Err(SysError::InvalidArg);
        }
        let target = self.envs.resolve(caller, EnvId::from_raw(id)?, true)?;
        let env = self.envs.get_mut(target).ok_or(SysError::BadTarget)?;
        env.pgfault_upcall = Some(VirtAddr::new(entry));
        DONE
    }
}
