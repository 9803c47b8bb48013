//! Console and clock syscalls

use alloc::vec;

use exokern_abi::{EnvId, SysError, SysResult};

use super::Reply;
use crate::memory::Mmu;
use crate::usercopy::UserSlice;
use crate::Kernel;

impl<M: Mmu> Kernel<M> {
    /// Print `len` bytes at `buf`. A buffer the caller cannot read kills it.
    pub(super) fn sys_cputs(&mut self, caller: EnvId, buf: u64, len: u64) -> SysResult<Reply> {
        let space = self.envs.get(caller).ok_or(SysError::BadTarget)?.space;
        let slice = match UserSlice::ro(&self.mmu, space, buf, len as usize) {
            Ok(slice) => slice,
            Err(e) => {
                crate::log_warn!("[SYSCALL] env {} cputs {:#x}+{}: {:?}", caller, buf, len, e);
                self.env_destroy(caller);
                return Err(e.into());
            }
        };

        let mut bytes = vec![0u8; slice.len()];
        slice.read_to(&self.mmu, &mut bytes)?;
        self.console.write(&bytes);
        Ok(Reply::Value(0))
    }

    pub(super) fn sys_cgetc(&mut self) -> SysResult<Reply> {
        Ok(Reply::Value(self.console.getc().map_or(0, u64::from)))
    }

    pub(super) fn sys_time_msec(&mut self) -> SysResult<Reply> {
        Ok(Reply::Value(self.clock.msec()))
    }
}
