//! IPC syscalls

use exokern_abi::{EnvId, IpcField, PagePerm, SysError, SysResult, IPC_NO_PAGE};

use super::{Reply, DONE};
use crate::memory::gate::user_page;
use crate::memory::{Mmu, UserPage};
use crate::Kernel;

fn page_arg(va: u64) -> SysResult<Option<UserPage>> {
    if va == IPC_NO_PAGE {
        Ok(None)
    } else {
        user_page(va).map(Some)
    }
}

impl<M: Mmu> Kernel<M> {
    pub(super) fn sys_ipc_try_send(&mut self, to: u64, value: u64, src_va: u64, perm: u64) -> SysResult<Reply> {
        let to = EnvId::from_raw(to)?;
        let page = match page_arg(src_va)? {
            Some(page) => Some((page, PagePerm::from_bits(perm)?)),
            None => None,
        };
        self.ipc_try_send(to, value as u32, page)?;
        DONE
    }

    /// Park the caller. Success is reported later, by the sender.
    pub(super) fn sys_ipc_recv(&mut self, dst_va: u64) -> SysResult<Reply> {
        self.ipc_recv(page_arg(dst_va)?)?;
        Ok(Reply::Blocked)
    }

    pub(super) fn sys_ipc_field(&mut self, caller: EnvId, field: u64) -> SysResult<Reply> {
        let ipc = &self.envs.get(caller).ok_or(SysError::BadTarget)?.ipc;
        let value = match IpcField::try_from(field)? {
            IpcField::From => ipc.from.as_u64(),
            IpcField::Value => u64::from(ipc.value),
            IpcField::Perm => ipc.perm.map_or(0, PagePerm::bits),
        };
        Ok(Reply::Value(value))
    }
}
