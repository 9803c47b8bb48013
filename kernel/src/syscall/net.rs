//! Network syscalls
//!
//! Packets travel as whole pages: TX pins the caller's frame until the ring
//! slot is reused, RX swaps the caller's frame for the filled one.

use exokern_abi::net::MAX_PACKET_LEN;
use exokern_abi::{EnvId, SysError, SysResult};

use super::Reply;
use crate::memory::gate::user_page;
use crate::memory::Mmu;
use crate::Kernel;

impl<M: Mmu> Kernel<M> {
    pub(super) fn sys_net_try_put_tx(&mut self, caller: EnvId, va: u64, len: u64) -> SysResult<Reply> {
        let dev = self.net.as_mut().ok_or(SysError::NoDevice)?;
        if len as usize > MAX_PACKET_LEN {
            return Err(SysError::InvalidArg);
        }
        let space = self.envs.get(caller).ok_or(SysError::BadTarget)?.space;
        let (frame, _) = self.mmu.lookup(space, user_page(va)?).ok_or(SysError::InvalidArg)?;
        let tail = dev.put_tx(&mut self.mmu, frame, len as usize)?;
        Ok(Reply::Value(tail as u64))
    }

    pub(super) fn sys_net_try_read_rx(&mut self, caller: EnvId, va: u64) -> SysResult<Reply> {
        let dev = self.net.as_mut().ok_or(SysError::NoDevice)?;
        let space = self.envs.get(caller).ok_or(SysError::BadTarget)?.space;
        let page = user_page(va)?;
        let (carry, perm) = self.mmu.lookup(space, page).ok_or(SysError::InvalidArg)?;
        if !perm.is_writable() {
            return Err(SysError::InvalidArg);
        }

        let (filled, len) = dev.read_rx(&mut self.mmu, carry)?;
        // The table covering `page` exists, so this cannot run out of memory
        let mapped = self.mmu.map(space, page, filled, perm);
        self.mmu.decref(filled);
        mapped?;
        Ok(Reply::Value(len as u64))
    }

    pub(super) fn sys_net_tx_available(&mut self) -> SysResult<Reply> {
        let dev = self.net.as_ref().ok_or(SysError::NoDevice)?;
        Ok(Reply::Value(u64::from(dev.tx_available())))
    }

    pub(super) fn sys_net_rx_available(&mut self) -> SysResult<Reply> {
        let dev = self.net.as_ref().ok_or(SysError::NoDevice)?;
        Ok(Reply::Value(u64::from(dev.rx_available())))
    }
}
