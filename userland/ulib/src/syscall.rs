//! Typed system calls
//!
//! Implementors supply the raw trap plus the per-environment fault-handler
//! slot; every wrapper below is built on those. Arguments follow the kernel
//! ABI: ids as `u64`, user addresses as `u64`, `IPC_NO_PAGE` for "no page".

use exokern_abi::error::decode;
use exokern_abi::{EnvId, EnvStatus, IpcField, PagePerm, SysResult, Syscall, IPC_NO_PAGE};

use crate::fork::ForkResult;
use crate::ipc::IpcMessage;
use crate::pgfault::FaultHandler;

pub trait SysCalls: Sized {
    /// Trap into the kernel. Returns the raw result register.
    fn syscall(&self, nr: Syscall, args: [u64; 5]) -> i64;

    /// Handler the upcall trampoline dispatches to
    fn fault_handler(&self) -> Option<FaultHandler<Self>>;

    fn set_fault_handler(&self, handler: FaultHandler<Self>);

    /// User address of the upcall trampoline
    fn upcall_entry(&self) -> u64;

    fn call(&self, nr: Syscall, args: [u64; 5]) -> SysResult<u64> {
        decode(self.syscall(nr, args))
    }

    // ====== Console / clock ======

    /// Print `len` bytes at user address `va`
    fn cputs(&self, va: u64, len: usize) -> SysResult<()> {
        self.call(Syscall::Cputs, [va, len as u64, 0, 0, 0]).map(drop)
    }

    /// Next console byte, `None` when nothing is pending
    fn cgetc(&self) -> Option<u8> {
        match self.call(Syscall::Cgetc, [0; 5]) {
            Ok(0) | Err(_) => None,
            Ok(c) => Some(c as u8),
        }
    }

    fn time_msec(&self) -> u64 {
        self.call(Syscall::TimeMsec, [0; 5]).unwrap_or(0)
    }

    // ====== Environments ======

    fn getenvid(&self) -> EnvId {
        EnvId(self.syscall(Syscall::GetEnvId, [0; 5]) as u32)
    }

    fn env_destroy(&self, id: EnvId) -> SysResult<()> {
        self.call(Syscall::EnvDestroy, [id.as_u64(), 0, 0, 0, 0]).map(drop)
    }

    fn yield_now(&self) {
        self.syscall(Syscall::Yield, [0; 5]);
    }

    /// Create a blank child. Returns twice on bare metal: `Parent` here,
    /// `Child` in the child once it is made runnable.
    fn exofork(&self) -> SysResult<ForkResult> {
        match self.call(Syscall::Exofork, [0; 5])? {
            0 => Ok(ForkResult::Child),
            id => Ok(ForkResult::Parent(EnvId(id as u32))),
        }
    }

    fn env_set_status(&self, id: EnvId, status: EnvStatus) -> SysResult<()> {
        self.call(Syscall::EnvSetStatus, [id.as_u64(), status as u64, 0, 0, 0]).map(drop)
    }

    /// Load `id`'s registers from the trapframe at user address `tf_va`
    fn env_set_trapframe(&self, id: EnvId, tf_va: u64) -> SysResult<()> {
        self.call(Syscall::EnvSetTrapframe, [id.as_u64(), tf_va, 0, 0, 0]).map(drop)
    }

    fn env_set_pgfault_upcall(&self, id: EnvId, entry: u64) -> SysResult<()> {
        self.call(Syscall::EnvSetPgfaultUpcall, [id.as_u64(), entry, 0, 0, 0]).map(drop)
    }

    // ====== Memory ======

    fn page_alloc(&self, id: EnvId, va: u64, perm: PagePerm) -> SysResult<()> {
        self.call(Syscall::PageAlloc, [id.as_u64(), va, perm.bits(), 0, 0]).map(drop)
    }

    fn page_map(&self, src: EnvId, src_va: u64, dst: EnvId, dst_va: u64, perm: PagePerm) -> SysResult<()> {
        self.call(Syscall::PageMap, [src.as_u64(), src_va, dst.as_u64(), dst_va, perm.bits()]).map(drop)
    }

    fn page_unmap(&self, id: EnvId, va: u64) -> SysResult<()> {
        self.call(Syscall::PageUnmap, [id.as_u64(), va, 0, 0, 0]).map(drop)
    }

    /// Permission of this environment's mapping at `va`
    fn page_perm(&self, va: u64) -> Option<PagePerm> {
        match self.call(Syscall::PageQuery, [va, 0, 0, 0, 0]) {
            Ok(0) | Err(_) => None,
            Ok(bits) => PagePerm::from_bits(bits).ok(),
        }
    }

    /// Does the page table covering `va` exist?
    fn table_present(&self, va: u64) -> bool {
        self.call(Syscall::RegionQuery, [va, 0, 0, 0, 0]) == Ok(1)
    }

    // ====== IPC ======

    /// One send attempt; `NotReceiving` means try again later
    fn ipc_try_send(&self, to: EnvId, value: u32, page: Option<(u64, PagePerm)>) -> SysResult<()> {
        let (va, perm) = page.map_or((IPC_NO_PAGE, 0), |(va, perm)| (va, perm.bits()));
        self.call(Syscall::IpcTrySend, [to.as_u64(), u64::from(value), va, perm, 0]).map(drop)
    }

    /// Block until a send completes; a page, if any, lands at `dst`
    fn ipc_recv(&self, dst: Option<u64>) -> SysResult<()> {
        self.call(Syscall::IpcRecv, [dst.unwrap_or(IPC_NO_PAGE), 0, 0, 0, 0]).map(drop)
    }

    /// The last message received
    fn ipc_message(&self) -> IpcMessage {
        let field = |f: IpcField| self.call(Syscall::IpcField, [f as u64, 0, 0, 0, 0]).unwrap_or(0);
        IpcMessage {
            from: EnvId(field(IpcField::From) as u32),
            value: field(IpcField::Value) as u32,
            perm: PagePerm::from_bits(field(IpcField::Perm)).ok(),
        }
    }

    // ====== Network ======

    /// Queue the packet page at `va` holding `len` bytes of data
    fn net_try_put_tx(&self, va: u64, len: usize) -> SysResult<usize> {
        self.call(Syscall::NetTryPutTx, [va, len as u64, 0, 0, 0]).map(|tail| tail as usize)
    }

    /// Trade the page at `va` for a received packet page; returns its length
    fn net_try_read_rx(&self, va: u64) -> SysResult<usize> {
        self.call(Syscall::NetTryReadRx, [va, 0, 0, 0, 0]).map(|len| len as usize)
    }

    fn net_tx_available(&self) -> bool {
        self.call(Syscall::NetTxAvailable, [0; 5]) == Ok(1)
    }

    fn net_rx_available(&self) -> bool {
        self.call(Syscall::NetRxAvailable, [0; 5]) == Ok(1)
    }
}

