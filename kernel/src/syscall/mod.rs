//! System call interface
//!
//! x86_64 syscall ABI: rax = number; rdi, rsi, rdx, r10, r8 = arguments.
//! Non-negative results are payload, negative ones are `-SysError`. The
//! result is written into the caller's saved rax, even when the call
//! switched to another environment (`yield`), except for a receive that
//! blocked: its result is written later by the sender.

mod console;
mod env;
mod ipc;
mod memory;
mod net;

use exokern_abi::{EnvId, SysResult, Syscall};

use crate::memory::Mmu;
use crate::Kernel;

/// What the trap layer should do after a syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Caller's rax holds this value
    Return(i64),
    /// Caller is parked in `ipc_recv`
    Blocked,
    /// Caller no longer exists
    Destroyed,
}

/// Handler result before it reaches the caller's registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Value(u64),
    Blocked,
}

const DONE: SysResult<Reply> = Ok(Reply::Value(0));

impl<M: Mmu> Kernel<M> {
    /// Run syscall `num` for the current environment.
    pub fn syscall(&mut self, num: u64, args: [u64; 5]) -> Outcome {
        let Some(caller) = self.curenv else {
            crate::log_error!("[SYSCALL] {} with no current environment", num);
            return Outcome::Destroyed;
        };

        let ret = match self.dispatch(caller, num, args) {
            Ok(Reply::Blocked) => return Outcome::Blocked,
            Ok(Reply::Value(v)) => v as i64,
            Err(e) => {
                if !e.is_transient() {
                    crate::log_debug!("[SYSCALL] env {} call {} -> {}", caller, num, e);
                }
                e.as_i64()
            }
        };

        match self.envs.get_mut(caller) {
            Some(env) => {
                env.tf.regs.rax = ret as u64;
                Outcome::Return(ret)
            }
            None => Outcome::Destroyed,
        }
    }

    fn dispatch(&mut self, caller: EnvId, num: u64, a: [u64; 5]) -> SysResult<Reply> {
        match Syscall::try_from(num)? {
            // ====== Console / clock ======
            Syscall::Cputs => self.sys_cputs(caller, a[0], a[1]),
            Syscall::Cgetc => self.sys_cgetc(),
            Syscall::TimeMsec => self.sys_time_msec(),

            // ====== Environments ======
            Syscall::GetEnvId => Ok(Reply::Value(caller.as_u64())),
            Syscall::EnvDestroy => self.sys_env_destroy(caller, a[0]),
            Syscall::Yield => self.sys_yield(),
            Syscall::Exofork => self.sys_exofork(caller),
            Syscall::EnvSetStatus => self.sys_env_set_status(caller, a[0], a[1]),
            Syscall::EnvSetTrapframe => self.sys_env_set_trapframe(caller, a[0], a[1]),
            Syscall::EnvSetPgfaultUpcall => self.sys_env_set_pgfault_upcall(caller, a[0], a[1]),

            // ====== Memory ======
            Syscall::PageAlloc => self.sys_page_alloc(caller, a[0], a[1], a[2]),
            Syscall::PageMap => self.sys_page_map(caller, a[0], a[1], a[2], a[3], a[4]),
            Syscall::PageUnmap => self.sys_page_unmap(caller, a[0], a[1]),
            Syscall::PageQuery => self.sys_page_query(caller, a[0]),
            Syscall::RegionQuery => self.sys_region_query(caller, a[0]),

            // ====== IPC ======
            Syscall::IpcTrySend => self.sys_ipc_try_send(a[0], a[1], a[2], a[3]),
            Syscall::IpcRecv => self.sys_ipc_recv(a[0]),
            Syscall::IpcField => self.sys_ipc_field(caller, a[0]),

            // ====== Network ======
            Syscall::NetTryPutTx => self.sys_net_try_put_tx(caller, a[0], a[1]),
            Syscall::NetTryReadRx => self.sys_net_try_read_rx(caller, a[0]),
            Syscall::NetTxAvailable => self.sys_net_tx_available(),
            Syscall::NetRxAvailable => self.sys_net_rx_available(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::soft::SoftMmu;
    use exokern_abi::memlayout::UTEXT;
    use exokern_abi::SysError;

    pub(crate) fn kernel(frames: usize) -> Kernel<SoftMmu> {
        Kernel::new(SoftMmu::new(frames), KernelConfig::default()).unwrap()
    }

    /// Create an environment and make it current
    pub(crate) fn running(k: &mut Kernel<SoftMmu>) -> EnvId {
        let id = k.env_create(UTEXT).unwrap();
        k.env_run(id);
        id
    }

    pub(crate) fn call(k: &mut Kernel<SoftMmu>, nr: Syscall, args: &[u64]) -> Outcome {
        let mut a = [0u64; 5];
        a[..args.len()].copy_from_slice(args);
        k.syscall(nr.number(), a)
    }

    #[test]
    fn test_unknown_syscall() {
        let mut k = kernel(16);
        running(&mut k);
        assert_eq!(k.syscall(999, [0; 5]), Outcome::Return(SysError::NoSys.as_i64()));
    }

    #[test]
    fn test_result_lands_in_rax() {
        let mut k = kernel(16);
        let id = running(&mut k);
        assert_eq!(call(&mut k, Syscall::GetEnvId, &[]), Outcome::Return(id.0 as i64));
        assert_eq!(k.env(id).unwrap().tf.regs.rax, id.as_u64());
    }

    #[test]
    fn test_no_current_env() {
        let mut k = kernel(16);
        assert_eq!(call(&mut k, Syscall::GetEnvId, &[]), Outcome::Destroyed);
    }
}
