//! Rendezvous IPC
//!
//! A send only succeeds against a receiver that is already blocked in
//! `ipc_recv`. The receiver's `recving` flag is cleared by exactly one
//! successful send, so racing senders see all but one `NotReceiving`.
//! An optional page moves with the value through the permission gate.

use exokern_abi::{EnvId, EnvStatus, PagePerm, SysError, SysResult};

use crate::memory::{gate, Mmu, UserPage};
use crate::Kernel;

impl<M: Mmu> Kernel<M> {
    /// Deliver `value` (and `page`, if both sides want one) to `to`.
    ///
    /// Nothing about the target changes unless the whole send succeeds.
    pub fn ipc_try_send(
        &mut self,
        to: EnvId,
        value: u32,
        page: Option<(UserPage, PagePerm)>,
    ) -> SysResult<()> {
        let sender = self.curenv.ok_or(SysError::BadTarget)?;
        let sender_space = self.envs.get(sender).ok_or(SysError::BadTarget)?.space;

        if let Some((src, perm)) = page {
            let (_, held) = self.mmu.lookup(sender_space, src).ok_or(SysError::InvalidArg)?;
            if !held.permits(perm) {
                return Err(SysError::InvalidArg);
            }
        }

        let target = self.envs.resolve(sender, to, false)?;
        let env = self.envs.get(target).ok_or(SysError::BadTarget)?;
        if !env.ipc.recving {
            return Err(SysError::NotReceiving);
        }
        let (target_space, dst) = (env.space, env.ipc.dst);

        let moved = match (page, dst) {
            (Some((src, perm)), Some(dst)) => {
                gate::map(&mut self.mmu, sender_space, src, target_space, dst, perm)?;
                Some(perm)
            }
            _ => None,
        };

        let env = self.envs.get_mut(target).ok_or(SysError::BadTarget)?;
        env.ipc.recving = false;
        env.ipc.from = sender;
        env.ipc.value = value;
        env.ipc.perm = moved;
        env.status = EnvStatus::Runnable;
        env.tf.regs.rax = 0;
        crate::log_trace!("[IPC] {} -> {} value {:#x} page {}", sender, target, value, moved.is_some());
        Ok(())
    }

    /// Block the current environment until a send completes.
    ///
    /// The receive's eventual `0` is written by the sender; this only parks
    /// the caller and yields.
    pub fn ipc_recv(&mut self, dst: Option<UserPage>) -> SysResult<()> {
        let id = self.curenv.ok_or(SysError::BadTarget)?;
        let env = self.envs.get_mut(id).ok_or(SysError::BadTarget)?;
        env.ipc.recving = true;
        env.ipc.dst = dst;
        env.status = EnvStatus::NotRunnable;
        self.sched_yield();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::KernelConfig;
    use crate::memory::gate::{self, user_page};
    use crate::memory::soft::SoftMmu;
    use crate::memory::Mmu;
    use crate::Kernel;
    use exokern_abi::memlayout::UTEXT;
    use exokern_abi::{EnvId, EnvStatus, PagePerm, SysError};

    const SRC: u64 = 0x40_0000;
    const DST: u64 = 0x1000_0000;

    fn kernel(frames: usize) -> Kernel<SoftMmu> {
        Kernel::new(SoftMmu::new(frames), KernelConfig::default()).unwrap()
    }

    fn block_in_recv(k: &mut Kernel<SoftMmu>, id: EnvId, dst: Option<u64>) {
        k.env_run(id);
        k.ipc_recv(dst.map(|va| user_page(va).unwrap())).unwrap();
    }

    #[test]
    fn test_value_delivered_to_blocked_receiver() {
        let mut k = kernel(64);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();

        block_in_recv(&mut k, b, None);
        assert_eq!(k.curenv(), Some(a));
        assert_eq!(k.env(b).unwrap().status, EnvStatus::NotRunnable);

        k.ipc_try_send(b, 42, None).unwrap();
        let env = k.env(b).unwrap();
        assert_eq!(env.status, EnvStatus::Runnable);
        assert!(!env.ipc.recving);
        assert_eq!((env.ipc.from, env.ipc.value, env.ipc.perm), (a, 42, None));
        assert_eq!(env.tf.regs.rax, 0);
    }

    #[test]
    fn test_send_to_non_receiver() {
        let mut k = kernel(64);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();
        k.env_run(a);
        assert_eq!(k.ipc_try_send(b, 1, None), Err(SysError::NotReceiving));
        assert_eq!(k.ipc_try_send(EnvId(0x7fe), 1, None), Err(SysError::BadTarget));
    }

    #[test]
    fn test_only_one_sender_wins() {
        let mut k = kernel(64);
        let receiver = k.env_create(UTEXT).unwrap();
        let senders: Vec<_> = (0..4).map(|_| k.env_create(UTEXT).unwrap()).collect();
        block_in_recv(&mut k, receiver, None);

        let results: Vec<_> = senders
            .iter()
            .enumerate()
            .map(|(i, s)| {
                k.env_run(*s);
                k.ipc_try_send(receiver, 100 + i as u32, None)
            })
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results[1..].iter().all(|r| *r == Err(SysError::NotReceiving)));
        let env = k.env(receiver).unwrap();
        assert_eq!((env.ipc.from, env.ipc.value), (senders[0], 100));
    }

    #[test]
    fn test_page_transfer_aliases_frame() {
        let mut k = kernel(64);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();
        let a_space = k.env(a).unwrap().space;
        gate::alloc(k.mmu_mut(), a_space, user_page(SRC).unwrap(), PagePerm::USER_RW).unwrap();

        block_in_recv(&mut k, b, Some(DST));
        k.ipc_try_send(b, 7, Some((user_page(SRC).unwrap(), PagePerm::USER_RO))).unwrap();

        let b_space = k.env(b).unwrap().space;
        let (fa, _) = k.mmu().lookup(a_space, user_page(SRC).unwrap()).unwrap();
        let (fb, pb) = k.mmu().lookup(b_space, user_page(DST).unwrap()).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(pb, PagePerm::USER_RO);
        assert_eq!(k.env(b).unwrap().ipc.perm, Some(PagePerm::USER_RO));
    }

    #[test]
    fn test_no_page_when_receiver_declines() {
        let mut k = kernel(64);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();
        let a_space = k.env(a).unwrap().space;
        gate::alloc(k.mmu_mut(), a_space, user_page(SRC).unwrap(), PagePerm::USER_RW).unwrap();

        block_in_recv(&mut k, b, None);
        k.ipc_try_send(b, 7, Some((user_page(SRC).unwrap(), PagePerm::USER_RW))).unwrap();
        assert_eq!(k.env(b).unwrap().ipc.perm, None);
    }

    #[test]
    fn test_send_rejects_write_upgrade_and_missing_page() {
        let mut k = kernel(64);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();
        let a_space = k.env(a).unwrap().space;
        gate::alloc(k.mmu_mut(), a_space, user_page(SRC).unwrap(), PagePerm::USER_RO).unwrap();

        block_in_recv(&mut k, b, Some(DST));
        let src = user_page(SRC).unwrap();
        assert_eq!(k.ipc_try_send(b, 1, Some((src, PagePerm::USER_RW))), Err(SysError::InvalidArg));
        let absent = user_page(SRC + 0x1000).unwrap();
        assert_eq!(k.ipc_try_send(b, 1, Some((absent, PagePerm::USER_RO))), Err(SysError::InvalidArg));
        assert!(k.env(b).unwrap().ipc.recving);
    }

    #[test]
    fn test_failed_transfer_leaves_receiver_blocked() {
        // a: root + table + stack, b: same, a's source page: table + page
        let mut k = kernel(8);
        let a = k.env_create(UTEXT).unwrap();
        let b = k.env_create(UTEXT).unwrap();
        let a_space = k.env(a).unwrap().space;
        gate::alloc(k.mmu_mut(), a_space, user_page(SRC).unwrap(), PagePerm::USER_RW).unwrap();
        assert_eq!(k.mmu().frames_in_use(), 8);

        block_in_recv(&mut k, b, Some(DST));
        let sent = k.ipc_try_send(b, 9, Some((user_page(SRC).unwrap(), PagePerm::USER_RW)));
        assert_eq!(sent, Err(SysError::NoMem));

        let env = k.env(b).unwrap();
        assert!(env.ipc.recving);
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.ipc.value, 0);
    }
}
