//! Round-robin scheduler
//!
//! Single CPU, cooperative plus timer preemption. `sched_yield` only picks
//! the next environment; restoring its registers is the trap layer's job.

use exokern_abi::{EnvId, EnvStatus};

use crate::memory::Mmu;
use crate::Kernel;

impl<M: Mmu> Kernel<M> {
    /// Run the next RUNNABLE environment after the current one, else keep
    /// the current one if it is still RUNNING, else go idle.
    pub fn sched_yield(&mut self) {
        let capacity = self.envs.capacity();
        let start = self.curenv.map_or(0, |id| id.index() + 1);

        let next = (0..capacity)
            .map(|i| (start + i) % capacity)
            .filter_map(|index| self.envs.slot(index))
            .find(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id);

        if let Some(id) = next {
            self.env_run(id);
            return;
        }

        let current = self
            .curenv
            .and_then(|id| self.envs.get(id))
            .filter(|env| env.status == EnvStatus::Running)
            .map(|env| env.id);
        match current {
            Some(id) => self.env_run(id),
            None => {
                self.curenv = None;
                crate::log_trace!("[SCHED] idle");
            }
        }
    }

    /// Make `id` the running environment
    pub fn env_run(&mut self, id: EnvId) {
        if let Some(prev) = self.curenv.filter(|prev| *prev != id) {
            if let Some(env) = self.envs.get_mut(prev) {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }
        if let Some(env) = self.envs.get_mut(id) {
            env.status = EnvStatus::Running;
            env.runs += 1;
            self.curenv = Some(id);
        }
    }
}
