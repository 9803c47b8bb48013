//! Kernel instance
//!
//! One `Kernel` owns everything the core mutates: the MMU, the environment
//! table, the attached NIC and the console. The trap layer threads it
//! through syscalls, faults and timer ticks.

use exokern_abi::memlayout::{PAGE_SIZE, USTACKTOP};
use exokern_abi::{EnvId, EnvStatus, PagePerm, SysError, SysResult, Trapframe};

use crate::config::{KernelConfig, NicConfig};
use crate::console::Console;
use crate::drivers::net::e1000::Registers;
use crate::drivers::net::NetDevice;
use crate::env::{Env, EnvTable};
use crate::memory::{gate, Mmu};
use crate::time::Clock;

pub struct Kernel<M: Mmu> {
    pub(crate) mmu: M,
    pub(crate) envs: EnvTable,
    pub(crate) curenv: Option<EnvId>,
    pub(crate) net: Option<NetDevice>,
    pub(crate) console: Console,
    pub(crate) clock: Clock,
    config: KernelConfig,
}

impl<M: Mmu> Kernel<M> {
    pub fn new(mmu: M, config: KernelConfig) -> SysResult<Self> {
        config.validate()?;
        crate::logger::set_level(config.log_level);
        Ok(Self {
            mmu,
            envs: EnvTable::new(config.max_envs),
            curenv: None,
            net: None,
            console: Console::new(),
            clock: Clock::new(config.tick_ms),
            config,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id)
    }

    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(id)
    }

    /// The running environment
    pub fn curenv(&self) -> Option<EnvId> {
        self.curenv
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn net(&self) -> Option<&NetDevice> {
        self.net.as_ref()
    }

    /// Bring up the e1000 behind `regs`
    pub fn attach_nic(&mut self, regs: Registers, config: NicConfig) -> SysResult<()> {
        let dev = NetDevice::attach(&mut self.mmu, regs, &config)?;
        self.net = Some(dev);
        Ok(())
    }

    /// New NOT_RUNNABLE environment with an empty address space
    pub fn env_alloc(&mut self, parent: EnvId, tf: Trapframe) -> SysResult<EnvId> {
        let space = self.mmu.create_space()?;
        match self.envs.alloc(parent, space, tf) {
            Ok(id) => {
                crate::log_debug!("[ENV] new env {} (parent {})", id, parent);
                Ok(id)
            }
            Err(e) => {
                self.mmu.destroy_space(space);
                Err(e)
            }
        }
    }

    /// New RUNNABLE environment entering at `entry` with one stack page
    pub fn env_create(&mut self, entry: u64) -> SysResult<EnvId> {
        let id = self.env_alloc(EnvId::SELF, Trapframe::user(entry, USTACKTOP))?;
        let space = self.envs.get(id).map(|env| env.space).ok_or(SysError::BadTarget)?;
        let stack = gate::user_page(USTACKTOP - PAGE_SIZE)?;
        if let Err(e) = gate::alloc(&mut self.mmu, space, stack, PagePerm::USER_RW) {
            self.env_free(id);
            return Err(e);
        }
        if let Some(env) = self.envs.get_mut(id) {
            env.status = EnvStatus::Runnable;
        }
        crate::log!("[ENV] created env {} entry {:#x}", id, entry);
        Ok(id)
    }

    /// Release the environment's slot and address space
    pub fn env_free(&mut self, id: EnvId) {
        if let Some(env) = self.envs.free(id) {
            self.mmu.destroy_space(env.space);
            crate::log_debug!("[ENV] free env {}", id);
        }
    }

    /// Free `id`; if it was running, pick something else to run
    pub fn env_destroy(&mut self, id: EnvId) {
        self.env_free(id);
        if self.curenv == Some(id) {
            self.curenv = None;
            self.sched_yield();
        }
    }

    /// Timer interrupt: advance the clock and preempt
    pub fn timer_interrupt(&mut self) {
        self.clock.tick();
        self.sched_yield();
    }
}
