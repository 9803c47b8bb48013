//! Hosted machine
//!
//! Runs environments as host threads against an in-process kernel with a
//! software MMU. Exactly one thread executes at a time: the one whose
//! environment is the kernel's `curenv`. Every syscall and every memory
//! access goes through the kernel under one lock, so the kernel sees the same
//! single-CPU world it would on hardware.
//!
//! Page faults follow the real path: the kernel pushes a `UTrapframe` on the
//! environment's exception stack and redirects it to the upcall; the machine
//! then runs the installed Rust handler and "returns" from the upcall by
//! restoring `rip`/`rsp` from the record, as the trampoline would.
//!
//! A forked child cannot resume from the middle of its parent's closure, so
//! the parent registers the child's code with [`HostedEnv::on_fork_child`]
//! before forking.

use std::boxed::Box;
use std::collections::BTreeMap;
use std::format;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::string::String;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::vec::Vec;

use parking_lot::{Condvar, Mutex, MutexGuard};

use exokern_abi::memlayout::{page_round_down, PAGE_SIZE, UTEXT};
use exokern_abi::{EnvId, FaultCode, SysResult, Syscall, UTrapframe};
use exokern_kernel::config::KernelConfig;
use exokern_kernel::memory::gate::user_page;
use exokern_kernel::memory::soft::SoftMmu;
use exokern_kernel::memory::{Mmu, Space};
use exokern_kernel::syscall::Outcome;
use exokern_kernel::trap::FaultOutcome;
use exokern_kernel::usercopy::{copy_from_user, copy_to_user, UserCopyError};
use exokern_kernel::Kernel;

use crate::memory::UserMemory;
use crate::pgfault::{FaultError, FaultHandler};
use crate::syscall::SysCalls;

/// Where hosted environments claim their upcall trampoline lives
pub const HOSTED_UPCALL: u64 = UTEXT;

type Body = Box<dyn FnOnce(&HostedEnv) + Send + 'static>;

/// Unwind payload of a thread whose environment no longer exists
struct EnvGone;

struct World {
    kernel: Kernel<SoftMmu>,
    /// Per-environment handler slot; a child inherits its parent's
    handlers: BTreeMap<EnvId, FaultHandler<HostedEnv>>,
    /// Code for the next child each environment forks
    fork_bodies: BTreeMap<EnvId, Body>,
    fatal_faults: Vec<(EnvId, FaultError)>,
    failures: Vec<String>,
    threads: Vec<JoinHandle<()>>,
    shutdown: bool,
}

struct Shared {
    world: Mutex<World>,
    /// Signalled whenever `curenv` may have changed
    turn: Condvar,
}

pub struct Machine {
    shared: Arc<Shared>,
}

impl Machine {
    pub fn new(frames: usize) -> SysResult<Self> {
        Self::with_config(frames, KernelConfig::default())
    }

    pub fn with_config(frames: usize, config: KernelConfig) -> SysResult<Self> {
        let kernel = Kernel::new(SoftMmu::new(frames), config)?;
        let world = World {
            kernel,
            handlers: BTreeMap::new(),
            fork_bodies: BTreeMap::new(),
            fatal_faults: Vec::new(),
            failures: Vec::new(),
            threads: Vec::new(),
            shutdown: false,
        };
        Ok(Self {
            shared: Arc::new(Shared { world: Mutex::new(world), turn: Condvar::new() }),
        })
    }

    /// Create a runnable environment executing `body`.
    pub fn spawn<F>(&self, body: F) -> SysResult<EnvId>
    where
        F: FnOnce(&HostedEnv) + Send + 'static,
    {
        let mut w = self.shared.world.lock();
        let id = w.kernel.env_create(UTEXT)?;
        let thread = start(&self.shared, id, Box::new(body));
        w.threads.push(thread);
        Ok(id)
    }

    /// Schedule environments until none is runnable.
    ///
    /// Returns the panics raised by environment code, if any.
    pub fn run(&self) -> Result<(), Vec<String>> {
        let mut w = self.shared.world.lock();
        if w.kernel.curenv().is_none() {
            w.kernel.sched_yield();
        }
        self.shared.turn.notify_all();
        while w.kernel.curenv().is_some() {
            self.shared.turn.wait(&mut w);
        }

        let failures = mem::take(&mut w.failures);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    /// Inspect or drive the kernel while no environment is running
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel<SoftMmu>) -> R) -> R {
        f(&mut self.shared.world.lock().kernel)
    }

    pub fn frames_in_use(&self) -> usize {
        self.with_kernel(|k| k.mmu().frames_in_use())
    }

    pub fn live_envs(&self) -> usize {
        self.with_kernel(|k| k.envs().len())
    }

    /// Faults that ended an environment, in order
    pub fn fatal_faults(&self) -> Vec<(EnvId, FaultError)> {
        self.shared.world.lock().fatal_faults.clone()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        loop {
            let threads = {
                let mut w = self.shared.world.lock();
                w.shutdown = true;
                mem::take(&mut w.threads)
            };
            if threads.is_empty() {
                break;
            }
            self.shared.turn.notify_all();
            for thread in threads {
                let _ = thread.join();
            }
        }
    }
}

fn start(shared: &Arc<Shared>, id: EnvId, body: Body) -> JoinHandle<()> {
    let env = HostedEnv { id, shared: Arc::clone(shared) };
    thread::spawn(move || env.main(body))
}

fn describe(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic")
    }
}

/// First page in `[va, va+len)` the access would fault on
fn first_fault(kernel: &Kernel<SoftMmu>, space: Space, va: u64, len: usize, write: bool) -> Option<(u64, FaultCode)> {
    if len == 0 {
        return None;
    }
    let mut code = FaultCode::USER;
    if write {
        code |= FaultCode::WRITE;
    }
    let Some(end) = va.checked_add(len as u64) else {
        return Some((va, code));
    };

    let mut page = page_round_down(va);
    while page < end {
        let at = page.max(va);
        match user_page(page).ok().and_then(|p| kernel.mmu().lookup(space, p)) {
            None => return Some((at, code)),
            Some((_, perm)) if write && !perm.is_writable() => {
                return Some((at, code | FaultCode::PROTECTION));
            }
            Some(_) => {}
        }
        page += PAGE_SIZE;
    }
    None
}

/// An environment, as seen from its own thread
#[derive(Clone)]
pub struct HostedEnv {
    id: EnvId,
    shared: Arc<Shared>,
}

impl HostedEnv {
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Code the next child forked by this environment runs.
    ///
    /// A child forked without one exits as soon as it is scheduled.
    pub fn on_fork_child<F>(&self, body: F)
    where
        F: FnOnce(&HostedEnv) + Send + 'static,
    {
        self.lock_running().fork_bodies.insert(self.id, Box::new(body));
    }

    /// End this environment
    pub fn exit(&self) -> ! {
        let mut w = self.lock_running();
        w.kernel.env_destroy(self.id);
        self.vanish(w)
    }

    fn main(self, body: Body) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            drop(self.lock_running());
            body(&self);
            self.exit()
        }));
        let Err(payload) = result else { return };
        if payload.is::<EnvGone>() {
            return;
        }

        let mut w = self.shared.world.lock();
        w.failures.push(format!("env {}: {}", self.id, describe(&*payload)));
        if w.kernel.env(self.id).is_some() {
            w.kernel.env_destroy(self.id);
        }
        drop(w);
        self.shared.turn.notify_all();
    }

    /// Leave the thread; the environment is gone or the machine is stopping.
    fn vanish(&self, w: MutexGuard<'_, World>) -> ! {
        drop(w);
        self.shared.turn.notify_all();
        panic::resume_unwind(Box::new(EnvGone))
    }

    /// Block until this environment is the running one
    fn wait_turn<'a>(&'a self, mut w: MutexGuard<'a, World>) -> MutexGuard<'a, World> {
        loop {
            if w.shutdown || w.kernel.env(self.id).is_none() {
                self.vanish(w);
            }
            if w.kernel.curenv() == Some(self.id) {
                return w;
            }
            self.shared.turn.wait(&mut w);
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, World> {
        self.wait_turn(self.shared.world.lock())
    }

    /// Hand the CPU on if the kernel switched away from us, and wait to get
    /// it back.
    fn reschedule<'a>(&'a self, w: MutexGuard<'a, World>) -> MutexGuard<'a, World> {
        if w.kernel.curenv() != Some(self.id) {
            self.shared.turn.notify_all();
        }
        self.wait_turn(w)
    }

    fn space(&self, w: &World) -> Option<Space> {
        w.kernel.env(self.id).map(|env| env.space)
    }

    fn die<'a>(&'a self, mut w: MutexGuard<'a, World>, why: FaultError) -> ! {
        exokern_kernel::log_warn!("[HOSTED] env {} killed: {}", self.id, why);
        w.fatal_faults.push((self.id, why));
        w.kernel.env_destroy(self.id);
        self.vanish(w)
    }

    /// Deliver a fault through the kernel and run the handler it selects.
    fn take_fault(&self, mut w: MutexGuard<'_, World>, fault_va: u64, code: FaultCode) {
        if w.kernel.page_fault(fault_va, code) == FaultOutcome::Destroyed {
            self.vanish(w);
        }

        let Some((space, frame_at)) = w.kernel.env(self.id).map(|env| (env.space, env.tf.rsp)) else {
            self.vanish(w)
        };
        let mut raw = [0u8; UTrapframe::SIZE];
        if copy_from_user(w.kernel.mmu(), space, &mut raw, frame_at).is_err() {
            self.die(w, FaultError::NotMapped(frame_at));
        }
        let utf = UTrapframe::from_bytes(&raw);

        let Some(handler) = w.handlers.get(&self.id).copied() else {
            self.die(w, FaultError::NotMapped(fault_va));
        };
        drop(w);

        let result = handler(self, &utf);

        let mut w = self.lock_running();
        if let Err(why) = result {
            self.die(w, why);
        }
        if let Some(env) = w.kernel.env_mut(self.id) {
            env.tf.rip = utf.rip;
            env.tf.rflags = utf.rflags;
            env.tf.rsp = utf.rsp;
        }
    }

    /// Run `op` once every page of the range is accessible, faulting pages
    /// in first.
    fn access<F>(&self, va: u64, len: usize, write: bool, mut op: F)
    where
        F: FnMut(&Kernel<SoftMmu>, Space) -> Result<(), UserCopyError>,
    {
        loop {
            let w = self.lock_running();
            let Some(space) = self.space(&w) else { self.vanish(w) };

            match first_fault(&w.kernel, space, va, len, write) {
                Some((fault_va, code)) => self.take_fault(w, fault_va, code),
                None => {
                    if op(&w.kernel, space).is_err() {
                        self.die(w, FaultError::NotMapped(va));
                    }
                    return;
                }
            }
        }
    }

    fn adopt(&self, w: &mut World, child: EnvId) {
        let body = w
            .fork_bodies
            .remove(&self.id)
            .unwrap_or_else(|| -> Body { Box::new(|_: &HostedEnv| {}) });
        if let Some(handler) = w.handlers.get(&self.id).copied() {
            w.handlers.insert(child, handler);
        }
        let thread = start(&self.shared, child, body);
        w.threads.push(thread);
    }
}

impl SysCalls for HostedEnv {
    fn syscall(&self, nr: Syscall, args: [u64; 5]) -> i64 {
        let mut w = self.lock_running();
        let outcome = w.kernel.syscall(nr.number(), args);

        match outcome {
            Outcome::Return(ret) => {
                if nr == Syscall::Exofork && ret > 0 {
                    self.adopt(&mut w, EnvId(ret as u32));
                }
                drop(self.reschedule(w));
                ret
            }
            Outcome::Blocked => {
                let w = self.reschedule(w);
                // Written by whoever completed the receive
                w.kernel.env(self.id).map_or(0, |env| env.tf.regs.rax as i64)
            }
            Outcome::Destroyed => self.vanish(w),
        }
    }

    fn fault_handler(&self) -> Option<FaultHandler<Self>> {
        self.lock_running().handlers.get(&self.id).copied()
    }

    fn set_fault_handler(&self, handler: FaultHandler<Self>) {
        self.lock_running().handlers.insert(self.id, handler);
    }

    fn upcall_entry(&self) -> u64 {
        HOSTED_UPCALL
    }
}

impl UserMemory for HostedEnv {
    fn read(&self, va: u64, buf: &mut [u8]) {
        let len = buf.len();
        self.access(va, len, false, |k, space| copy_from_user(k.mmu(), space, buf, va));
    }

    fn write(&self, va: u64, bytes: &[u8]) {
        self.access(va, bytes.len(), true, |k, space| copy_to_user(k.mmu(), space, va, bytes));
    }

    fn copy(&self, dst: u64, src: u64, len: usize) {
        let mut buf = std::vec![0u8; len];
        self.read(src, &mut buf);
        self.write(dst, &buf);
    }
}
