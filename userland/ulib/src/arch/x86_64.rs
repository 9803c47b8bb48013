//! x86_64 system calls and the page-fault upcall trampoline
//!
//! Register convention for `syscall`:
//! - RAX = syscall number
//! - RDI, RSI, RDX, R10, R8 = arguments
//! - RAX = return value (negative `SysError` code on failure)

use core::arch::{asm, global_asm};
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use exokern_abi::{EnvId, Syscall, UTrapframe};

use crate::memory::UserMemory;
use crate::pgfault::FaultHandler;
use crate::syscall::SysCalls;

/// The running environment, trapping straight into the kernel
#[derive(Debug, Clone, Copy)]
pub struct RawSyscalls;

pub static SYS: RawSyscalls = RawSyscalls;

/// Installed `FaultHandler<RawSyscalls>`, 0 when none
static HANDLER: AtomicUsize = AtomicUsize::new(0);

impl SysCalls for RawSyscalls {
    #[inline(always)]
    fn syscall(&self, nr: Syscall, args: [u64; 5]) -> i64 {
        let ret: i64;
        // SAFETY: the kernel only reads the argument registers and clobbers
        // rcx/r11 on the way back
        unsafe {
            asm!(
                "syscall",
                in("rax") nr.number(),
                in("rdi") args[0],
                in("rsi") args[1],
                in("rdx") args[2],
                in("r10") args[3],
                in("r8") args[4],
                lateout("rax") ret,
                out("rcx") _,
                out("r11") _,
                options(nostack)
            );
        }
        ret
    }

    fn fault_handler(&self) -> Option<FaultHandler<Self>> {
        match HANDLER.load(Ordering::Acquire) {
            0 => None,
            // SAFETY: only ever stored from a `FaultHandler<Self>`
            raw => Some(unsafe { mem::transmute::<usize, FaultHandler<Self>>(raw) }),
        }
    }

    fn set_fault_handler(&self, handler: FaultHandler<Self>) {
        HANDLER.store(handler as usize, Ordering::Release);
    }

    fn upcall_entry(&self) -> u64 {
        extern "C" {
            fn _pgfault_upcall();
        }
        _pgfault_upcall as usize as u64
    }
}

impl UserMemory for RawSyscalls {
    fn read(&self, va: u64, buf: &mut [u8]) {
        // SAFETY: a bad address faults into the kernel, which either
        // resolves it or ends the environment
        unsafe { ptr::copy_nonoverlapping(va as *const u8, buf.as_mut_ptr(), buf.len()) }
    }

    fn write(&self, va: u64, bytes: &[u8]) {
        // SAFETY: as for `read`
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), va as *mut u8, bytes.len()) }
    }

    fn copy(&self, dst: u64, src: u64, len: usize) {
        // SAFETY: as for `read`
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) }
    }
}

extern "C" fn dispatch(utf: &UTrapframe) {
    let outcome = match SYS.fault_handler() {
        Some(handler) => handler(&SYS, utf),
        None => Err(crate::pgfault::FaultError::NotMapped(utf.fault_va)),
    };
    if outcome.is_err() {
        let _ = SYS.env_destroy(EnvId::SELF);
        loop {
            SYS.yield_now();
        }
    }
}

// Entered with rsp at the UTrapframe the kernel pushed. The interrupted
// rip is stored below the interrupted stack's red zone so a single `ret`
// resumes it with rsp back where it was.
global_asm!(
    ".global _pgfault_upcall",
    "_pgfault_upcall:",
    "mov rbp, rsp",
    "mov rdi, rsp",
    "and rsp, -16",
    "call {dispatch}",
    "mov rsp, rbp",
    "mov rax, [rsp + {rip}]",
    "mov rbx, [rsp + {rsp_slot}]",
    "sub rbx, {red_zone} + 8",
    "mov [rbx], rax",
    "mov [rsp + {rsp_slot}], rbx",
    "add rsp, {regs}",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rsi",
    "pop rdi",
    "pop rbp",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "add rsp, 8",
    "popfq",
    "pop rsp",
    "ret {red_zone}",
    dispatch = sym dispatch,
    rip = const UTrapframe::RIP_OFFSET,
    rsp_slot = const UTrapframe::RSP_OFFSET,
    regs = const UTrapframe::REGS_OFFSET,
    red_zone = const exokern_abi::memlayout::RED_ZONE,
);
