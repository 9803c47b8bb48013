//! Shared kernel/user ABI
//!
//! Everything both sides of the syscall boundary must agree on: environment
//! ids, the page-permission bitset, error codes, syscall numbers, the user
//! memory layout and the trap records pushed by the kernel.

#![no_std]

pub mod env;
pub mod error;
pub mod memlayout;
pub mod net;
pub mod perm;
pub mod syscall;
pub mod trapframe;

pub use env::{EnvId, EnvStatus};
pub use error::{SysError, SysResult};
pub use perm::{FaultCode, PagePerm, PteFlags};
pub use syscall::{IpcField, Syscall, IPC_NO_PAGE};
pub use trapframe::{PushRegs, Trapframe, UTrapframe};
