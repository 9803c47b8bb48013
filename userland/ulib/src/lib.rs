//! exokern user library
//!
//! What every environment links against: typed syscall wrappers, the
//! copy-on-write fork protocol and its page-fault handler, and IPC helpers
//! that turn the kernel's try-send into a retry loop.
//!
//! Everything is written against two traits, [`SysCalls`] and
//! [`UserMemory`]. On bare metal they trap into the kernel and touch memory
//! directly (`arch`); with the `hosted` feature a [`hosted::Machine`] runs
//! each environment on a host thread against an in-process kernel.

#![no_std]

#[cfg(feature = "hosted")]
extern crate std;

pub mod fork;
pub mod ipc;
pub mod memory;
pub mod pgfault;
pub mod syscall;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;

#[cfg(feature = "hosted")]
pub mod hosted;

pub use exokern_abi as abi;
pub use fork::{fork, ForkResult};
pub use ipc::IpcMessage;
pub use memory::UserMemory;
pub use pgfault::{cow_fault, set_pgfault_handler, FaultError, FaultHandler, HandlerInstalled};
pub use syscall::SysCalls;
