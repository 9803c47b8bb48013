//! exokern kernel core
//!
//! The resource-sharing substrate of a small exokernel: the page-permission
//! gate, environments and their scheduler glue, rendezvous IPC, page-fault
//! upcalls, the syscall dispatcher and the e1000 descriptor rings.
//!
//! Boot, trap entry and the hardware page-table walker live outside this
//! crate; they drive a [`Kernel`] through [`Kernel::syscall`],
//! [`Kernel::page_fault`] and [`Kernel::timer_interrupt`], and supply an
//! [`memory::Mmu`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod logger;
pub mod serial;

pub mod config;
pub mod console;
pub mod drivers;
pub mod env;
pub mod ipc;
pub mod memory;
pub mod sched;
pub mod syscall;
pub mod time;
pub mod trap;
pub mod usercopy;

mod kernel;

pub use exokern_abi as abi;
pub use kernel::Kernel;
