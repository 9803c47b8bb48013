//! User virtual memory layout
//!
//! ```text
//!   UTOP, UXSTACKTOP -> +------------------------+ 0x8000_0000
//!                       | user exception stack   | PAGE_SIZE
//!                       +------------------------+
//!                       | empty (guard)          | PAGE_SIZE
//!          USTACKTOP -> +------------------------+
//!                       | normal user stack      |
//!                       ~~~~~~~~~~~~~~~~~~~~~~~~~~
//!              UTEXT -> +------------------------+ 0x0080_0000
//!             PFTEMP -> | fault-handler scratch  |
//!              UTEMP -> +------------------------+ 0x0040_0000
//! ```

pub const PAGE_SIZE: u64 = 0x1000;
/// Span of user space covered by one last-level page table
pub const PT_REGION: u64 = 0x20_0000;

pub const UTOP: u64 = 0x8000_0000;
pub const UXSTACKTOP: u64 = UTOP;
pub const USTACKTOP: u64 = UTOP - 2 * PAGE_SIZE;

pub const UTEXT: u64 = 2 * PT_REGION;
pub const UTEMP: u64 = PT_REGION;
/// Scratch page used by the copy-on-write handler
pub const PFTEMP: u64 = UTEMP + PT_REGION - PAGE_SIZE;

/// Bytes below an interrupted stack pointer the kernel must not touch
pub const RED_ZONE: u64 = 128;

pub const fn page_offset(va: u64) -> u64 {
    va & (PAGE_SIZE - 1)
}

pub const fn page_round_down(va: u64) -> u64 {
    va & !(PAGE_SIZE - 1)
}

pub const fn region_round_down(va: u64) -> u64 {
    va & !(PT_REGION - 1)
}

/// Is `va` a page-aligned user address?
pub const fn is_user_page(va: u64) -> bool {
    va < UTOP && page_offset(va) == 0
}
