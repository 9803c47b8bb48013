//! Network relays
//!
//! Two small environments sit between the NIC rings and the network
//! server. The input relay polls the receive ring and forwards each packet
//! page to the server; the output relay receives packet pages from the
//! server and queues them on the transmit ring. Both only ever use the
//! kernel's non-blocking ring calls and yield when there is nothing to do.
//!
//! A packet page carries a little-endian `i32` length followed by the frame
//! (`exokern_abi::net`).

#![cfg_attr(not(test), no_std)]

pub mod input;
pub mod output;

use exokern_abi::memlayout::{page_offset, USTACKTOP};
use exokern_abi::{EnvId, SysError, SysResult};

pub use input::{InputRelay, Step};
pub use output::{Delivery, OutputRelay};

/// Where a relay keeps its packet page unless told otherwise
pub const DEFAULT_BUFFER: u64 = 0x0fff_f000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// The network server environment
    pub ns_env: EnvId,
    /// Page-aligned address of the packet page
    pub buffer: u64,
}

impl RelayConfig {
    pub fn new(ns_env: EnvId) -> Self {
        Self { ns_env, buffer: DEFAULT_BUFFER }
    }

    pub fn validate(&self) -> SysResult<()> {
        if self.ns_env.is_self() || page_offset(self.buffer) != 0 || self.buffer >= USTACKTOP {
            return Err(SysError::InvalidArg);
        }
        Ok(())
    }
}
