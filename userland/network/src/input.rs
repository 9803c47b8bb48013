//! Receive side: NIC -> network server

use exokern_abi::net::{encode_len, NSREQ_INPUT};
use exokern_abi::{EnvId, PagePerm, SysError, SysResult};
use exokern_ulib::{ipc, SysCalls, UserMemory};

use crate::RelayConfig;

/// What one poll of the receive ring did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The ring reported nothing pending
    Idle,
    /// Raced an empty ring; the carry page is kept for the next try
    Empty,
    /// A packet of this many bytes went to the server
    Delivered(usize),
}

pub struct InputRelay<'a, S> {
    sys: &'a S,
    config: RelayConfig,
    /// A fresh page is mapped at `config.buffer`
    carry: bool,
    delivered: u64,
}

impl<'a, S: SysCalls + UserMemory> InputRelay<'a, S> {
    pub fn new(sys: &'a S, config: RelayConfig) -> SysResult<Self> {
        config.validate()?;
        Ok(Self { sys, config, carry: false, delivered: 0 })
    }

    /// Packets handed to the server so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Move at most one packet from the ring to the server.
    ///
    /// The page sent to the server stays mapped there; the next packet gets
    /// a fresh one.
    pub fn poll_once(&mut self) -> SysResult<Step> {
        if !self.sys.net_rx_available() {
            return Ok(Step::Idle);
        }
        let buffer = self.config.buffer;
        if !self.carry {
            self.sys.page_alloc(EnvId::SELF, buffer, PagePerm::USER_RW)?;
            self.carry = true;
        }

        let len = match self.sys.net_try_read_rx(buffer) {
            Ok(len) => len,
            Err(SysError::RxEmpty) => return Ok(Step::Empty),
            Err(e) => return Err(e),
        };
        self.carry = false;
        self.sys.write(buffer, &encode_len(len));

        ipc::send(self.sys, self.config.ns_env, NSREQ_INPUT, Some((buffer, PagePerm::USER_RW)))?;
        self.delivered += 1;
        Ok(Step::Delivered(len))
    }

    /// Relay forever.
    ///
    /// # Panics
    ///
    /// On any error that is not ring or receiver contention.
    pub fn run(&mut self) -> ! {
        loop {
            match self.poll_once() {
                Ok(Step::Delivered(_)) => {}
                Ok(Step::Idle | Step::Empty) => self.sys.yield_now(),
                Err(e) => panic!("input relay: {}", e),
            }
        }
    }
}
