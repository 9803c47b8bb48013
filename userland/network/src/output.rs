//! Transmit side: network server -> NIC

use exokern_abi::net::{decode_len, NSREQ_OUTPUT, PACKET_LEN_SIZE};
use exokern_abi::{SysError, SysResult};
use exokern_ulib::ipc::{self, IpcMessage};
use exokern_ulib::{SysCalls, UserMemory};

use crate::RelayConfig;

/// Fate of one message from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// On the transmit ring
    Queued,
    /// Ring full; the packet is gone and nobody is told
    Dropped,
    /// Not a transmit request from the server
    Ignored,
}

pub struct OutputRelay<'a, S> {
    sys: &'a S,
    config: RelayConfig,
    queued: u64,
    dropped: u64,
}

impl<'a, S: SysCalls + UserMemory> OutputRelay<'a, S> {
    pub fn new(sys: &'a S, config: RelayConfig) -> SysResult<Self> {
        config.validate()?;
        Ok(Self { sys, config, queued: 0, dropped: 0 })
    }

    pub fn queued(&self) -> u64 {
        self.queued
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue the packet page a message delivered at `config.buffer`.
    pub fn handle(&mut self, msg: &IpcMessage) -> SysResult<Delivery> {
        if msg.from != self.config.ns_env || msg.value != NSREQ_OUTPUT || msg.perm.is_none() {
            return Ok(Delivery::Ignored);
        }
        let mut header = [0u8; PACKET_LEN_SIZE];
        self.sys.read(self.config.buffer, &mut header);
        let Some(len) = decode_len(header) else {
            return Ok(Delivery::Ignored);
        };

        match self.sys.net_try_put_tx(self.config.buffer, len) {
            Ok(_) => {
                self.queued += 1;
                Ok(Delivery::Queued)
            }
            Err(SysError::TxFull) => {
                self.dropped += 1;
                Ok(Delivery::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for room on the ring, then for one message, and handle it.
    pub fn serve_one(&mut self) -> SysResult<Delivery> {
        while !self.sys.net_tx_available() {
            self.sys.yield_now();
        }
        let msg = ipc::recv(self.sys, Some(self.config.buffer))?;
        self.handle(&msg)
    }

    /// Relay forever.
    ///
    /// # Panics
    ///
    /// On any error other than a full ring.
    pub fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.serve_one() {
                panic!("output relay: {}", e);
            }
        }
    }
}
