//! Kernel and device configuration

use exokern_abi::env::NENV;
use exokern_abi::memlayout::PAGE_SIZE;
use exokern_abi::{SysError, SysResult};

use crate::logger::LogLevel;

/// QEMU's default e1000 MAC
pub const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Environment table size (at most `NENV`)
    pub max_envs: usize,
    /// Timer period
    pub tick_ms: u64,
    pub log_level: LogLevel,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_envs: NENV,
            tick_ms: 10,
            log_level: LogLevel::Info,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> SysResult<()> {
        if self.max_envs == 0 || self.max_envs > NENV || self.tick_ms == 0 {
            return Err(SysError::InvalidArg);
        }
        Ok(())
    }
}

/// e1000 ring geometry
///
/// Ring sizes are powers of two so cursors wrap with a mask, and each ring's
/// descriptors fit in one page. RX has to absorb bursts between the device
/// fill rate and the input task's drain rate, hence the larger default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicConfig {
    pub tx_slots: usize,
    pub rx_slots: usize,
    pub mac: [u8; 6],
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            tx_slots: 64,
            rx_slots: 256,
            mac: DEFAULT_MAC,
        }
    }
}

/// Descriptor size in bytes (legacy layout)
const DESC_SIZE: usize = 16;
/// RDLEN/TDLEN must be a multiple of 128 bytes
const MIN_SLOTS: usize = 8;

impl NicConfig {
    pub fn validate(&self) -> SysResult<()> {
        for slots in [self.tx_slots, self.rx_slots] {
            if !slots.is_power_of_two()
                || slots < MIN_SLOTS
                || slots * DESC_SIZE > PAGE_SIZE as usize
            {
                return Err(SysError::InvalidArg);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ring_sizes_are_valid() {
        let cfg = NicConfig::default();
        assert_eq!((cfg.tx_slots, cfg.rx_slots), (64, 256));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_ring_sizes_rejected() {
        let bad = [(48, 256), (64, 512), (4, 64), (64, 0)];
        for (tx_slots, rx_slots) in bad {
            let cfg = NicConfig { tx_slots, rx_slots, ..NicConfig::default() };
            assert_eq!(cfg.validate(), Err(SysError::InvalidArg), "{tx_slots}/{rx_slots}");
        }
    }

    #[test]
    fn test_kernel_config_bounds() {
        assert!(KernelConfig::default().validate().is_ok());
        let cfg = KernelConfig { max_envs: NENV + 1, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(SysError::InvalidArg));
        let cfg = KernelConfig { tick_ms: 0, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(SysError::InvalidArg));
    }
}
