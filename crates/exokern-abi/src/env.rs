//! Environment identifiers and run states

use core::fmt;

use crate::error::SysError;

/// log2 of the environment table size
pub const LOG2NENV: u32 = 10;
/// Maximum number of environments
pub const NENV: usize = 1 << LOG2NENV;

/// Environment id: `generation | slot index`.
///
/// Ids are always positive when viewed as `i32`, so they can travel in a
/// syscall return register next to negative error codes. `EnvId::SELF`
/// (zero) means "the calling environment" wherever an id is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const SELF: EnvId = EnvId(0);

    /// Slot in the environment table
    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Decode a raw syscall argument.
    pub fn from_raw(raw: u64) -> Result<Self, SysError> {
        u32::try_from(raw)
            .ok()
            .filter(|v| (*v as i32) >= 0)
            .map(EnvId)
            .ok_or(SysError::BadTarget)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl TryFrom<u64> for EnvStatus {
    type Error = SysError;

    fn try_from(raw: u64) -> Result<Self, SysError> {
        Ok(match raw {
            0 => EnvStatus::Free,
            1 => EnvStatus::Dying,
            2 => EnvStatus::Runnable,
            3 => EnvStatus::Running,
            4 => EnvStatus::NotRunnable,
            _ => return Err(SysError::InvalidArg),
        })
    }
}
