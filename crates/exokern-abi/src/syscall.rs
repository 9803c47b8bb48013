//! Syscall numbers
//!
//! Register convention (x86_64 `syscall`): rax = number, rdi, rsi, rdx,
//! r10, r8 = arguments; the result comes back in rax.

use crate::error::SysError;

/// "No page" sentinel for `ipc_try_send` / `ipc_recv` addresses
pub const IPC_NO_PAGE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetTrapframe = 9,
    EnvSetPgfaultUpcall = 10,
    Yield = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
    TimeMsec = 14,
    NetTryPutTx = 15,
    NetTryReadRx = 16,
    NetTxAvailable = 17,
    NetRxAvailable = 18,
    PageQuery = 19,
    RegionQuery = 20,
    IpcField = 21,
}

impl Syscall {
    pub const fn number(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for Syscall {
    type Error = SysError;

    fn try_from(nr: u64) -> Result<Self, SysError> {
        use Syscall::*;
        Ok(match nr {
            0 => Cputs,
            1 => Cgetc,
            2 => GetEnvId,
            3 => EnvDestroy,
            4 => PageAlloc,
            5 => PageMap,
            6 => PageUnmap,
            7 => Exofork,
            8 => EnvSetStatus,
            9 => EnvSetTrapframe,
            10 => EnvSetPgfaultUpcall,
            11 => Yield,
            12 => IpcTrySend,
            13 => IpcRecv,
            14 => TimeMsec,
            15 => NetTryPutTx,
            16 => NetTryReadRx,
            17 => NetTxAvailable,
            18 => NetRxAvailable,
            19 => PageQuery,
            20 => RegionQuery,
            21 => IpcField,
            _ => return Err(SysError::NoSys),
        })
    }
}

/// Fields of the last completed receive, read back with `Syscall::IpcField`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum IpcField {
    From = 0,
    Value = 1,
    Perm = 2,
}

impl TryFrom<u64> for IpcField {
    type Error = SysError;

    fn try_from(raw: u64) -> Result<Self, SysError> {
        match raw {
            0 => Ok(IpcField::From),
            1 => Ok(IpcField::Value),
            2 => Ok(IpcField::Perm),
            _ => Err(SysError::InvalidArg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers_decode() {
        for nr in 0..=21u64 {
            let call = Syscall::try_from(nr).unwrap();
            assert_eq!(call.number(), nr);
        }
        assert_eq!(Syscall::try_from(22), Err(SysError::NoSys));
    }
}
