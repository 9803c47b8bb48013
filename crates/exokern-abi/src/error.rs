//! Syscall error codes
//!
//! Errors cross the user boundary as negative integers in the return
//! register; non-negative values are payload.

use core::fmt;

/// Syscall error code (negated on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SysError {
    /// Unspecified failure
    Unspecified = 1,
    /// Target environment does not exist
    BadTarget = 2,
    /// Malformed address, permission or argument
    InvalidArg = 3,
    /// Out of physical memory or page-table space
    NoMem = 4,
    /// Environment table is full
    NoFreeEnv = 5,
    /// Caller handed the kernel memory it cannot use
    Fault = 6,
    /// IPC target is not blocked in receive (retry)
    NotReceiving = 7,
    /// Caller may not modify the target environment
    PermissionDenied = 8,
    /// Transmit ring has no free slot (retry or drop)
    TxFull = 9,
    /// Receive ring holds no completed packet (retry)
    RxEmpty = 10,
    /// No network device attached
    NoDevice = 11,
    /// Unknown syscall number
    NoSys = 12,
}

impl SysError {
    /// Wire encoding
    #[inline]
    pub const fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Decode a negative return value.
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match -code {
            1 => SysError::Unspecified,
            2 => SysError::BadTarget,
            3 => SysError::InvalidArg,
            4 => SysError::NoMem,
            5 => SysError::NoFreeEnv,
            6 => SysError::Fault,
            7 => SysError::NotReceiving,
            8 => SysError::PermissionDenied,
            9 => SysError::TxFull,
            10 => SysError::RxEmpty,
            11 => SysError::NoDevice,
            12 => SysError::NoSys,
            _ => return None,
        })
    }

    /// Transient contention: expected in normal operation, retried by callers.
    pub const fn is_transient(self) -> bool {
        matches!(self, SysError::NotReceiving | SysError::TxFull | SysError::RxEmpty)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SysError::Unspecified => "unspecified error",
            SysError::BadTarget => "bad environment",
            SysError::InvalidArg => "invalid parameter",
            SysError::NoMem => "out of memory",
            SysError::NoFreeEnv => "out of environments",
            SysError::Fault => "segmentation fault",
            SysError::NotReceiving => "env is not recving",
            SysError::PermissionDenied => "permission denied",
            SysError::TxFull => "transmit ring full",
            SysError::RxEmpty => "receive ring empty",
            SysError::NoDevice => "no such device",
            SysError::NoSys => "no such syscall",
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SysResult<T> = Result<T, SysError>;

/// Decode a raw return register into a result.
pub fn decode(ret: i64) -> SysResult<u64> {
    if ret < 0 {
        Err(SysError::from_code(ret).unwrap_or(SysError::Unspecified))
    } else {
        Ok(ret as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wire_encoding() {
        assert_eq!(SysError::InvalidArg.as_isize(), -3);
        assert_eq!(SysError::from_code(-7), Some(SysError::NotReceiving));
        assert_eq!(SysError::from_code(-99), None);
        assert_eq!(SysError::from_code(0), None);
    }

    #[test]
    fn test_decode_return_register() {
        assert_eq!(decode(42), Ok(42));
        assert_eq!(decode(SysError::NoMem.as_i64()), Err(SysError::NoMem));
        assert_eq!(decode(-1000), Err(SysError::Unspecified));
    }

    #[test]
    fn test_transient_errors() {
        assert!(SysError::NotReceiving.is_transient());
        assert!(SysError::RxEmpty.is_transient());
        assert!(!SysError::NoMem.is_transient());
    }
}
