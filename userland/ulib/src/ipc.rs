//! IPC helpers
//!
//! The kernel only offers a single send attempt. `send` turns it into the
//! usual "retry until the receiver is waiting" loop, yielding in between so
//! the receiver gets to run.

use exokern_abi::{EnvId, PagePerm, SysError, SysResult};

use crate::syscall::SysCalls;

/// A completed receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMessage {
    pub from: EnvId,
    pub value: u32,
    /// Permission of the page that arrived, `None` if none did
    pub perm: Option<PagePerm>,
}

/// Send `value` (and the page at `page.0`, if any) to `to`, waiting as long
/// as it takes for `to` to receive.
pub fn send<S: SysCalls>(sys: &S, to: EnvId, value: u32, page: Option<(u64, PagePerm)>) -> SysResult<()> {
    loop {
        match sys.ipc_try_send(to, value, page) {
            Err(SysError::NotReceiving) => sys.yield_now(),
            other => return other,
        }
    }
}

/// Wait for a message, accepting a page at `dst` if given.
pub fn recv<S: SysCalls>(sys: &S, dst: Option<u64>) -> SysResult<IpcMessage> {
    sys.ipc_recv(dst)?;
    Ok(sys.ipc_message())
}
