//! Access to the environment's own memory

/// Reads and writes of this environment's address space.
///
/// Faults are taken the normal way: a write to a copy-on-write page enters
/// the registered fault handler and resumes once it returns. A fault nobody
/// can resolve ends the environment, so these never fail.
pub trait UserMemory {
    fn read(&self, va: u64, buf: &mut [u8]);

    fn write(&self, va: u64, bytes: &[u8]);

    /// `memmove` of `len` bytes within the address space
    fn copy(&self, dst: u64, src: u64, len: usize);

    fn read_u64(&self, va: u64) -> u64 {
        let mut word = [0u8; 8];
        self.read(va, &mut word);
        u64::from_le_bytes(word)
    }

    fn write_u64(&self, va: u64, value: u64) {
        self.write(va, &value.to_le_bytes());
    }
}
