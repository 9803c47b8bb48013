//! Saved register state
//!
//! `Trapframe` is what the kernel saves on entry; `UTrapframe` is the record
//! it pushes on the user exception stack before branching to a page-fault
//! upcall. Both are `repr(C)` because user-space assembly reads them.

/// General-purpose registers in push order (r15 lowest)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

impl PushRegs {
    pub const WORDS: usize = 15;

    fn to_words(self) -> [u64; Self::WORDS] {
        [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rsi, self.rdi, self.rbp, self.rdx, self.rcx, self.rbx, self.rax,
        ]
    }

    fn from_words(w: &[u64]) -> Self {
        PushRegs {
            r15: w[0],
            r14: w[1],
            r13: w[2],
            r12: w[3],
            r11: w[4],
            r10: w[5],
            r9: w[6],
            r8: w[7],
            rsi: w[8],
            rdi: w[9],
            rbp: w[10],
            rdx: w[11],
            rcx: w[12],
            rbx: w[13],
            rax: w[14],
        }
    }
}

/// User code segment selector, RPL 3
pub const GD_UT: u64 = 0x18 | 3;
/// User data segment selector, RPL 3
pub const GD_UD: u64 = 0x20 | 3;
/// Interrupt-enable flag in RFLAGS
pub const RFLAGS_IF: u64 = 1 << 9;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Trapframe {
    pub const SIZE: usize = (PushRegs::WORDS + 7) * 8;

    /// Fresh user-mode frame entering at `rip` with stack `rsp`.
    pub fn user(rip: u64, rsp: u64) -> Self {
        Trapframe {
            rip,
            rsp,
            cs: GD_UT,
            ss: GD_UD,
            rflags: RFLAGS_IF,
            ..Trapframe::default()
        }
    }

    /// Clamp a frame supplied by user space to CPL 3 with interrupts on.
    pub fn sanitize(&mut self) {
        self.cs = GD_UT;
        self.ss = GD_UD;
        self.rflags |= RFLAGS_IF;
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u64; PushRegs::WORDS + 7];
        words[..PushRegs::WORDS].copy_from_slice(&self.regs.to_words());
        words[PushRegs::WORDS..].copy_from_slice(&[
            self.trapno, self.err, self.rip, self.cs, self.rflags, self.rsp, self.ss,
        ]);
        words_to_bytes(&words)
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut words = [0u64; PushRegs::WORDS + 7];
        bytes_to_words(bytes, &mut words);
        let t = &words[PushRegs::WORDS..];
        Trapframe {
            regs: PushRegs::from_words(&words[..PushRegs::WORDS]),
            trapno: t[0],
            err: t[1],
            rip: t[2],
            cs: t[3],
            rflags: t[4],
            rsp: t[5],
            ss: t[6],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u64,
    pub err: u64,
    pub regs: PushRegs,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

impl UTrapframe {
    pub const SIZE: usize = (PushRegs::WORDS + 5) * 8;
    pub const REGS_OFFSET: usize = 16;
    pub const RIP_OFFSET: usize = Self::REGS_OFFSET + PushRegs::WORDS * 8;
    pub const RFLAGS_OFFSET: usize = Self::RIP_OFFSET + 8;
    pub const RSP_OFFSET: usize = Self::RFLAGS_OFFSET + 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u64; PushRegs::WORDS + 5];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..2 + PushRegs::WORDS].copy_from_slice(&self.regs.to_words());
        words[2 + PushRegs::WORDS..].copy_from_slice(&[self.rip, self.rflags, self.rsp]);
        words_to_bytes(&words)
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut words = [0u64; PushRegs::WORDS + 5];
        bytes_to_words(bytes, &mut words);
        let t = &words[2 + PushRegs::WORDS..];
        UTrapframe {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(&words[2..2 + PushRegs::WORDS]),
            rip: t[0],
            rflags: t[1],
            rsp: t[2],
        }
    }
}

fn words_to_bytes<const N: usize, const B: usize>(words: &[u64; N]) -> [u8; B] {
    let mut out = [0u8; B];
    for (chunk, word) in out.chunks_exact_mut(8).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn bytes_to_words(bytes: &[u8], words: &mut [u64]) {
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *word = u64::from_le_bytes(raw);
    }
}
