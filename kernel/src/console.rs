//! Console plumbing for `cputs` / `cgetc`
//!
//! Input bytes are queued by whatever owns the keyboard or UART interrupt;
//! output is kept for inspection and echoed to the serial log.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Default)]
pub struct Console {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes typed by the user
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    /// Next input byte, if any
    pub fn getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
        crate::serial_print!("{}", String::from_utf8_lossy(bytes));
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.output)
    }
}
