//! Kernel clock

/// Tick counter advanced by the timer interrupt
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    ticks: u64,
    tick_ms: u64,
}

impl Clock {
    pub fn new(tick_ms: u64) -> Self {
        Self { ticks: 0, tick_ms }
    }

    /// Called by the timer interrupt
    pub fn tick(&mut self) {
        self.ticks += 1;
        crate::logger::tick();
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Uptime in milliseconds
    pub fn msec(&self) -> u64 {
        self.ticks * self.tick_ms
    }
}
