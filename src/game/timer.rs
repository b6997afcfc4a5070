use std::time::Duration;

use serde::Serialize;

/// Round countdown, advanced one whole second per engine tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTimer {
    round_length: Duration,
    remaining: Duration,
    running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerView {
    pub remaining_secs: u64,
    pub running: bool,
}

impl RoundTimer {
    pub fn new(round_length: Duration) -> Self {
        Self {
            round_length,
            remaining: round_length,
            running: false,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn view(&self) -> TimerView {
        TimerView {
            remaining_secs: self.remaining.as_secs(),
            running: self.running,
        }
    }

    /// No-op at zero; a spent timer has to be reset or extended first.
    pub fn start(&mut self) {
        self.running = !self.remaining.is_zero();
    }

    pub fn pause(&mut self) {
        self.running = false;
    }

    pub fn toggle(&mut self) {
        if self.running {
            self.pause();
        } else {
            self.start();
        }
    }

    pub fn extend(&mut self, by: Duration) {
        self.remaining += by;
    }

    /// Back to a full round. Running or paused is left as it was.
    pub fn reset(&mut self) {
        self.remaining = self.round_length;
    }

    /// Advance one second. Returns true on the tick that reaches zero.
    pub fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.remaining = self.remaining.saturating_sub(Duration::from_secs(1));
        if self.remaining.is_zero() {
            self.running = false;
            return true;
        }
        false
    }
}
