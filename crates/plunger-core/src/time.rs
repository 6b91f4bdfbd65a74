//! Machine time
//!
//! Provides the millisecond clock shared by every component:
//! - `Time` - milliseconds since the machine started
//! - `ClockMode` - wall-clock driven or manually advanced
//! - `Clock` - current time plus the mode it advances in

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Milliseconds since machine start
pub type Time = u64;

/// How the clock advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClockMode {
    /// Advanced only by explicit `advance_to` calls (tests, replay)
    #[default]
    Virtual,
    /// Follows the wall clock, sampled once per tick
    RealTime,
}

/// Machine clock state
#[derive(Debug, Clone)]
pub struct Clock {
    mode: ClockMode,
    now: Time,
    origin: Instant,
}

impl Clock {
    /// Create a virtual clock at t=0
    pub fn new_virtual() -> Self {
        Self {
            mode: ClockMode::Virtual,
            now: 0,
            origin: Instant::now(),
        }
    }

    /// Create a wall-clock driven clock starting now
    pub fn new_realtime() -> Self {
        Self {
            mode: ClockMode::RealTime,
            now: 0,
            origin: Instant::now(),
        }
    }

    /// Create a clock in the given mode
    pub fn with_mode(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Virtual => Self::new_virtual(),
            ClockMode::RealTime => Self::new_realtime(),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn is_virtual(&self) -> bool {
        self.mode == ClockMode::Virtual
    }

    /// Current time in milliseconds
    pub fn now(&self) -> Time {
        self.now
    }

    /// Milliseconds of wall time since the clock was created
    pub fn wall_elapsed(&self) -> Time {
        self.origin.elapsed().as_millis() as Time
    }

    /// Move the clock to `t`. Returns false if `t` is not later than now.
    pub(crate) fn set(&mut self, t: Time) -> bool {
        if t <= self.now {
            return false;
        }
        self.now = t;
        true
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new_virtual()
    }
}
