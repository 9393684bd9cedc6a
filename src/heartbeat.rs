//! Per-session liveness probing.
//!
//! The drive loop owns the timer; this type only tracks how many probes went
//! unanswered and decides when the peer is considered dead.

use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MISSED: u32 = 2;

/// What the drive loop should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a transport ping.
    Probe,
    /// Too many probes unanswered: hard-drop the transport.
    Expired,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    missed: u32,
    max_missed: u32,
}

impl Heartbeat {
    pub fn new(max_missed: u32) -> Self {
        Self {
            missed: 0,
            max_missed,
        }
    }

    /// Advance one interval. Each probe counts as missed until acknowledged.
    pub fn tick(&mut self) -> Beat {
        if self.missed >= self.max_missed {
            return Beat::Expired;
        }
        self.missed += 1;
        Beat::Probe
    }

    pub fn acknowledge(&mut self) {
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSED)
    }
}
