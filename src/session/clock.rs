use crate::config::ClockSource;
use std::time::{Duration, Instant};

/// Time base for the session ceiling and the stuck timer.
#[derive(Debug, Clone, Copy)]
pub enum SessionClock {
    Wall(Instant),
    /// Fixed duration per acknowledged tick.
    Simulated(Duration),
}

impl SessionClock {
    pub fn start(source: ClockSource, fixed_delta_seconds: f64) -> Self {
        match source {
            ClockSource::Wall => SessionClock::Wall(Instant::now()),
            ClockSource::Simulated => {
                SessionClock::Simulated(crate::config::secs(fixed_delta_seconds))
            }
        }
    }

    /// Time since `start`, given the number of ticks completed so far.
    pub fn elapsed(&self, ticks: u32) -> Duration {
        match self {
            SessionClock::Wall(started) => started.elapsed(),
            SessionClock::Simulated(per_tick) => per_tick.saturating_mul(ticks),
        }
    }
}
