//! Anomaly detectors evaluated once per tick.
use super::Location;
use crate::config::{secs, DetectorConfig};
use std::time::Duration;

/// Reference position and the time it was taken. Empty until the first tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StuckState {
    reference: Option<(Location, Duration)>,
}

impl StuckState {
    #[cfg(test)]
    pub fn reference(&self) -> Option<Location> {
        self.reference.map(|(location, _)| location)
    }

    /// Feed one observed position at session time `now`.
    ///
    /// Moving more than `stuck_distance` from the reference re-anchors both the
    /// reference and the timer. Otherwise the run is stuck once more than
    /// `stuck_secs` have passed since the timer was anchored.
    pub fn step(
        self,
        position: Location,
        now: Duration,
        detectors: &DetectorConfig,
    ) -> (StuckState, bool) {
        match self.reference {
            Some((reference, since)) if position.distance(&reference) <= detectors.stuck_distance => {
                let still_for = now.saturating_sub(since);
                (self, still_for > secs(detectors.stuck_secs))
            }
            _ => (
                StuckState {
                    reference: Some((position, now)),
                },
                false,
            ),
        }
    }
}

/// Below the ground threshold the vehicle has left the drivable world.
pub fn is_fallen(position: &Location, fallen_z: f64) -> bool {
    position.z < fallen_z
}
