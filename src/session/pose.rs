//! Catalog poses to simulator transforms.
//!
//! Catalog coordinates are right-handed with heading in radians; the simulator
//! is left-handed with yaw in degrees, so `y` flips sign and heading maps to
//! `-deg(h) - 90`.
use super::{Location, Rotation, Transform};
use crate::catalog::Pose;

/// Clearance kept above the road surface when snapping.
const ROAD_CLEARANCE: f64 = 0.3;

pub fn destination_transform(pose: &Pose) -> Transform {
    Transform {
        location: Location::new(pose.x, -pose.y, pose.z),
        rotation: Rotation {
            pitch: 0.0,
            yaw: normalize_yaw(-pose.heading.to_degrees() - 90.0),
            roll: 0.0,
        },
    }
}

/// Align with the nearest driving lane: lift above the road surface and take
/// the lane's orientation. Without a waypoint the transform is unchanged.
pub fn snap_to_road(transform: Transform, waypoint: Option<Transform>) -> Transform {
    match waypoint {
        Some(road) => Transform {
            location: Location {
                z: transform.location.z.max(road.location.z + ROAD_CLEARANCE),
                ..transform.location
            },
            rotation: road.rotation,
        },
        None => transform,
    }
}

/// Wrap into `[-180, 180)`.
fn normalize_yaw(yaw: f64) -> f64 {
    (yaw + 180.0).rem_euclid(360.0) - 180.0
}
