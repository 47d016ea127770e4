//! Conversions between world poses and poses relative to a moving reference
//! frame (typically a hand joint), plus pose interpolation.

use crate::types::Pose;
use glam::Quat;

/// Express `world` relative to `frame`.
pub fn to_local(frame: &Pose, world: &Pose) -> Pose {
    let inverse = frame.rotation.inverse();
    Pose {
        position: inverse * (world.position - frame.position),
        rotation: (inverse * world.rotation).normalize(),
    }
}

/// Resolve a `local` pose relative to `frame` back into world space.
pub fn to_world(frame: &Pose, local: &Pose) -> Pose {
    Pose {
        position: frame.position + frame.rotation * local.position,
        rotation: (frame.rotation * local.rotation).normalize(),
    }
}

/// Angle between two rotations, in degrees.
pub fn angle_degrees(a: Quat, b: Quat) -> f32 {
    a.angle_between(b).to_degrees()
}

/// Interpolate from `start` to `target` at fraction `t`.
///
/// Position is linear, rotation is shortest-path spherical. `t <= 0` returns
/// `start` exactly and `t >= 1` returns `target` exactly.
pub fn interpolate(start: &Pose, target: &Pose, t: f32) -> Pose {
    if t >= 1.0 {
        return *target;
    }
    if t <= 0.0 {
        return *start;
    }
    Pose {
        position: start.position.lerp(target.position, t),
        rotation: start.rotation.slerp(target.rotation, t),
    }
}
