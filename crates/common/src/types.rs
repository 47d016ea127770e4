use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a synchronized object. Assigned by the side applying the
/// spawn event, so every participant agrees on it. `0` is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The reserved invalid id.
    pub const INVALID: ObjectId = ObjectId(0);

    /// First id handed out in a fresh session.
    pub const FIRST: ObjectId = ObjectId(1);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The id following this one.
    pub fn next(self) -> ObjectId {
        ObjectId(self.0.wrapping_add(1).max(1))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A participant in the session, as identified by the event substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Index of an archetype (prefab kind). Also selects the pool bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeIndex(pub u32);

impl ArchetypeIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which hand holds an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Handedness {
    Left,
    #[default]
    Right,
}

/// World- or frame-relative position and rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_is_zero() {
        assert!(!ObjectId::INVALID.is_valid());
        assert!(ObjectId::FIRST.is_valid());
    }

    #[test]
    fn next_id_skips_zero_on_wrap() {
        assert_eq!(ObjectId(u32::MAX).next(), ObjectId(1));
        assert_eq!(ObjectId(4).next(), ObjectId(5));
    }

    #[test]
    fn pose_default_is_identity() {
        let p = Pose::default();
        assert_eq!(p.position, Vec3::ZERO);
        assert_eq!(p.rotation, Quat::IDENTITY);
    }
}
