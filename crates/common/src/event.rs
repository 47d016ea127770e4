use crate::types::{ArchetypeIndex, Handedness, ObjectId, ParticipantId, Pose};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Possession-related events carried by the ordered event log.
///
/// Every participant applies the same sequence of these in the same order;
/// nothing else mutates the canonical object records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PossessionEvent {
    /// Create an object. The id is assigned by the applying side.
    Spawn {
        archetype: ArchetypeIndex,
        pose: Pose,
    },
    /// Destroy an object and recycle its instance.
    Despawn { id: ObjectId },
    /// A participant picked the object up. Clears any previous attachment.
    ClaimPossession {
        id: ObjectId,
        participant: ParticipantId,
        hand: Handedness,
    },
    /// The holder settled on a grab offset relative to its hand joint.
    Attach {
        id: ObjectId,
        participant: ParticipantId,
        offset: Pose,
    },
    /// The object was let go. Ignored unless `prior_participant` still holds it.
    Release {
        id: ObjectId,
        prior_participant: ParticipantId,
        pose: Pose,
    },
    /// Free-floating world pose update.
    FloatingPosition { id: ObjectId, pose: Pose },
}

/// Discriminant of a [`PossessionEvent`], used as the substrate-level kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Spawn,
    Despawn,
    ClaimPossession,
    Attach,
    Release,
    FloatingPosition,
}

impl PossessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Spawn { .. } => EventKind::Spawn,
            Self::Despawn { .. } => EventKind::Despawn,
            Self::ClaimPossession { .. } => EventKind::ClaimPossession,
            Self::Attach { .. } => EventKind::Attach,
            Self::Release { .. } => EventKind::Release,
            Self::FloatingPosition { .. } => EventKind::FloatingPosition,
        }
    }

    /// The object this event targets. `None` for spawns, whose id is not
    /// known until the event is applied.
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            Self::Spawn { .. } => None,
            Self::Despawn { id }
            | Self::ClaimPossession { id, .. }
            | Self::Attach { id, .. }
            | Self::Release { id, .. }
            | Self::FloatingPosition { id, .. } => Some(*id),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawn => "spawn",
            Self::Despawn => "despawn",
            Self::ClaimPossession => "claim-possession",
            Self::Attach => "attach",
            Self::Release => "release",
            Self::FloatingPosition => "floating-position",
        };
        f.write_str(name)
    }
}
