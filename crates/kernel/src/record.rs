use grabsync_common::{ArchetypeIndex, Handedness, ObjectId, ParticipantId, Pose};
use serde::{Deserialize, Serialize};

/// Who holds an object and, once confirmed, at which offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub participant: ParticipantId,
    pub hand: Handedness,
    /// Offset relative to the holder's joint. `None` until an attach event
    /// confirms it.
    pub offset: Option<Pose>,
}

/// Canonical, replicated state of one object. Only changed by applying
/// events from the ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub archetype: ArchetypeIndex,
    /// Last free-floating world pose.
    pub pose: Pose,
    pub holding: Option<Holding>,
}

impl ObjectRecord {
    pub fn holder(&self) -> Option<ParticipantId> {
        self.holding.map(|h| h.participant)
    }

    pub fn is_attached(&self) -> bool {
        self.holding.is_some_and(|h| h.offset.is_some())
    }

    pub fn offset(&self) -> Option<Pose> {
        self.holding.and_then(|h| h.offset)
    }
}
