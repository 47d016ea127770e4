//! Shared vocabulary for grabsync: ids, poses, reference-frame math and the
//! possession event set.

pub mod event;
pub mod frame;
pub mod hash;
pub mod types;

pub use event::{EventKind, PossessionEvent};
pub use hash::{Fnv1a, fnv1a};
pub use types::{ArchetypeIndex, Handedness, ObjectId, ParticipantId, Pose};
