use grabsync_common::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::record::ObjectRecord;
use crate::registry::Registry;

/// Full registry state for a late joiner or an export, in id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransfer {
    pub next_id: ObjectId,
    pub records: Vec<ObjectRecord>,
}

/// How a [`StateTransfer`] is merged into a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Replace everything, keeping ids and the id counter. Live join.
    Join,
    /// Add alongside existing objects with freshly assigned ids. Holders
    /// belong to the exporting session, so imported objects arrive free.
    Import,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("object id {0} is reserved")]
    ReservedId(ObjectId),
    #[error("object {0} appears more than once")]
    DuplicateId(ObjectId),
    #[error("object {id} uses unregistered archetype {archetype}")]
    UnknownArchetype { id: ObjectId, archetype: u32 },
}

impl Registry {
    pub fn capture_state(&self) -> StateTransfer {
        StateTransfer {
            next_id: self.next_id(),
            records: self.records().cloned().collect(),
        }
    }

    /// Merge `state` according to `mode`. Returns the ids the transferred
    /// objects have locally. Nothing changes if the state is rejected.
    ///
    /// Live instances are bound by later [`Registry::update`] calls, like
    /// any other spawn.
    pub fn load_state(
        &mut self,
        state: &StateTransfer,
        mode: TransferMode,
    ) -> Result<Vec<ObjectId>, TransferError> {
        self.validate_transfer(state, mode)?;
        let _span =
            tracing::info_span!("load_state", ?mode, objects = state.records.len()).entered();
        let ids: Vec<ObjectId> = match mode {
            TransferMode::Join => {
                self.clear();
                for record in &state.records {
                    self.insert_record(record.clone());
                }
                self.set_next_id(state.next_id);
                state.records.iter().map(|r| r.id).collect()
            }
            TransferMode::Import => state
                .records
                .iter()
                .map(|record| {
                    let id = self.allocate_id();
                    self.insert_record(ObjectRecord {
                        id,
                        holding: None,
                        ..record.clone()
                    });
                    id
                })
                .collect(),
        };
        tracing::debug!(count = ids.len(), next_id = %self.next_id(), "state loaded");
        Ok(ids)
    }

    fn validate_transfer(
        &self,
        state: &StateTransfer,
        mode: TransferMode,
    ) -> Result<(), TransferError> {
        let mut seen = BTreeSet::new();
        for record in &state.records {
            if !self.is_known_archetype(record.archetype) {
                return Err(TransferError::UnknownArchetype {
                    id: record.id,
                    archetype: record.archetype.0,
                });
            }
            if mode == TransferMode::Import {
                continue;
            }
            if !record.id.is_valid() {
                return Err(TransferError::ReservedId(record.id));
            }
            if !seen.insert(record.id) {
                return Err(TransferError::DuplicateId(record.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::record::Holding;
    use glam::Vec3;
    use grabsync_common::{ArchetypeIndex, Handedness, ParticipantId, Pose, PossessionEvent};
    use grabsync_possession::{JointSource, PossessionState};

    struct NoJoints;

    impl JointSource for NoJoints {
        fn joint_pose(&self, _: ParticipantId, _: Handedness) -> Option<Pose> {
            None
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            archetypes: vec!["crate".into(), "torch".into()],
            ..SyncConfig::default()
        }
    }

    fn populated() -> Registry {
        let mut r = Registry::new(ParticipantId(1), config());
        for (archetype, x) in [(0, 1.0), (1, 2.0), (0, 3.0)] {
            r.apply(
                &PossessionEvent::Spawn {
                    archetype: ArchetypeIndex(archetype),
                    pose: Pose::from_position(Vec3::new(x, 0.0, 0.0)),
                },
                0.0,
                &NoJoints,
            );
        }
        r.apply(&PossessionEvent::Despawn { id: ObjectId(1) }, 0.0, &NoJoints);
        r.apply(
            &PossessionEvent::ClaimPossession {
                id: ObjectId(2),
                participant: ParticipantId(2),
                hand: Handedness::Left,
            },
            0.0,
            &NoJoints,
        );
        r.apply(
            &PossessionEvent::Attach {
                id: ObjectId(2),
                participant: ParticipantId(2),
                offset: Pose::from_position(Vec3::Z),
            },
            0.0,
            &NoJoints,
        );
        r
    }

    #[test]
    fn capture_is_in_id_order_with_counter() {
        let state = populated().capture_state();
        assert_eq!(state.next_id, ObjectId(4));
        let ids: Vec<_> = state.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ObjectId(2), ObjectId(3)]);
        assert_eq!(
            state.records[0].holding,
            Some(Holding {
                participant: ParticipantId(2),
                hand: Handedness::Left,
                offset: Some(Pose::from_position(Vec3::Z)),
            })
        );
    }

    #[test]
    fn join_reproduces_the_replica() {
        let source = populated();
        let state = source.capture_state();
        let mut joiner = Registry::new(ParticipantId(5), config());
        let ids = joiner.load_state(&state, TransferMode::Join).unwrap();

        assert_eq!(ids, vec![ObjectId(2), ObjectId(3)]);
        assert_eq!(joiner.state_hash(), source.state_hash());
        assert_eq!(joiner.next_id(), ObjectId(4));
        assert_eq!(joiner.pending_spawn_len(), 2);
        joiner.update(1.0, &NoJoints);
        // The held object heads for its holder's hand.
        assert!(matches!(
            joiner.instance(ObjectId(2)).unwrap().possession().state(),
            PossessionState::ReceivingMovingToHolder(_)
        ));
    }

    #[test]
    fn join_replaces_existing_objects() {
        let state = populated().capture_state();
        let mut joiner = populated();
        joiner.apply(
            &PossessionEvent::Spawn {
                archetype: ArchetypeIndex(1),
                pose: Pose::default(),
            },
            0.0,
            &NoJoints,
        );
        joiner.load_state(&state, TransferMode::Join).unwrap();
        assert_eq!(joiner.object_count(), 2);
        assert_eq!(joiner.capture_state(), state);
    }

    #[test]
    fn import_assigns_fresh_ids() {
        let state = populated().capture_state();
        let mut target = populated();
        let ids = target.load_state(&state, TransferMode::Import).unwrap();
        assert_eq!(ids, vec![ObjectId(4), ObjectId(5)]);
        assert_eq!(target.object_count(), 4);
        assert_eq!(target.next_id(), ObjectId(6));
        assert_eq!(
            target.record(ObjectId(5)).unwrap().pose,
            Pose::from_position(Vec3::new(3.0, 0.0, 0.0))
        );
    }

    #[test]
    fn rejected_state_leaves_registry_untouched() {
        let mut state = populated().capture_state();
        state.records.push(state.records[0].clone());
        let mut target = populated();
        let before = target.state_hash();
        assert_eq!(
            target.load_state(&state, TransferMode::Join),
            Err(TransferError::DuplicateId(ObjectId(2)))
        );
        assert_eq!(target.state_hash(), before);

        state.records.pop();
        state.records[1].archetype = ArchetypeIndex(8);
        assert!(matches!(
            target.load_state(&state, TransferMode::Import),
            Err(TransferError::UnknownArchetype { archetype: 8, .. })
        ));
        assert_eq!(target.state_hash(), before);
    }

    fn held_record(participant: ParticipantId) -> StateTransfer {
        StateTransfer {
            next_id: ObjectId(2),
            records: vec![ObjectRecord {
                id: ObjectId(1),
                archetype: ArchetypeIndex(0),
                pose: Pose::from_position(Vec3::new(0.0, 1.0, 0.0)),
                holding: Some(Holding {
                    participant,
                    hand: Handedness::Right,
                    offset: Some(Pose::from_position(Vec3::Z)),
                }),
            }],
        }
    }

    #[test]
    fn imported_objects_arrive_free() {
        let mut target = Registry::new(ParticipantId(1), config());
        let ids = target
            .load_state(&held_record(ParticipantId(42)), TransferMode::Import)
            .unwrap();
        let id = ids[0];
        let mut now = 0.0;
        while now < 10.0 {
            target.update(now, &NoJoints);
            now += 0.5;
        }
        let record = target.record(id).unwrap();
        assert_eq!(record.holding, None);
        assert_eq!(record.pose, Pose::from_position(Vec3::new(0.0, 1.0, 0.0)));
        assert_eq!(target.active_len(), 0);
        assert!(target.instance(id).unwrap().possession().state().is_idle());
    }

    #[test]
    fn import_never_claims_for_the_local_participant() {
        let mut target = Registry::new(ParticipantId(1), config());
        let ids = target
            .load_state(&held_record(ParticipantId(1)), TransferMode::Import)
            .unwrap();
        target.update(0.0, &NoJoints);
        assert_eq!(target.record(ids[0]).unwrap().holder(), None);
        // Free objects are the authority's to remove, not a phantom holder's.
        assert!(!target.controls(ids[0], false));
        assert!(target.controls(ids[0], true));
    }
}
