use grabsync_common::{
    ArchetypeIndex, Handedness, ObjectId, ParticipantId, Pose, PossessionEvent,
};
use grabsync_possession::JointSource;

use crate::record::{Holding, ObjectRecord};
use crate::registry::Registry;

/// Outcome of applying one event from the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Spawned(ObjectId),
    Updated(ObjectId),
    Despawned(ObjectId),
    /// The event no longer matches the records. Every replica ignores it the
    /// same way, so this is not an error.
    Ignored(IgnoreReason),
}

impl Applied {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Why an event was ignored.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IgnoreReason {
    #[error("object {0} does not exist")]
    UnknownObject(ObjectId),
    #[error("archetype {0} is not registered")]
    UnknownArchetype(u32),
    #[error("object {id} is not held by {participant}")]
    NotHolder {
        id: ObjectId,
        participant: ParticipantId,
    },
}

impl Registry {
    /// Apply one event from the ordered log. Records change only here.
    pub fn apply(
        &mut self,
        event: &PossessionEvent,
        now: f64,
        joints: &dyn JointSource,
    ) -> Applied {
        let _span = tracing::info_span!("apply_event", kind = %event.kind()).entered();
        let outcome = match *event {
            PossessionEvent::Spawn { archetype, pose } => self.apply_spawn(archetype, pose),
            PossessionEvent::Despawn { id } => match self.remove_record(id) {
                Some(_) => Applied::Despawned(id),
                None => Applied::Ignored(IgnoreReason::UnknownObject(id)),
            },
            PossessionEvent::ClaimPossession {
                id,
                participant,
                hand,
            } => self.apply_claim(id, participant, hand, now, joints),
            PossessionEvent::Attach {
                id,
                participant,
                offset,
            } => self.apply_attach(id, participant, offset, now, joints),
            PossessionEvent::Release {
                id,
                prior_participant,
                pose,
            } => self.apply_release(id, prior_participant, pose, now, joints),
            PossessionEvent::FloatingPosition { id, pose } => {
                self.apply_floating(id, pose, now, joints)
            }
        };
        match &outcome {
            Applied::Ignored(reason @ IgnoreReason::UnknownArchetype(_)) => {
                tracing::warn!(%reason, "event ignored");
            }
            Applied::Ignored(reason) => tracing::debug!(%reason, "event ignored"),
            _ => {}
        }
        outcome
    }

    /// The record exists from here on; its live instance is bound by a later
    /// [`Registry::update`].
    fn apply_spawn(&mut self, archetype: ArchetypeIndex, pose: Pose) -> Applied {
        if !self.is_known_archetype(archetype) {
            return Applied::Ignored(IgnoreReason::UnknownArchetype(archetype.0));
        }
        let id = self.allocate_id();
        self.insert_record(ObjectRecord {
            id,
            archetype,
            pose,
            holding: None,
        });
        Applied::Spawned(id)
    }

    fn apply_claim(
        &mut self,
        id: ObjectId,
        participant: ParticipantId,
        hand: Handedness,
        now: f64,
        joints: &dyn JointSource,
    ) -> Applied {
        let Some(record) = self.records.get_mut(&id) else {
            return Applied::Ignored(IgnoreReason::UnknownObject(id));
        };
        record.holding = Some(Holding {
            participant,
            hand,
            offset: None,
        });
        self.drive_bound(id, now, joints, |p, cx| p.confirm_holder(cx, participant, hand));
        Applied::Updated(id)
    }

    fn apply_attach(
        &mut self,
        id: ObjectId,
        participant: ParticipantId,
        offset: Pose,
        now: f64,
        joints: &dyn JointSource,
    ) -> Applied {
        let Some(record) = self.records.get_mut(&id) else {
            return Applied::Ignored(IgnoreReason::UnknownObject(id));
        };
        match record.holding.as_mut() {
            Some(holding) if holding.participant == participant => holding.offset = Some(offset),
            _ => return Applied::Ignored(IgnoreReason::NotHolder { id, participant }),
        }
        self.drive_bound(id, now, joints, |p, cx| p.confirm_attach(cx, offset));
        Applied::Updated(id)
    }

    fn apply_release(
        &mut self,
        id: ObjectId,
        prior: ParticipantId,
        pose: Pose,
        now: f64,
        joints: &dyn JointSource,
    ) -> Applied {
        let Some(record) = self.records.get_mut(&id) else {
            return Applied::Ignored(IgnoreReason::UnknownObject(id));
        };
        if record.holder() != Some(prior) {
            return Applied::Ignored(IgnoreReason::NotHolder {
                id,
                participant: prior,
            });
        }
        record.holding = None;
        record.pose = pose;
        self.drive_bound(id, now, joints, |p, cx| p.confirm_release(cx, pose));
        Applied::Updated(id)
    }

    fn apply_floating(
        &mut self,
        id: ObjectId,
        pose: Pose,
        now: f64,
        joints: &dyn JointSource,
    ) -> Applied {
        let Some(record) = self.records.get_mut(&id) else {
            return Applied::Ignored(IgnoreReason::UnknownObject(id));
        };
        record.pose = pose;
        self.drive_bound(id, now, joints, |p, cx| p.confirm_floating(cx, pose));
        Applied::Updated(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use glam::Vec3;
    use grabsync_possession::PossessionState;
    use std::collections::HashMap;

    const ME: ParticipantId = ParticipantId(1);
    const OTHER: ParticipantId = ParticipantId(2);

    #[derive(Default)]
    struct Joints(HashMap<(ParticipantId, Handedness), Pose>);

    impl JointSource for Joints {
        fn joint_pose(&self, participant: ParticipantId, hand: Handedness) -> Option<Pose> {
            self.0.get(&(participant, hand)).copied()
        }
    }

    fn setup() -> (Registry, Joints, ObjectId) {
        let mut r = Registry::new(ME, SyncConfig::default());
        let joints = Joints::default();
        let spawned = r.apply(
            &PossessionEvent::Spawn {
                archetype: ArchetypeIndex(0),
                pose: Pose::from_position(Vec3::Y),
            },
            0.0,
            &joints,
        );
        let Applied::Spawned(id) = spawned else {
            panic!("spawn failed: {spawned:?}");
        };
        r.update(0.0, &joints);
        (r, joints, id)
    }

    fn claim(id: ObjectId, participant: ParticipantId) -> PossessionEvent {
        PossessionEvent::ClaimPossession {
            id,
            participant,
            hand: Handedness::Right,
        }
    }

    #[test]
    fn spawn_assigns_id_and_idles() {
        let (r, _, id) = setup();
        assert_eq!(id, ObjectId::FIRST);
        assert_eq!(r.next_id(), ObjectId(2));
        let record = r.record(id).unwrap();
        assert_eq!(record.pose, Pose::from_position(Vec3::Y));
        assert!(r.instance(id).unwrap().possession().state().is_idle());
        assert_eq!(r.active_len(), 0);
    }

    #[test]
    fn unknown_archetype_is_ignored_without_consuming_an_id() {
        let (mut r, joints, _) = setup();
        let out = r.apply(
            &PossessionEvent::Spawn {
                archetype: ArchetypeIndex(4),
                pose: Pose::default(),
            },
            0.0,
            &joints,
        );
        assert_eq!(out, Applied::Ignored(IgnoreReason::UnknownArchetype(4)));
        assert_eq!(r.next_id(), ObjectId(2));
    }

    #[test]
    fn events_for_missing_objects_are_ignored() {
        let (mut r, joints, _) = setup();
        let gone = ObjectId(77);
        for event in [
            PossessionEvent::Despawn { id: gone },
            claim(gone, OTHER),
            PossessionEvent::Attach {
                id: gone,
                participant: OTHER,
                offset: Pose::IDENTITY,
            },
            PossessionEvent::Release {
                id: gone,
                prior_participant: OTHER,
                pose: Pose::IDENTITY,
            },
            PossessionEvent::FloatingPosition {
                id: gone,
                pose: Pose::IDENTITY,
            },
        ] {
            assert_eq!(
                r.apply(&event, 0.0, &joints),
                Applied::Ignored(IgnoreReason::UnknownObject(gone))
            );
        }
        assert_eq!(r.object_count(), 1);
    }

    #[test]
    fn claim_then_attach_updates_record() {
        let (mut r, joints, id) = setup();
        r.apply(&claim(id, OTHER), 0.0, &joints);
        let record = r.record(id).unwrap();
        assert_eq!(record.holder(), Some(OTHER));
        assert!(!record.is_attached());

        let offset = Pose::from_position(Vec3::Z);
        let out = r.apply(
            &PossessionEvent::Attach {
                id,
                participant: OTHER,
                offset,
            },
            0.0,
            &joints,
        );
        assert_eq!(out, Applied::Updated(id));
        assert_eq!(r.record(id).unwrap().offset(), Some(offset));
        assert!(matches!(
            r.instance(id).unwrap().possession().state(),
            PossessionState::ReceivingMovingToHolder(_)
        ));
    }

    #[test]
    fn attach_from_a_non_holder_is_stale() {
        let (mut r, joints, id) = setup();
        r.apply(&claim(id, OTHER), 0.0, &joints);
        let out = r.apply(
            &PossessionEvent::Attach {
                id,
                participant: ParticipantId(9),
                offset: Pose::IDENTITY,
            },
            0.0,
            &joints,
        );
        assert!(out.is_ignored());
        assert!(!r.record(id).unwrap().is_attached());
    }

    #[test]
    fn stale_release_is_idempotent() {
        let (mut r, joints, id) = setup();
        r.apply(&claim(id, OTHER), 0.0, &joints);
        let release = PossessionEvent::Release {
            id,
            prior_participant: OTHER,
            pose: Pose::from_position(Vec3::X),
        };
        assert_eq!(r.apply(&release, 0.0, &joints), Applied::Updated(id));
        let hash = r.state_hash();
        assert!(r.apply(&release, 0.1, &joints).is_ignored());
        assert_eq!(r.state_hash(), hash);
        assert_eq!(r.record(id).unwrap().pose, Pose::from_position(Vec3::X));
    }

    #[test]
    fn release_after_reclaim_by_someone_else_is_ignored() {
        let (mut r, joints, id) = setup();
        r.apply(&claim(id, OTHER), 0.0, &joints);
        r.apply(&claim(id, ParticipantId(3)), 0.0, &joints);
        let out = r.apply(
            &PossessionEvent::Release {
                id,
                prior_participant: OTHER,
                pose: Pose::IDENTITY,
            },
            0.0,
            &joints,
        );
        assert!(out.is_ignored());
        assert_eq!(r.record(id).unwrap().holder(), Some(ParticipantId(3)));
    }

    #[test]
    fn floating_updates_record_and_starts_interpolation() {
        let (mut r, joints, id) = setup();
        let pose = Pose::from_position(Vec3::new(2.0, 0.0, 0.0));
        r.apply(&PossessionEvent::FloatingPosition { id, pose }, 0.0, &joints);
        assert_eq!(r.record(id).unwrap().pose, pose);
        assert_eq!(r.active_len(), 1);
        r.update(0.5, &joints);
        assert_eq!(r.pose(id), Some(pose));
        assert_eq!(r.active_len(), 0);
    }

    #[test]
    fn local_holder_keeps_prediction_but_takes_flags() {
        let (mut r, mut joints, id) = setup();
        joints.0.insert((ME, Handedness::Right), Pose::default());
        r.grab_begin(id, Handedness::Right, true, 0.0, &joints);
        r.drain_outbox();
        r.apply(&claim(id, ME), 0.0, &joints);
        r.apply(
            &PossessionEvent::FloatingPosition {
                id,
                pose: Pose::from_position(Vec3::splat(5.0)),
            },
            0.0,
            &joints,
        );
        let possession = r.instance(id).unwrap().possession();
        assert!(possession.state().is_sending());
        assert_eq!(possession.pose(), Pose::from_position(Vec3::Y));
        assert_eq!(r.record(id).unwrap().pose, Pose::from_position(Vec3::splat(5.0)));
    }

    #[test]
    fn despawn_pools_the_instance() {
        let (mut r, joints, id) = setup();
        assert_eq!(
            r.apply(&PossessionEvent::Despawn { id }, 0.0, &joints),
            Applied::Despawned(id)
        );
        assert!(r.record(id).is_none());
        assert_eq!(r.free_len(ArchetypeIndex(0)), 1);
        let again = r.apply(
            &PossessionEvent::Spawn {
                archetype: ArchetypeIndex(0),
                pose: Pose::default(),
            },
            0.0,
            &joints,
        );
        assert_eq!(again, Applied::Spawned(ObjectId(2)));
        assert_eq!(r.free_len(ArchetypeIndex(0)), 1);
        r.update(0.0, &joints);
        assert_eq!(r.free_len(ArchetypeIndex(0)), 0);
        assert_eq!(r.instance_count(), 1);
    }

    #[test]
    fn events_before_the_instance_is_bound_update_the_record() {
        let mut r = Registry::new(ME, SyncConfig::default());
        let mut joints = Joints::default();
        joints.0.insert((OTHER, Handedness::Right), Pose::from_position(Vec3::X));
        let spawn = PossessionEvent::Spawn {
            archetype: ArchetypeIndex(0),
            pose: Pose::default(),
        };
        assert_eq!(r.apply(&spawn, 0.0, &joints), Applied::Spawned(ObjectId(1)));
        assert_eq!(r.apply(&spawn, 0.0, &joints), Applied::Spawned(ObjectId(2)));
        let (first, second) = (ObjectId(1), ObjectId(2));

        assert_eq!(r.apply(&claim(second, OTHER), 0.0, &joints), Applied::Updated(second));
        let offset = Pose::from_position(Vec3::new(0.0, 0.0, 0.1));
        let attach = PossessionEvent::Attach {
            id: second,
            participant: OTHER,
            offset,
        };
        assert_eq!(r.apply(&attach, 0.0, &joints), Applied::Updated(second));
        assert!(r.instance(second).is_none());
        assert!(r.record(second).unwrap().is_attached());

        r.update(0.0, &joints);
        assert!(r.instance(first).is_some());
        assert!(r.instance(second).is_none());
        r.update(0.0, &joints);
        assert!(matches!(
            r.instance(second).unwrap().possession().state(),
            PossessionState::ReceivingMovingToHolder(_)
        ));
        r.update(1.0, &joints);
        let landed = r.pose(second).unwrap().position;
        assert!((landed - Vec3::new(1.0, 0.0, 0.1)).length() < 1e-5);
    }
}
