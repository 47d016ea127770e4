use grabsync_common::{
    ArchetypeIndex, EventKind, Handedness, ObjectId, ParticipantId, Pose, PossessionEvent,
};
use grabsync_possession::JointSource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::apply::Applied;
use crate::registry::Registry;
use crate::transfer::{StateTransfer, TransferError, TransferMode};

/// The ordered event log and session membership, as provided by the
/// surrounding networking layer.
///
/// Everything sent is delivered to every participant, the sender included,
/// in one total order.
pub trait Substrate {
    fn send(&mut self, kind: EventKind, payload: Vec<u8>);
    fn local_participant(&self) -> ParticipantId;
    fn is_authority(&self) -> bool;
    fn is_participant(&self, participant: ParticipantId) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("CBOR encode error: {0}")]
    Encode(String),
    #[error("CBOR decode error: {0}")]
    Decode(String),
    #[error("payload is a {actual} event, delivered as {expected}")]
    KindMismatch { expected: EventKind, actual: EventKind },
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("state transfer rejected: {0}")]
    Transfer(#[from] TransferError),
}

pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

pub fn encode_event(event: &PossessionEvent) -> Result<Vec<u8>, WireError> {
    to_cbor(event)
}

/// Decode a payload and check it against the kind tag it arrived with.
pub fn decode_event(kind: EventKind, payload: &[u8]) -> Result<PossessionEvent, WireError> {
    let event: PossessionEvent = from_cbor(payload)?;
    if event.kind() != kind {
        return Err(WireError::KindMismatch {
            expected: kind,
            actual: event.kind(),
        });
    }
    Ok(event)
}

/// Bridges one participant's [`Registry`] and its [`Substrate`].
///
/// Submits locally produced events, applies delivered ones, reacts to
/// membership changes and handles state transfer for late joiners.
#[derive(Debug)]
pub struct SyncGateway<S> {
    substrate: S,
    registry: Registry,
}

impl<S: Substrate> SyncGateway<S> {
    pub fn new(substrate: S, registry: Registry) -> Self {
        if substrate.local_participant() != registry.local() {
            tracing::warn!(
                substrate = %substrate.local_participant(),
                registry = %registry.local(),
                "substrate and registry disagree on the local participant"
            );
        }
        Self {
            substrate,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn substrate_mut(&mut self) -> &mut S {
        &mut self.substrate
    }

    /// Tick the registry and submit whatever it produced.
    pub fn update(&mut self, now: f64, joints: &dyn JointSource) -> usize {
        self.registry.update(now, joints);
        self.flush()
    }

    /// Submit every pending local event. Returns how many were sent.
    pub fn flush(&mut self) -> usize {
        let mut sent = 0;
        for event in self.registry.drain_outbox() {
            match encode_event(&event) {
                Ok(payload) => {
                    tracing::debug!(
                        kind = %event.kind(),
                        id = ?event.object(),
                        "submitting event"
                    );
                    self.substrate.send(event.kind(), payload);
                    sent += 1;
                }
                Err(e) => {
                    tracing::error!(kind = %event.kind(), error = %e, "dropping unencodable event")
                }
            }
        }
        sent
    }

    /// Apply one delivered event. Undecodable payloads are logged and
    /// skipped.
    pub fn on_event(
        &mut self,
        kind: EventKind,
        payload: &[u8],
        now: f64,
        joints: &dyn JointSource,
    ) -> Option<Applied> {
        match decode_event(kind, payload) {
            Ok(event) => Some(self.registry.apply(&event, now, joints)),
            Err(e) => {
                tracing::warn!(%kind, error = %e, "discarding malformed event");
                None
            }
        }
    }

    // --- local requests ---

    pub fn grab_begin(
        &mut self,
        id: ObjectId,
        hand: Handedness,
        vr: bool,
        now: f64,
        joints: &dyn JointSource,
    ) -> bool {
        self.registry.grab_begin(id, hand, vr, now, joints)
    }

    pub fn grab_end(&mut self, id: ObjectId, now: f64, joints: &dyn JointSource) -> bool {
        self.registry.grab_end(id, now, joints)
    }

    pub fn request_spawn(&mut self, archetype: ArchetypeIndex, pose: Pose) -> bool {
        self.registry.request_spawn(archetype, pose)
    }

    pub fn request_despawn(&mut self, id: ObjectId) -> bool {
        let authority = self.substrate.is_authority();
        self.registry.request_despawn(id, authority)
    }

    // --- membership ---

    /// A participant left. The authority releases everything it still held.
    pub fn on_participant_left(&mut self, participant: ParticipantId) -> usize {
        if !self.substrate.is_authority() {
            return 0;
        }
        let released = self.registry.release_departed(participant);
        if released > 0 {
            tracing::debug!(%participant, released, "released objects of departed participant");
        }
        self.flush();
        released
    }

    /// Authority moved. If it moved here, release objects whose holder left
    /// while no authority was watching.
    pub fn on_authority_changed(&mut self) -> usize {
        if !self.substrate.is_authority() {
            return 0;
        }
        let substrate = &self.substrate;
        let released = self.registry.release_orphans(|p| substrate.is_participant(p));
        if released > 0 {
            tracing::debug!(released, "released objects of absent holders");
        }
        self.flush();
        released
    }

    // --- state transfer ---

    pub fn capture_state(&self) -> StateTransfer {
        self.registry.capture_state()
    }

    pub fn serialize_state(&self) -> Result<Vec<u8>, WireError> {
        to_cbor(&self.registry.capture_state())
    }

    pub fn deserialize_state(
        &mut self,
        bytes: &[u8],
        mode: TransferMode,
    ) -> Result<Vec<ObjectId>, GatewayError> {
        let state: StateTransfer = from_cbor(bytes)?;
        Ok(self.registry.load_state(&state, mode)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use glam::Vec3;

    #[derive(Default)]
    struct Recorder {
        local: u32,
        authority: bool,
        members: Vec<ParticipantId>,
        sent: Vec<(EventKind, Vec<u8>)>,
    }

    impl Substrate for Recorder {
        fn send(&mut self, kind: EventKind, payload: Vec<u8>) {
            self.sent.push((kind, payload));
        }
        fn local_participant(&self) -> ParticipantId {
            ParticipantId(self.local)
        }
        fn is_authority(&self) -> bool {
            self.authority
        }
        fn is_participant(&self, participant: ParticipantId) -> bool {
            self.members.contains(&participant)
        }
    }

    struct NoJoints;

    impl JointSource for NoJoints {
        fn joint_pose(&self, _: ParticipantId, _: Handedness) -> Option<Pose> {
            None
        }
    }

    fn gateway(authority: bool) -> SyncGateway<Recorder> {
        let substrate = Recorder {
            local: 1,
            authority,
            members: vec![ParticipantId(1)],
            ..Recorder::default()
        };
        SyncGateway::new(substrate, Registry::new(ParticipantId(1), SyncConfig::default()))
    }

    /// Deliver everything the gateway sent back to itself.
    fn loop_back(g: &mut SyncGateway<Recorder>) -> Vec<Option<Applied>> {
        let sent = std::mem::take(&mut g.substrate_mut().sent);
        sent.iter()
            .map(|(kind, payload)| g.on_event(*kind, payload, 0.0, &NoJoints))
            .collect()
    }

    #[test]
    fn decode_checks_the_kind_tag() {
        let event = PossessionEvent::Despawn { id: ObjectId(3) };
        let payload = encode_event(&event).unwrap();
        assert_eq!(decode_event(EventKind::Despawn, &payload).unwrap(), event);
        assert!(matches!(
            decode_event(EventKind::Release, &payload),
            Err(WireError::KindMismatch {
                expected: EventKind::Release,
                actual: EventKind::Despawn
            })
        ));
        assert!(matches!(
            decode_event(EventKind::Despawn, &[0xff, 0x00]),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn flush_sends_in_production_order() {
        let mut g = gateway(true);
        g.request_spawn(ArchetypeIndex(0), Pose::default());
        g.request_spawn(ArchetypeIndex(0), Pose::from_position(Vec3::X));
        assert_eq!(g.flush(), 2);
        assert_eq!(g.flush(), 0);
        let applied = loop_back(&mut g);
        assert_eq!(
            applied,
            vec![
                Some(Applied::Spawned(ObjectId(1))),
                Some(Applied::Spawned(ObjectId(2)))
            ]
        );
        assert_eq!(g.registry().record(ObjectId(2)).unwrap().pose, Pose::from_position(Vec3::X));
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let mut g = gateway(true);
        assert_eq!(g.on_event(EventKind::Spawn, b"nope", 0.0, &NoJoints), None);
        assert_eq!(g.registry().object_count(), 0);
    }

    #[test]
    fn only_the_authority_releases_for_leavers() {
        for authority in [false, true] {
            let mut g = gateway(authority);
            g.request_spawn(ArchetypeIndex(0), Pose::default());
            g.flush();
            loop_back(&mut g);
            let claim = PossessionEvent::ClaimPossession {
                id: ObjectId(1),
                participant: ParticipantId(2),
                hand: Handedness::Right,
            };
            g.registry_mut().apply(&claim, 0.0, &NoJoints);

            let released = g.on_participant_left(ParticipantId(2));
            assert_eq!(released, usize::from(authority));
            assert_eq!(g.substrate().sent.len(), usize::from(authority));
        }
    }

    #[test]
    fn new_authority_releases_orphans() {
        let mut g = gateway(false);
        g.request_spawn(ArchetypeIndex(0), Pose::default());
        g.flush();
        loop_back(&mut g);
        g.registry_mut().apply(
            &PossessionEvent::ClaimPossession {
                id: ObjectId(1),
                participant: ParticipantId(7),
                hand: Handedness::Left,
            },
            0.0,
            &NoJoints,
        );
        assert_eq!(g.on_authority_changed(), 0);

        g.substrate_mut().authority = true;
        assert_eq!(g.on_authority_changed(), 1);
        loop_back(&mut g);
        assert_eq!(g.registry().record(ObjectId(1)).unwrap().holder(), None);
    }

    #[test]
    fn despawn_request_uses_substrate_authority() {
        let mut g = gateway(false);
        g.request_spawn(ArchetypeIndex(0), Pose::default());
        g.flush();
        loop_back(&mut g);
        assert!(!g.request_despawn(ObjectId(1)));
        g.substrate_mut().authority = true;
        assert!(g.request_despawn(ObjectId(1)));
    }

    #[test]
    fn state_round_trips_through_bytes() {
        let mut g = gateway(true);
        g.request_spawn(ArchetypeIndex(0), Pose::from_position(Vec3::Y));
        g.flush();
        loop_back(&mut g);
        let bytes = g.serialize_state().unwrap();

        let mut joiner = gateway(false);
        let ids = joiner
            .deserialize_state(&bytes, TransferMode::Join)
            .unwrap();
        assert_eq!(ids, vec![ObjectId(1)]);
        assert_eq!(joiner.registry().state_hash(), g.registry().state_hash());
        assert!(matches!(
            joiner.deserialize_state(b"junk", TransferMode::Join),
            Err(GatewayError::Wire(_))
        ));
    }
}
