//! In-process substrate: one totally ordered log shared by every participant
//! of a simulated session. Used by tests and the CLI.

use grabsync_common::{ArchetypeIndex, EventKind, Handedness, ObjectId, ParticipantId, Pose};
use grabsync_possession::JointSource;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use crate::config::SyncConfig;
use crate::gateway::{GatewayError, Substrate, SyncGateway};
use crate::registry::Registry;
use crate::transfer::TransferMode;

#[derive(Debug, Default)]
struct HubState {
    log: Vec<(EventKind, Vec<u8>)>,
    members: BTreeSet<ParticipantId>,
}

/// Shared ordered log plus membership. The lowest connected participant id
/// is the authority.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a participant. It receives entries appended from now on.
    pub fn connect(&self, participant: ParticipantId) -> LoopbackSubstrate {
        let mut state = self.state.borrow_mut();
        state.members.insert(participant);
        LoopbackSubstrate {
            hub: self.clone(),
            local: participant,
            cursor: state.log.len(),
        }
    }

    /// Disconnect a participant. Returns true if the authority moved.
    pub fn disconnect(&self, participant: ParticipantId) -> bool {
        let before = self.authority();
        self.state.borrow_mut().members.remove(&participant);
        before != self.authority()
    }

    pub fn authority(&self) -> Option<ParticipantId> {
        self.state.borrow().members.first().copied()
    }

    pub fn log_len(&self) -> usize {
        self.state.borrow().log.len()
    }

    /// Copy of the whole log.
    pub fn entries(&self) -> Vec<(EventKind, Vec<u8>)> {
        self.state.borrow().log.clone()
    }
}

/// One participant's view of a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackSubstrate {
    hub: LoopbackHub,
    local: ParticipantId,
    cursor: usize,
}

impl LoopbackSubstrate {
    /// Entries appended since the last poll, in log order.
    pub fn poll(&mut self) -> Vec<(EventKind, Vec<u8>)> {
        let state = self.hub.state.borrow();
        let fresh = state.log.get(self.cursor..).unwrap_or_default().to_vec();
        self.cursor = state.log.len();
        fresh
    }
}

impl Substrate for LoopbackSubstrate {
    fn send(&mut self, kind: EventKind, payload: Vec<u8>) {
        self.hub.state.borrow_mut().log.push((kind, payload));
    }

    fn local_participant(&self) -> ParticipantId {
        self.local
    }

    fn is_authority(&self) -> bool {
        self.hub.authority() == Some(self.local)
    }

    fn is_participant(&self, participant: ParticipantId) -> bool {
        self.hub.state.borrow().members.contains(&participant)
    }
}

/// Grab joint poses for every participant of a simulated session.
#[derive(Debug, Clone, Default)]
pub struct JointTable {
    joints: HashMap<(ParticipantId, Handedness), Pose>,
}

impl JointTable {
    pub fn set(&mut self, participant: ParticipantId, hand: Handedness, pose: Pose) {
        self.joints.insert((participant, hand), pose);
    }

    pub fn forget(&mut self, participant: ParticipantId) {
        self.joints.retain(|(p, _), _| *p != participant);
    }
}

impl JointSource for JointTable {
    fn joint_pose(&self, participant: ParticipantId, hand: Handedness) -> Option<Pose> {
        self.joints.get(&(participant, hand)).copied()
    }
}

/// Several participants sharing one [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackSession {
    hub: LoopbackHub,
    config: SyncConfig,
    gateways: BTreeMap<ParticipantId, SyncGateway<LoopbackSubstrate>>,
    joints: JointTable,
}

impl LoopbackSession {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            hub: LoopbackHub::new(),
            config,
            gateways: BTreeMap::new(),
            joints: JointTable::default(),
        }
    }

    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }

    pub fn joints(&self) -> &JointTable {
        &self.joints
    }

    pub fn joints_mut(&mut self) -> &mut JointTable {
        &mut self.joints
    }

    pub fn gateway(&self, participant: ParticipantId) -> Option<&SyncGateway<LoopbackSubstrate>> {
        self.gateways.get(&participant)
    }

    pub fn gateway_mut(
        &mut self,
        participant: ParticipantId,
    ) -> Option<&mut SyncGateway<LoopbackSubstrate>> {
        self.gateways.get_mut(&participant)
    }

    /// Add a participant. A late joiner receives the authority's state
    /// before any further events.
    pub fn join(&mut self, participant: ParticipantId, now: f64) -> Result<(), GatewayError> {
        self.deliver(now);
        let snapshot = match self.hub.authority().and_then(|a| self.gateways.get(&a)) {
            Some(authority) => Some(authority.serialize_state()?),
            None => None,
        };
        let substrate = self.hub.connect(participant);
        let registry = Registry::new(participant, self.config.clone());
        let mut gateway = SyncGateway::new(substrate, registry);
        if let Some(bytes) = snapshot {
            gateway.deserialize_state(&bytes, TransferMode::Join)?;
        }
        tracing::debug!(%participant, "participant joined");
        self.gateways.insert(participant, gateway);
        Ok(())
    }

    /// Remove a participant and notify everyone who remains.
    pub fn leave(&mut self, participant: ParticipantId) -> bool {
        if self.gateways.remove(&participant).is_none() {
            return false;
        }
        let authority_moved = self.hub.disconnect(participant);
        self.joints.forget(participant);
        tracing::debug!(%participant, authority_moved, "participant left");
        for gateway in self.gateways.values_mut() {
            gateway.on_participant_left(participant);
            if authority_moved {
                gateway.on_authority_changed();
            }
        }
        true
    }

    pub fn grab_begin(
        &mut self,
        participant: ParticipantId,
        id: ObjectId,
        hand: Handedness,
        vr: bool,
        now: f64,
    ) -> bool {
        match self.gateways.get_mut(&participant) {
            Some(gateway) => gateway.grab_begin(id, hand, vr, now, &self.joints),
            None => false,
        }
    }

    pub fn grab_end(&mut self, participant: ParticipantId, id: ObjectId, now: f64) -> bool {
        match self.gateways.get_mut(&participant) {
            Some(gateway) => gateway.grab_end(id, now, &self.joints),
            None => false,
        }
    }

    pub fn request_spawn(
        &mut self,
        participant: ParticipantId,
        archetype: ArchetypeIndex,
        pose: Pose,
    ) -> bool {
        self.gateways
            .get_mut(&participant)
            .is_some_and(|g| g.request_spawn(archetype, pose))
    }

    pub fn request_despawn(&mut self, participant: ParticipantId, id: ObjectId) -> bool {
        self.gateways
            .get_mut(&participant)
            .is_some_and(|g| g.request_despawn(id))
    }

    /// One frame: every participant ticks and submits, then every
    /// participant applies the log.
    pub fn step(&mut self, now: f64) -> usize {
        for gateway in self.gateways.values_mut() {
            gateway.update(now, &self.joints);
        }
        self.deliver(now)
    }

    /// Submit pending local events and apply everything not yet applied.
    /// Returns the number of entries applied across participants.
    pub fn deliver(&mut self, now: f64) -> usize {
        for gateway in self.gateways.values_mut() {
            gateway.flush();
        }
        let mut applied = 0;
        for gateway in self.gateways.values_mut() {
            for (kind, payload) in gateway.substrate_mut().poll() {
                gateway.on_event(kind, &payload, now, &self.joints);
                applied += 1;
            }
        }
        applied
    }

    pub fn state_hashes(&self) -> Vec<(ParticipantId, u64)> {
        self.gateways
            .iter()
            .map(|(p, g)| (*p, g.registry().state_hash()))
            .collect()
    }

    /// Every participant holds the same canonical records.
    pub fn converged(&self) -> bool {
        let hashes = self.state_hashes();
        hashes.windows(2).all(|w| w[0].1 == w[1].1)
    }
}
