use grabsync_common::{
    ArchetypeIndex, Fnv1a, Handedness, ObjectId, ParticipantId, Pose, PossessionEvent,
};
use grabsync_possession::{JointSource, ObjectPossession, StepContext};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::config::SyncConfig;
use crate::record::{Holding, ObjectRecord};

/// A pooled live instance. Bound to one object id at a time while enabled.
#[derive(Debug, Clone)]
pub struct LiveInstance {
    archetype: ArchetypeIndex,
    enabled: bool,
    /// Position in the registry's active set, if in it.
    active_index: Option<usize>,
    possession: ObjectPossession,
}

impl LiveInstance {
    pub fn archetype(&self) -> ArchetypeIndex {
        self.archetype
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.active_index.is_some()
    }

    pub fn possession(&self) -> &ObjectPossession {
        &self.possession
    }
}

/// Object registry of one participant.
///
/// Owns the canonical records (changed only by [`Registry::apply`]), the live
/// instances bound to them, per-archetype free lists and the active set of
/// instances that need a per-frame update. Local input never touches records;
/// it produces events in the outbox which the gateway submits to the log.
///
/// A record exists as soon as its spawn is applied, but its live instance is
/// bound later by [`Registry::update`], at most
/// [`SyncConfig::spawns_per_update`] per call.
#[derive(Debug)]
pub struct Registry {
    local: ParticipantId,
    config: SyncConfig,
    next_id: ObjectId,
    pub(crate) records: BTreeMap<ObjectId, ObjectRecord>,
    bindings: HashMap<ObjectId, usize>,
    instances: Vec<LiveInstance>,
    /// Records still waiting for a live instance, in spawn order.
    pending: VecDeque<ObjectId>,
    /// Free instance slots per archetype, reused last-in first-out.
    free: Vec<Vec<usize>>,
    active: Vec<usize>,
    outbox: Vec<PossessionEvent>,
}

impl Registry {
    pub fn new(local: ParticipantId, config: SyncConfig) -> Self {
        let free = vec![Vec::new(); config.archetype_count()];
        Self {
            local,
            config,
            next_id: ObjectId::FIRST,
            records: BTreeMap::new(),
            bindings: HashMap::new(),
            instances: Vec::new(),
            pending: VecDeque::new(),
            free,
            active: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Id the next applied spawn will receive.
    pub fn next_id(&self) -> ObjectId {
        self.next_id
    }

    pub fn object_count(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.records.get(&id)
    }

    /// All records in id order.
    pub fn records(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.records.values()
    }

    pub fn instance(&self, id: ObjectId) -> Option<&LiveInstance> {
        self.bindings.get(&id).map(|&slot| &self.instances[slot])
    }

    /// Visual pose of an object's live instance.
    pub fn pose(&self, id: ObjectId) -> Option<Pose> {
        self.instance(id).map(|i| i.possession.pose())
    }

    /// Number of instances currently updated every frame.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Every instance ever constructed, bound or pooled.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Records whose live instance has not been bound yet.
    pub fn pending_spawn_len(&self) -> usize {
        self.pending.len()
    }

    /// Pooled instances waiting for reuse.
    pub fn free_len(&self, archetype: ArchetypeIndex) -> usize {
        self.free.get(archetype.index()).map_or(0, Vec::len)
    }

    pub fn is_known_archetype(&self, archetype: ArchetypeIndex) -> bool {
        archetype.index() < self.free.len()
    }

    /// Events produced locally and not yet submitted.
    pub fn pending_events(&self) -> &[PossessionEvent] {
        &self.outbox
    }

    /// Take the outbox for submission to the event log.
    pub fn drain_outbox(&mut self) -> Vec<PossessionEvent> {
        std::mem::take(&mut self.outbox)
    }

    // --- per frame ---

    /// Bind the next batch of pending spawns, then tick every instance in the
    /// active set.
    pub fn update(&mut self, now: f64, joints: &dyn JointSource) {
        let _span = tracing::info_span!(
            "registry_update",
            active = self.active.len(),
            pending = self.pending.len()
        )
        .entered();
        for _ in 0..self.config.spawns_per_update {
            if self.bind_next_pending(now, joints).is_none() {
                break;
            }
        }
        // Backwards, so a swap-remove only moves an already updated entry.
        for index in (0..self.active.len()).rev() {
            let Some(&slot) = self.active.get(index) else {
                continue;
            };
            self.drive(slot, now, joints, |p, cx| p.tick(cx));
        }
    }

    // --- local input ---

    /// The local participant grabbed `id`. Returns false for unknown objects.
    pub fn grab_begin(
        &mut self,
        id: ObjectId,
        hand: Handedness,
        vr: bool,
        now: f64,
        joints: &dyn JointSource,
    ) -> bool {
        let Some(&slot) = self.bindings.get(&id) else {
            tracing::debug!(%id, "grab of object without a live instance");
            return false;
        };
        self.drive(slot, now, joints, |p, cx| p.begin_grab(cx, hand, vr));
        true
    }

    /// The local participant let go of `id`.
    pub fn grab_end(&mut self, id: ObjectId, now: f64, joints: &dyn JointSource) -> bool {
        let Some(&slot) = self.bindings.get(&id) else {
            tracing::debug!(%id, "release of object without a live instance");
            return false;
        };
        self.drive(slot, now, joints, |p, cx| p.end_grab(cx));
        true
    }

    /// Pose written by local physics or input for an object's instance.
    pub fn sync_body_pose(&mut self, id: ObjectId, pose: Pose) -> bool {
        match self.bindings.get(&id) {
            Some(&slot) => {
                self.instances[slot].possession.sync_body_pose(pose);
                true
            }
            None => false,
        }
    }

    /// Ask the session to create an object. The id is assigned when the
    /// spawn event is applied.
    pub fn request_spawn(&mut self, archetype: ArchetypeIndex, pose: Pose) -> bool {
        if !self.is_known_archetype(archetype) {
            tracing::warn!(archetype = archetype.0, "spawn request for unregistered archetype");
            return false;
        }
        self.outbox.push(PossessionEvent::Spawn { archetype, pose });
        true
    }

    /// Whether the local participant may despawn `id`: the confirmed holder of
    /// an attached object, otherwise the authority.
    pub fn controls(&self, id: ObjectId, is_authority: bool) -> bool {
        match self.records.get(&id) {
            Some(record) if record.is_attached() => record.holder() == Some(self.local),
            Some(_) => is_authority,
            None => false,
        }
    }

    /// Ask the session to destroy `id`. Refused unless the local participant
    /// controls the object.
    pub fn request_despawn(&mut self, id: ObjectId, is_authority: bool) -> bool {
        if !self.controls(id, is_authority) {
            tracing::debug!(%id, "despawn request refused, not in control");
            return false;
        }
        self.outbox.push(PossessionEvent::Despawn { id });
        true
    }

    // --- membership ---

    /// Queue releases for every object still held by a participant that left.
    /// Only the authority calls this.
    pub fn release_departed(&mut self, participant: ParticipantId) -> usize {
        self.release_where(|holder| holder == participant)
    }

    /// Queue releases for every object whose holder is no longer in the
    /// session. Run by a newly promoted authority.
    pub fn release_orphans(&mut self, is_participant: impl Fn(ParticipantId) -> bool) -> usize {
        self.release_where(|holder| !is_participant(holder))
    }

    fn release_where(&mut self, stale: impl Fn(ParticipantId) -> bool) -> usize {
        let releases: Vec<PossessionEvent> = self
            .records
            .values()
            .filter_map(|record| {
                let holder = record.holder().filter(|&h| stale(h))?;
                let pose = self
                    .instance(record.id)
                    .map_or(record.pose, |i| i.possession.pose());
                Some(PossessionEvent::Release {
                    id: record.id,
                    prior_participant: holder,
                    pose,
                })
            })
            .collect();
        for event in &releases {
            if let PossessionEvent::Release {
                id,
                prior_participant,
                ..
            } = event
            {
                tracing::debug!(
                    %id,
                    holder = %prior_participant,
                    "releasing absent holder's object"
                );
            }
        }
        let count = releases.len();
        self.outbox.extend(releases);
        count
    }

    /// FNV-1a hash of the canonical records. Equal on every replica that has
    /// applied the same prefix of the log.
    pub fn state_hash(&self) -> u64 {
        let mix_pose = |h: &mut Fnv1a, pose: &Pose| {
            for v in pose.position.to_array() {
                h.write(&v.to_le_bytes());
            }
            for v in pose.rotation.to_array() {
                h.write(&v.to_le_bytes());
            }
        };
        let mut h = Fnv1a::new();
        h.write(&self.next_id.0.to_le_bytes());
        for record in self.records.values() {
            h.write(&record.id.0.to_le_bytes());
            h.write(&record.archetype.0.to_le_bytes());
            mix_pose(&mut h, &record.pose);
            match record.holding {
                Some(holding) => {
                    h.write(&holding.participant.0.to_le_bytes());
                    h.write(&[holding.hand as u8]);
                    if let Some(offset) = holding.offset {
                        mix_pose(&mut h, &offset);
                    }
                }
                None => h.write(&[0xff]),
            }
        }
        h.finish()
    }

    // --- record and instance plumbing, used by event application ---

    /// Reserve the next unused object id.
    pub(crate) fn allocate_id(&mut self) -> ObjectId {
        let mut id = self.next_id;
        while self.records.contains_key(&id) {
            id = id.next();
        }
        self.next_id = id.next();
        id
    }

    pub(crate) fn set_next_id(&mut self, next_id: ObjectId) {
        self.next_id = next_id;
    }

    /// Insert a record and queue it for a live instance.
    pub(crate) fn insert_record(&mut self, record: ObjectRecord) {
        let id = record.id;
        self.records.insert(id, record);
        self.pending.push_back(id);
    }

    /// Bind a live instance to the oldest pending record, replaying the
    /// record's current holder and attachment into its possession.
    fn bind_next_pending(&mut self, now: f64, joints: &dyn JointSource) -> Option<ObjectId> {
        let id = self.pending.pop_front()?;
        let Some(record) = self.records.get(&id) else {
            tracing::error!(%id, "pending spawn without a record");
            return Some(id);
        };
        let (archetype, pose, holding) = (record.archetype, record.pose, record.holding);
        let slot = self.acquire_instance(archetype, id, pose);
        self.bindings.insert(id, slot);
        if let Some(Holding {
            participant,
            hand,
            offset,
        }) = holding
        {
            self.drive(slot, now, joints, |p, cx| {
                p.confirm_holder(cx, participant, hand);
                if let Some(offset) = offset {
                    p.confirm_attach(cx, offset);
                }
            });
        }
        Some(id)
    }

    /// Remove a record and return its instance, if bound, to the pool.
    pub(crate) fn remove_record(&mut self, id: ObjectId) -> Option<ObjectRecord> {
        let record = self.records.remove(&id)?;
        if let Some(slot) = self.bindings.remove(&id) {
            self.instances[slot].possession.force_idle();
            self.mark_inactive(slot);
            let instance = &mut self.instances[slot];
            instance.enabled = false;
            self.free[instance.archetype.index()].push(slot);
            tracing::debug!(%id, slot, "instance returned to pool");
        } else {
            self.pending.retain(|&p| p != id);
            tracing::debug!(%id, "despawned before its instance was bound");
        }
        Some(record)
    }

    /// Remove every record, pooling all instances.
    pub(crate) fn clear(&mut self) {
        let ids: Vec<ObjectId> = self.records.keys().copied().collect();
        for id in ids {
            self.remove_record(id);
        }
    }

    /// Run a possession operation on the instance bound to `id`.
    pub(crate) fn drive_bound<R>(
        &mut self,
        id: ObjectId,
        now: f64,
        joints: &dyn JointSource,
        f: impl FnOnce(&mut ObjectPossession, &mut StepContext<'_>) -> R,
    ) -> Option<R> {
        let Some(&slot) = self.bindings.get(&id) else {
            if self.pending.contains(&id) {
                tracing::trace!(%id, "record updated before its instance was bound");
            } else {
                tracing::error!(%id, "record without a live instance");
            }
            return None;
        };
        Some(self.drive(slot, now, joints, f))
    }

    fn drive<R>(
        &mut self,
        slot: usize,
        now: f64,
        joints: &dyn JointSource,
        f: impl FnOnce(&mut ObjectPossession, &mut StepContext<'_>) -> R,
    ) -> R {
        let mut cx = StepContext {
            now,
            local: self.local,
            config: &self.config.possession,
            joints,
            outbox: &mut self.outbox,
        };
        let result = f(&mut self.instances[slot].possession, &mut cx);
        self.sync_active(slot);
        result
    }

    fn acquire_instance(&mut self, archetype: ArchetypeIndex, id: ObjectId, pose: Pose) -> usize {
        if let Some(slot) = self.free[archetype.index()].pop() {
            let instance = &mut self.instances[slot];
            instance.possession.reset(id, pose);
            instance.enabled = true;
            tracing::debug!(%id, slot, "reusing pooled instance");
            return slot;
        }
        let slot = self.instances.len();
        self.instances.push(LiveInstance {
            archetype,
            enabled: true,
            active_index: None,
            possession: ObjectPossession::new(id, pose),
        });
        tracing::debug!(%id, slot, archetype = archetype.0, "constructed instance");
        slot
    }

    /// Keep active-set membership in step with the possession state.
    fn sync_active(&mut self, slot: usize) {
        let idle = self.instances[slot].possession.state().is_idle();
        match (idle, self.instances[slot].active_index) {
            (true, Some(_)) => self.mark_inactive(slot),
            (false, None) => self.mark_active(slot),
            _ => {}
        }
    }

    fn mark_active(&mut self, slot: usize) {
        let instance = &mut self.instances[slot];
        if instance.active_index.is_none() {
            instance.active_index = Some(self.active.len());
            self.active.push(slot);
        }
    }

    fn mark_inactive(&mut self, slot: usize) {
        let Some(index) = self.instances[slot].active_index.take() else {
            return;
        };
        self.active.swap_remove(index);
        if let Some(&moved) = self.active.get(index) {
            self.instances[moved].active_index = Some(index);
        }
    }
}
