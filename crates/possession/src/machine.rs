use grabsync_common::frame;
use grabsync_common::{Handedness, ObjectId, ParticipantId, Pose, PossessionEvent};

use crate::config::PossessionConfig;
use crate::state::{AttachedSend, Interpolation, OffsetSampler, PossessionState};

/// Live pose of each participant's grab joints, supplied by the avatar layer.
///
/// Returns `None` while the data is unavailable (e.g. mid-disconnect); the
/// affected pose update is skipped for that frame.
pub trait JointSource {
    fn joint_pose(&self, participant: ParticipantId, hand: Handedness) -> Option<Pose>;
}

/// A participant's hand holding the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub participant: ParticipantId,
    pub hand: Handedness,
}

/// Everything a possession needs from the surrounding frame.
pub struct StepContext<'a> {
    pub now: f64,
    pub local: ParticipantId,
    pub config: &'a PossessionConfig,
    pub joints: &'a dyn JointSource,
    /// Events to submit to the ordered log.
    pub outbox: &'a mut Vec<PossessionEvent>,
}

impl StepContext<'_> {
    fn joint(&self, holder: Holder) -> Option<Pose> {
        self.joints.joint_pose(holder.participant, holder.hand)
    }
}

/// Local-only possession state machine of one live instance.
///
/// Drives the instance's visual pose: predicted from the local hand while the
/// local participant holds it, interpolated toward confirmed state otherwise.
#[derive(Debug, Clone)]
pub struct ObjectPossession {
    id: ObjectId,
    pose: Pose,
    state: PossessionState,
    /// The grab is physically active on this participant.
    held_locally: bool,
    holder: Option<Holder>,
    attached: bool,
    /// Grab offset relative to the holder's joint: predicted while sending,
    /// confirmed target while receiving.
    offset: Pose,
    /// Confirmed free-floating world pose.
    target: Pose,
    next_floating_send: f64,
}

impl ObjectPossession {
    pub fn new(id: ObjectId, pose: Pose) -> Self {
        Self {
            id,
            pose,
            state: PossessionState::Idle,
            held_locally: false,
            holder: None,
            attached: false,
            offset: Pose::IDENTITY,
            target: pose,
            next_floating_send: f64::NEG_INFINITY,
        }
    }

    /// Rebind to another object, dropping every trace of the previous one.
    pub fn reset(&mut self, id: ObjectId, pose: Pose) {
        *self = Self::new(id, pose);
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn state(&self) -> &PossessionState {
        &self.state
    }

    pub fn holder(&self) -> Option<Holder> {
        self.holder
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn offset(&self) -> Pose {
        self.offset
    }

    pub fn target(&self) -> Pose {
        self.target
    }

    pub fn is_held_locally(&self) -> bool {
        self.held_locally
    }

    /// Pose written by the physics/input layer, e.g. while a hand drags the
    /// object before its offset has settled.
    pub fn sync_body_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    fn held_by(&self, participant: ParticipantId) -> bool {
        self.holder.is_some_and(|h| h.participant == participant)
    }

    fn transition(&mut self, next: PossessionState) {
        if self.state.name() != next.name() {
            tracing::debug!(
                id = %self.id,
                from = %self.state,
                to = %next,
                "possession state change"
            );
        }
        self.state = next;
    }

    /// Drop to `Idle` without emitting anything. Used on despawn.
    pub fn force_idle(&mut self) {
        self.held_locally = false;
        self.transition(PossessionState::Idle);
    }

    // --- local input ---

    /// The local participant grabbed the object with `hand`.
    pub fn begin_grab(&mut self, cx: &mut StepContext<'_>, hand: Handedness, vr: bool) {
        if self.held_locally {
            return;
        }
        let holder = Holder {
            participant: cx.local,
            hand,
        };
        self.held_locally = true;
        self.holder = Some(holder);
        self.attached = false;
        cx.outbox.push(PossessionEvent::ClaimPossession {
            id: self.id,
            participant: cx.local,
            hand,
        });

        let previous = cx.joint(holder).map(|joint| frame::to_local(&joint, &self.pose));
        if previous.is_none() {
            tracing::debug!(id = %self.id, "grab joint unavailable, offset sampler starts empty");
        }
        let sampler = OffsetSampler::new(vr, previous, cx.now, cx.config.gate(vr));
        self.next_floating_send = cx.now;
        self.transition(PossessionState::WaitingForConsistentOffset(sampler));
    }

    /// The local participant let go of the object.
    pub fn end_grab(&mut self, cx: &mut StepContext<'_>) {
        if !self.held_locally {
            return;
        }
        self.held_locally = false;
        if self.state.is_receiving() {
            // Replication already handed the object to someone else.
            tracing::debug!(id = %self.id, "release overtaken by replicated state");
            return;
        }
        if self.state.is_sending() || self.held_by(cx.local) {
            cx.outbox.push(PossessionEvent::Release {
                id: self.id,
                prior_participant: cx.local,
                pose: self.pose,
            });
        }
        self.transition(PossessionState::Idle);
    }

    // --- per frame ---

    /// Advance one frame. Only called for instances in the active set.
    pub fn tick(&mut self, cx: &mut StepContext<'_>) {
        match self.state {
            PossessionState::Idle => {
                tracing::error!(id = %self.id, "idle possession ticked");
            }
            PossessionState::WaitingForConsistentOffset(sampler) => self.tick_waiting(cx, sampler),
            PossessionState::AttachedSending(send) => self.tick_attached(cx, send),
            PossessionState::ReceivingFloating(_)
            | PossessionState::ReceivingMovingToHolder(_)
            | PossessionState::ReceivingAttached => self.tick_receiver(cx),
        }
    }

    fn tick_waiting(&mut self, cx: &mut StepContext<'_>, mut sampler: OffsetSampler) {
        let Some(holder) = self.holder else {
            tracing::error!(id = %self.id, "waiting for offset without a holder");
            self.transition(PossessionState::Idle);
            return;
        };
        if let Some(joint) = cx.joint(holder) {
            let sample = frame::to_local(&joint, &self.pose);
            if sampler.observe(sample, cx.now, cx.config.gate(sampler.vr)) {
                self.offset = sample;
                let send = AttachedSend {
                    vr: sampler.vr,
                    rotating: false,
                    next_rotation_check: cx.now + cx.config.rotation_watch.interval,
                    slow_down_at: cx.now,
                };
                self.transition(PossessionState::AttachedSending(send));
                self.send_attach(cx);
                return;
            }
            self.state = PossessionState::WaitingForConsistentOffset(sampler);
        }
        // Still floating in the hand; let observers follow along.
        if cx.now >= self.next_floating_send {
            self.next_floating_send = cx.now + cx.config.floating_send_interval;
            cx.outbox.push(PossessionEvent::FloatingPosition {
                id: self.id,
                pose: self.pose,
            });
        }
    }

    fn tick_attached(&mut self, cx: &mut StepContext<'_>, mut send: AttachedSend) {
        let Some(holder) = self.holder else {
            tracing::error!(id = %self.id, "attached without a holder");
            self.transition(PossessionState::Idle);
            return;
        };
        let Some(joint) = cx.joint(holder) else {
            return;
        };
        let follow = cx.config.local_attachment(send.vr);
        if send.vr {
            if follow {
                self.pose = frame::to_world(&joint, &self.offset);
            }
            return;
        }

        // Desktop: position follows the hand, rotation is free and re-synced.
        if follow {
            self.pose.position = frame::to_world(&joint, &self.offset).position;
        }
        let watch = cx.config.rotation_watch;
        if cx.now < send.next_rotation_check {
            return;
        }
        let local_rotation = (joint.rotation.inverse() * self.pose.rotation).normalize();
        if frame::angle_degrees(self.offset.rotation, local_rotation) > watch.tolerance_deg {
            send.rotating = true;
            send.slow_down_at =
                send.next_rotation_check + watch.fast_interval * f64::from(watch.fast_falloff);
            self.offset.rotation = local_rotation;
            self.send_attach(cx);
        } else if cx.now >= send.slow_down_at {
            send.rotating = false;
        }
        send.next_rotation_check += if send.rotating {
            watch.fast_interval
        } else {
            watch.interval
        };
        // After a long hitch, resume the cadence from now instead of catching up.
        if send.next_rotation_check < cx.now {
            send.next_rotation_check = cx.now;
        }
        self.transition(PossessionState::AttachedSending(send));
    }

    fn send_attach(&mut self, cx: &mut StepContext<'_>) {
        cx.outbox.push(PossessionEvent::Attach {
            id: self.id,
            participant: cx.local,
            offset: self.offset,
        });
    }

    fn tick_receiver(&mut self, cx: &mut StepContext<'_>) {
        if self.held_locally {
            tracing::error!(id = %self.id, state = %self.state, "receiving while held locally");
            return;
        }
        let duration = cx.config.interpolation_duration;
        match self.state {
            PossessionState::ReceivingFloating(interp) => {
                let t = interp.fraction(cx.now, duration);
                self.pose = frame::interpolate(&interp.start, &self.target, t);
                if t >= 1.0 {
                    self.transition(PossessionState::Idle);
                }
            }
            PossessionState::ReceivingMovingToHolder(interp) => {
                let Some(joint) = self.holder.and_then(|h| cx.joint(h)) else {
                    return;
                };
                let t = interp.fraction(cx.now, duration);
                let local = frame::interpolate(&interp.start, &self.offset, t);
                self.pose = frame::to_world(&joint, &local);
                if t >= 1.0 {
                    self.transition(PossessionState::ReceivingAttached);
                }
            }
            PossessionState::ReceivingAttached => {
                let Some(holder) = self.holder else {
                    tracing::error!(id = %self.id, "receiving attached without a holder");
                    self.transition(PossessionState::Idle);
                    return;
                };
                if let Some(joint) = cx.joint(holder) {
                    self.pose = frame::to_world(&joint, &self.offset);
                }
            }
            _ => {}
        }
    }

    // --- confirmed state from the event log ---

    /// Enter a receiving state unless the object is held here, which would
    /// mean two writers of the same pose.
    fn enter_receiving(&mut self, next: PossessionState) {
        if self.held_locally {
            tracing::error!(id = %self.id, to = %next, "refusing to receive while held locally");
            return;
        }
        self.transition(next);
    }

    /// A claim-possession event was applied.
    pub fn confirm_holder(
        &mut self,
        cx: &mut StepContext<'_>,
        participant: ParticipantId,
        hand: Handedness,
    ) {
        self.holder = Some(Holder { participant, hand });
        self.attached = false;
        if participant == cx.local {
            // Our own claim came back; the prediction already covers it.
            return;
        }
        if self.held_locally {
            tracing::warn!(
                id = %self.id,
                by = %participant,
                "object claimed elsewhere while held locally"
            );
        }
        if !matches!(self.state, PossessionState::ReceivingFloating(_)) {
            self.transition(PossessionState::Idle);
        }
    }

    /// An attach event from the current holder was applied.
    pub fn confirm_attach(&mut self, cx: &mut StepContext<'_>, offset: Pose) {
        self.attached = true;
        let Some(holder) = self.holder else {
            return;
        };
        if holder.participant == cx.local {
            return;
        }
        if self.held_locally {
            tracing::error!(id = %self.id, "attach for another holder while held locally");
            return;
        }
        // Interpolate from where the object currently appears, in hand space.
        let start = match self.state {
            PossessionState::ReceivingAttached => self.offset,
            _ => match cx.joint(holder) {
                Some(joint) => frame::to_local(&joint, &self.pose),
                None => offset,
            },
        };
        self.offset = offset;
        self.transition(PossessionState::ReceivingMovingToHolder(Interpolation::new(
            start, cx.now,
        )));
    }

    /// A matching release event was applied.
    pub fn confirm_release(&mut self, cx: &mut StepContext<'_>, pose: Pose) {
        let was_local = self.held_by(cx.local);
        self.holder = None;
        self.attached = false;
        self.target = pose;
        if was_local {
            if self.state.is_sending() {
                // Released on our behalf (e.g. by the authority) while still
                // held here: stop predicting.
                self.transition(PossessionState::Idle);
            }
            return;
        }
        let interp = Interpolation::new(self.pose, cx.now);
        self.enter_receiving(PossessionState::ReceivingFloating(interp));
    }

    /// A floating-position event was applied.
    pub fn confirm_floating(&mut self, cx: &mut StepContext<'_>, pose: Pose) {
        self.target = pose;
        if self.held_by(cx.local) {
            return;
        }
        let interp = Interpolation::new(self.pose, cx.now);
        self.enter_receiving(PossessionState::ReceivingFloating(interp));
    }
}
