use grabsync_common::frame;
use grabsync_common::Pose;
use std::fmt;

use crate::config::OffsetGate;

/// Samples a holder's grab offset until it has been still for long enough.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetSampler {
    pub vr: bool,
    /// Offset seen on the previous frame. `None` when the joint was
    /// unavailable at the time of the grab.
    pub previous: Option<Pose>,
    pub still_frames: u32,
    /// Earliest time the offset may be accepted.
    pub settle_at: f64,
}

impl OffsetSampler {
    pub fn new(vr: bool, previous: Option<Pose>, now: f64, gate: &OffsetGate) -> Self {
        Self {
            vr,
            previous,
            still_frames: 0,
            settle_at: now + gate.min_duration,
        }
    }

    /// Feed one offset sample. Returns true once the offset has stayed within
    /// tolerance for both the frame count and the duration of `gate`.
    pub fn observe(&mut self, sample: Pose, now: f64, gate: &OffsetGate) -> bool {
        let within = self.previous.is_some_and(|prev| {
            (sample.position - prev.position).length() <= gate.position_tolerance
                && frame::angle_degrees(sample.rotation, prev.rotation) <= gate.angle_tolerance_deg
        });
        self.previous = Some(sample);
        if within {
            self.still_frames += 1;
            self.still_frames >= gate.min_frames && now >= self.settle_at
        } else {
            self.still_frames = 0;
            self.settle_at = now + gate.min_duration;
            false
        }
    }
}

/// Bookkeeping for a confirmed local holder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachedSend {
    pub vr: bool,
    /// Desktop only: the rotation watch recently saw a change and is
    /// running at the fast cadence.
    pub rotating: bool,
    pub next_rotation_check: f64,
    pub slow_down_at: f64,
}

/// Interpolation scratch. The target lives on the possession itself since it
/// doubles as the confirmed state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpolation {
    pub start: Pose,
    pub started_at: f64,
}

impl Interpolation {
    pub fn new(start: Pose, started_at: f64) -> Self {
        Self { start, started_at }
    }

    /// Progress in `[0, 1]`-ish; values past 1 mean the interpolation is done.
    pub fn fraction(&self, now: f64, duration: f64) -> f32 {
        if duration <= 0.0 {
            return 1.0;
        }
        ((now - self.started_at) / duration) as f32
    }
}

/// Local possession state of one live instance.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PossessionState {
    /// Nothing to do per frame. The only state outside the active set.
    #[default]
    Idle,
    WaitingForConsistentOffset(OffsetSampler),
    AttachedSending(AttachedSend),
    ReceivingFloating(Interpolation),
    ReceivingMovingToHolder(Interpolation),
    ReceivingAttached,
}

impl PossessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_receiving(&self) -> bool {
        matches!(
            self,
            Self::ReceivingFloating(_) | Self::ReceivingMovingToHolder(_) | Self::ReceivingAttached
        )
    }

    pub fn is_sending(&self) -> bool {
        matches!(
            self,
            Self::WaitingForConsistentOffset(_) | Self::AttachedSending(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::WaitingForConsistentOffset(p) if p.vr => "VrWaitingForConsistentOffset",
            Self::WaitingForConsistentOffset(_) => "DesktopWaitingForConsistentOffset",
            Self::AttachedSending(s) if s.vr => "VrAttachedSending",
            Self::AttachedSending(s) if s.rotating => "DesktopAttachedRotating",
            Self::AttachedSending(_) => "DesktopAttachedSending",
            Self::ReceivingFloating(_) => "ReceivingFloating",
            Self::ReceivingMovingToHolder(_) => "ReceivingMovingToHolder",
            Self::ReceivingAttached => "ReceivingAttached",
        }
    }
}

impl fmt::Display for PossessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
