use serde::{Deserialize, Serialize};

/// Thresholds used while waiting for a grab offset to settle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetGate {
    /// Maximum positional change between two samples, in world units.
    pub position_tolerance: f32,
    /// Maximum angular change between two samples, in degrees.
    pub angle_tolerance_deg: f32,
    /// Minimum time the offset must stay within tolerance, in seconds.
    pub min_duration: f64,
    /// Minimum number of consecutive in-tolerance frames.
    pub min_frames: u32,
}

impl Default for OffsetGate {
    fn default() -> Self {
        Self {
            position_tolerance: 0.01,
            angle_tolerance_deg: 7.0,
            min_duration: 0.2,
            min_frames: 4,
        }
    }
}

/// Desktop holders rotate objects freely; the attached offset's rotation is
/// re-checked on this cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationWatch {
    pub interval: f64,
    pub fast_interval: f64,
    pub tolerance_deg: f32,
    /// Fast checks without change before falling back to `interval`.
    pub fast_falloff: u32,
}

impl Default for RotationWatch {
    fn default() -> Self {
        Self {
            interval: 1.0,
            fast_interval: 0.15,
            tolerance_deg: 3.0,
            fast_falloff: 10,
        }
    }
}

/// Tunables for [`crate::ObjectPossession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PossessionConfig {
    pub vr: OffsetGate,
    pub desktop: OffsetGate,
    pub rotation_watch: RotationWatch,
    /// Duration of receiver-side interpolation, in seconds.
    pub interpolation_duration: f64,
    /// Minimum spacing of floating-position events while an offset settles.
    pub floating_send_interval: f64,
    /// Lock the holder's own view of the object onto its hand once attached.
    pub vr_local_attachment: bool,
    pub desktop_local_attachment: bool,
}

impl Default for PossessionConfig {
    fn default() -> Self {
        Self {
            vr: OffsetGate::default(),
            desktop: OffsetGate::default(),
            rotation_watch: RotationWatch::default(),
            interpolation_duration: 0.2,
            floating_send_interval: 0.2,
            vr_local_attachment: true,
            desktop_local_attachment: true,
        }
    }
}

impl PossessionConfig {
    pub fn gate(&self, vr: bool) -> &OffsetGate {
        if vr { &self.vr } else { &self.desktop }
    }

    pub fn local_attachment(&self, vr: bool) -> bool {
        if vr {
            self.vr_local_attachment
        } else {
            self.desktop_local_attachment
        }
    }
}
