//! Object possession: the per-object state machine that hides network latency
//! for whoever holds an object and interpolates everyone else toward the
//! confirmed state.
//!
//! # Invariants
//! - `Idle` is the only state that needs no per-frame update.
//! - A possession never enters a receiving state while held locally.
//! - The current holder never applies replicated poses for its own object;
//!   holder and attachment flags always apply.

pub mod config;
pub mod machine;
pub mod state;

pub use config::{OffsetGate, PossessionConfig, RotationWatch};
pub use machine::{Holder, JointSource, ObjectPossession, StepContext};
pub use state::{AttachedSend, Interpolation, OffsetSampler, PossessionState};
