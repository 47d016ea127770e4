//! Sync kernel: canonical object records, pooled live instances, event
//! application and the replication gateway.
//!
//! # Invariants
//! - Records change only by applying events from the ordered log.
//! - Replicas that applied the same log prefix have equal records.
//! - An object id is bound to at most one enabled instance; a pooled instance
//!   is disabled and idle.
//! - The active set holds exactly the non-idle instances.
//! - Events that no longer match the records are ignored, never fatal.

pub mod apply;
pub mod config;
pub mod gateway;
pub mod loopback;
pub mod record;
pub mod registry;
pub mod transfer;

pub use apply::{Applied, IgnoreReason};
pub use config::{ConfigError, SyncConfig};
pub use gateway::{GatewayError, Substrate, SyncGateway, WireError, decode_event, encode_event};
pub use loopback::{JointTable, LoopbackHub, LoopbackSession, LoopbackSubstrate};
pub use record::{Holding, ObjectRecord};
pub use registry::{LiveInstance, Registry};
pub use transfer::{StateTransfer, TransferError, TransferMode};
