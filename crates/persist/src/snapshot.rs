use grabsync_common::{ObjectId, fnv1a};
use grabsync_kernel::gateway::to_cbor;
use grabsync_kernel::{Registry, StateTransfer, TransferError, TransferMode, WireError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exported session state with enough context to verify and re-import it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Archetype names of the exporting registry, by index.
    pub archetypes: Vec<String>,
    pub state: StateTransfer,
    /// Registry state hash at capture time.
    pub state_hash: u64,
    /// FNV-1a over the CBOR encoding of `state`.
    pub checksum: u64,
}

/// Why a snapshot could not be restored.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("snapshot checksum mismatch")]
    Corrupt,
    #[error("archetype {index} is {found:?} in the snapshot but {expected:?} here")]
    ArchetypeMismatch {
        index: usize,
        found: String,
        expected: Option<String>,
    },
    #[error("snapshot state not encodable: {0}")]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl SessionSnapshot {
    pub fn capture(registry: &Registry) -> Result<Self, WireError> {
        let state = registry.capture_state();
        let checksum = checksum(&state)?;
        Ok(Self {
            archetypes: registry.config().archetypes.clone(),
            state,
            state_hash: registry.state_hash(),
            checksum,
        })
    }

    /// Recompute the checksum over the carried state.
    pub fn verify(&self) -> Result<bool, WireError> {
        Ok(checksum(&self.state)? == self.checksum)
    }

    /// Load into `registry`. Archetype names must agree index by index for
    /// every archetype the snapshot uses.
    pub fn restore_into(
        &self,
        registry: &mut Registry,
        mode: TransferMode,
    ) -> Result<Vec<ObjectId>, RestoreError> {
        if !self.verify()? {
            return Err(RestoreError::Corrupt);
        }
        let local = &registry.config().archetypes;
        for record in &self.state.records {
            let index = record.archetype.index();
            let Some(found) = self.archetypes.get(index) else {
                continue;
            };
            if local.get(index) != Some(found) {
                return Err(RestoreError::ArchetypeMismatch {
                    index,
                    found: found.clone(),
                    expected: local.get(index).cloned(),
                });
            }
        }
        Ok(registry.load_state(&self.state, mode)?)
    }

    pub fn summary(&self) -> SnapshotSummary {
        let held = self.state.records.iter().filter(|r| r.holder().is_some()).count();
        let attached = self.state.records.iter().filter(|r| r.is_attached()).count();
        let mut per_archetype = vec![0usize; self.archetypes.len()];
        for record in &self.state.records {
            if let Some(count) = per_archetype.get_mut(record.archetype.index()) {
                *count += 1;
            }
        }
        SnapshotSummary {
            object_count: self.state.records.len(),
            held,
            attached,
            next_id: self.state.next_id,
            state_hash: self.state_hash,
            per_archetype: self.archetypes.iter().cloned().zip(per_archetype).collect(),
        }
    }
}

/// Human-readable digest of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSummary {
    pub object_count: usize,
    pub held: usize,
    pub attached: usize,
    pub next_id: ObjectId,
    pub state_hash: u64,
    pub per_archetype: Vec<(String, usize)>,
}

impl fmt::Display for SnapshotSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session Snapshot ===")?;
        writeln!(f, "Objects:    {}", self.object_count)?;
        writeln!(f, "Held:       {} ({} attached)", self.held, self.attached)?;
        writeln!(f, "Next id:    {}", self.next_id)?;
        writeln!(f, "State hash: {:#018x}", self.state_hash)?;
        for (name, count) in &self.per_archetype {
            writeln!(f, "  {name}: {count}")?;
        }
        Ok(())
    }
}

/// FNV-1a over the CBOR encoding of `state`.
fn checksum(state: &StateTransfer) -> Result<u64, WireError> {
    Ok(fnv1a(&to_cbor(state)?))
}
