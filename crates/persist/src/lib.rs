//! Persistence: session snapshot export and import.
//!
//! # Invariants
//! - Snapshots carry a checksum over their state and are verified on load.
//! - The manifest chains every stored file's SHA-256 to the previous one.
//! - Loading is fail-closed on any hash or schema mismatch.

pub mod snapshot;
pub mod store;

pub use snapshot::{RestoreError, SessionSnapshot, SnapshotSummary};
pub use store::{IntegrityManifest, ManifestEntry, SessionMeta, SnapshotStore, StoreError};

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use grabsync_common::{ArchetypeIndex, Handedness, ObjectId, ParticipantId, Pose};
    use grabsync_kernel::{LoopbackSession, SyncConfig, TransferMode};

    /// Export from a live session, then import twice into another one.
    #[test]
    fn export_then_import_into_running_session() {
        let tmp = tempfile::tempdir().unwrap();
        let a = ParticipantId(1);
        let mut session = LoopbackSession::new(SyncConfig::default());
        session.join(a, 0.0).unwrap();
        session.joints_mut().set(a, Handedness::Right, Pose::from_position(Vec3::Y));
        for x in [0.0, 1.0] {
            let pose = Pose::from_position(Vec3::new(x, 1.0, 0.2));
            session.request_spawn(a, ArchetypeIndex(0), pose);
        }
        session.deliver(0.0);
        session.step(0.0);
        session.step(0.0);
        assert!(session.grab_begin(a, ObjectId(1), Handedness::Right, true, 0.0));
        let mut now = 0.0;
        for _ in 0..30 {
            now += 1.0 / 64.0;
            session.step(now);
        }

        let registry = session.gateway(a).unwrap().registry();
        assert!(registry.record(ObjectId(1)).unwrap().is_attached());
        let snap = SessionSnapshot::capture(registry).unwrap();
        let mut store = SnapshotStore::open(tmp.path().join("export")).unwrap();
        store.save(&snap).unwrap();

        let loaded = SnapshotStore::open(tmp.path().join("export"))
            .unwrap()
            .load_latest()
            .unwrap();
        assert_eq!(loaded.state_hash, registry.state_hash());

        let mut other = LoopbackSession::new(SyncConfig::default());
        other.join(ParticipantId(7), 0.0).unwrap();
        let target = other.gateway_mut(ParticipantId(7)).unwrap().registry_mut();
        let first = loaded.restore_into(target, TransferMode::Import).unwrap();
        let second = loaded.restore_into(target, TransferMode::Import).unwrap();
        assert_eq!(first, vec![ObjectId(1), ObjectId(2)]);
        assert_eq!(second, vec![ObjectId(3), ObjectId(4)]);
        assert_eq!(target.object_count(), 4);
        // The exporting session's holder does not exist here.
        assert!(target.records().all(|r| r.holder().is_none()));

        for frame in 1..=30 {
            other.step(f64::from(frame) / 64.0);
        }
        let target = other.gateway(ParticipantId(7)).unwrap().registry();
        assert_eq!(target.pending_spawn_len(), 0);
        assert_eq!(target.active_len(), 0);
    }
}
