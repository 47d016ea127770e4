//! Scripted multi-participant session over the loopback substrate.

use glam::{Quat, Vec3};
use grabsync_common::{ArchetypeIndex, Handedness, ObjectId, ParticipantId, Pose};
use grabsync_kernel::{GatewayError, LoopbackSession, SyncConfig};

pub const FRAME: f64 = 1.0 / 60.0;

/// Frames of one grab cycle: hold still, carry, let go.
const STILL_FRAMES: u64 = 40;
const CARRY_FRAMES: u64 = 40;
const CYCLE_FRAMES: u64 = 90;
/// Frames run after the script so every interpolation finishes.
const SETTLE_FRAMES: u64 = 60;

#[derive(Debug, Clone)]
pub struct ScenarioParams {
    pub participants: u32,
    pub objects: u32,
    pub frames: u64,
    pub seed: u64,
}

#[derive(Debug, Default)]
pub struct ScenarioReport {
    pub grabs: usize,
    pub releases: usize,
    pub left: Vec<ParticipantId>,
    pub joined_late: Vec<ParticipantId>,
    pub log_len: usize,
}

/// A participant's current grab.
#[derive(Debug, Clone, Copy)]
struct Carry {
    id: ObjectId,
    hand: Handedness,
    started: u64,
    from: Vec3,
    to: Vec3,
}

/// Deterministic source of scenario choices.
struct Rng(u64);

impl Rng {
    fn next_u64(&mut self) -> u64 {
        self.0 = splitmix64(self.0);
        self.0
    }

    fn unit(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    fn point(&mut self, extent: f32) -> Vec3 {
        Vec3::new(
            (self.unit() - 0.5) * extent,
            0.8 + self.unit() * 0.8,
            (self.unit() - 0.5) * extent,
        )
    }
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Run the script. Participant 1 spawns everything; everyone repeatedly grabs
/// a free object, holds still until attached, carries it and lets go. The
/// highest participant leaves halfway through and a new one joins late.
pub fn run(
    config: SyncConfig,
    params: &ScenarioParams,
) -> Result<(LoopbackSession, ScenarioReport), GatewayError> {
    let _span = tracing::info_span!("scenario", seed = params.seed).entered();
    let mut session = LoopbackSession::new(config);
    let mut report = ScenarioReport::default();
    let mut rng = Rng(params.seed);

    let participants: Vec<ParticipantId> =
        (1..=params.participants.max(1)).map(ParticipantId).collect();
    for &p in &participants {
        session.join(p, 0.0)?;
    }
    let spawner = participants[0];
    for _ in 0..params.objects {
        let yaw = Quat::from_rotation_y(rng.unit() * std::f32::consts::TAU);
        let pose = Pose::new(rng.point(4.0), yaw);
        session.request_spawn(spawner, ArchetypeIndex(0), pose);
    }
    session.deliver(0.0);

    let leaver = (participants.len() > 2).then(|| participants[participants.len() - 1]);
    let late = ParticipantId(params.participants.max(1) + 1);
    let mut carries: Vec<(ParticipantId, Option<Carry>)> =
        participants.iter().map(|&p| (p, None)).collect();

    let mut now = 0.0;
    for frame in 0..params.frames {
        now = frame as f64 * FRAME;

        if frame == params.frames / 2 {
            if let Some(p) = leaver {
                session.leave(p);
                carries.retain(|(q, _)| *q != p);
                report.left.push(p);
            }
        }
        if frame == params.frames * 3 / 4 {
            session.join(late, now)?;
            carries.push((late, None));
            report.joined_late.push(late);
        }

        for (participant, carry) in carries.iter_mut() {
            drive_participant(&mut session, &mut rng, *participant, carry, frame, now, &mut report);
        }
        session.step(now);
    }

    // Let go of everything and settle.
    for (participant, carry) in carries.iter_mut() {
        if let Some(c) = carry.take() {
            session.grab_end(*participant, c.id, now);
            report.releases += 1;
        }
    }
    for _ in 0..SETTLE_FRAMES {
        now += FRAME;
        session.step(now);
    }
    report.log_len = session.hub().log_len();
    Ok((session, report))
}

fn drive_participant(
    session: &mut LoopbackSession,
    rng: &mut Rng,
    participant: ParticipantId,
    carry: &mut Option<Carry>,
    frame: u64,
    now: f64,
    report: &mut ScenarioReport,
) {
    let Some(c) = *carry else {
        // Stagger participants so grabs do not all line up.
        if (frame + u64::from(participant.0) * 17) % CYCLE_FRAMES == 0 {
            *carry = start_grab(session, rng, participant, frame, now);
            if carry.is_some() {
                report.grabs += 1;
            }
        }
        return;
    };

    let elapsed = frame - c.started;
    if elapsed >= STILL_FRAMES + CARRY_FRAMES {
        session.grab_end(participant, c.id, now);
        report.releases += 1;
        *carry = None;
        return;
    }
    if elapsed > STILL_FRAMES {
        let t = (elapsed - STILL_FRAMES) as f32 / CARRY_FRAMES as f32;
        session
            .joints_mut()
            .set(participant, c.hand, Pose::from_position(c.from.lerp(c.to, t)));
        // Desktop users twist what they carry.
        if participant.0 % 2 == 0 {
            if let Some(gateway) = session.gateway_mut(participant) {
                let registry = gateway.registry_mut();
                if let Some(mut pose) = registry.pose(c.id) {
                    pose.rotation = (Quat::from_rotation_y(0.02) * pose.rotation).normalize();
                    registry.sync_body_pose(c.id, pose);
                }
            }
        }
    }
}

fn start_grab(
    session: &mut LoopbackSession,
    rng: &mut Rng,
    participant: ParticipantId,
    frame: u64,
    now: f64,
) -> Option<Carry> {
    let registry = session.gateway(participant)?.registry();
    let free: Vec<(ObjectId, Pose)> = registry
        .records()
        .filter(|r| r.holder().is_none())
        .filter_map(|r| registry.pose(r.id).map(|pose| (r.id, pose)))
        .collect();
    if free.is_empty() {
        return None;
    }
    let (id, pose) = free[(rng.next_u64() % free.len() as u64) as usize];
    let hand = if rng.unit() < 0.5 {
        Handedness::Left
    } else {
        Handedness::Right
    };
    // The hand closes a little above the object.
    let from = pose.position + Vec3::new(0.0, 0.1, 0.0);
    session.joints_mut().set(participant, hand, Pose::from_position(from));
    let vr = participant.0 % 2 == 1;
    if !session.grab_begin(participant, id, hand, vr, now) {
        return None;
    }
    tracing::debug!(%participant, %id, vr, "scripted grab");
    Some(Carry {
        id,
        hand,
        started: frame,
        from,
        to: rng.point(4.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(participants: u32) -> ScenarioParams {
        ScenarioParams {
            participants,
            objects: 6,
            frames: 600,
            seed: 42,
        }
    }

    #[test]
    fn replicas_converge() {
        let (session, report) = run(SyncConfig::default(), &params(4)).unwrap();
        assert!(session.converged());
        assert!(report.grabs > 0);
        assert_eq!(report.left, vec![ParticipantId(4)]);
        assert_eq!(report.joined_late, vec![ParticipantId(5)]);
        let authority = session.gateway(ParticipantId(1)).unwrap().registry();
        assert_eq!(authority.object_count(), 6);
        assert!(authority.records().all(|r| r.holder().is_none()));
        assert_eq!(authority.active_len(), 0);
    }

    #[test]
    fn same_seed_same_outcome() {
        let (a, ra) = run(SyncConfig::default(), &params(3)).unwrap();
        let (b, rb) = run(SyncConfig::default(), &params(3)).unwrap();
        assert_eq!(a.state_hashes(), b.state_hashes());
        assert_eq!(ra.log_len, rb.log_len);
    }

    #[test]
    fn rng_is_deterministic_and_bounded() {
        let mut a = Rng(7);
        let mut b = Rng(7);
        for _ in 0..100 {
            let u = a.unit();
            assert_eq!(u, b.unit());
            assert!((0.0..1.0).contains(&u));
        }
    }
}
