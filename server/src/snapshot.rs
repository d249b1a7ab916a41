//! Per-player snapshot construction: quantized baselines at a fixed
//! cadence, delta packets in between, tier frequency gating and the
//! entity cap with HIGH-tier priority.
//!
//! Delta correctness depends entirely on what the client is known to
//! hold. A delta is only ever encoded against a baseline the client has
//! acknowledged; whenever that is unknown or stale the codec falls back
//! to a full baseline rather than guess.

use crate::aoi::{cell_of, cell_origin, AoiTier, Subscription};
use crate::sim::Sim;
use log::trace;
use shared::fixed::to_f32;
use shared::protocol::{
    self, delta_mask, snapshot_flags, EntityDelta, EntitySnapshot, SnapshotHeader,
};
use shared::{BASELINE_INTERVAL, MAX_ENTITIES_PER_SNAPSHOT};
use std::collections::HashMap;

/// How many unacked baselines we remember while waiting for an ack.
const MAX_PENDING_BASELINES: usize = 8;

/// Minimum milliseconds between snapshots per tier: HIGH 30 Hz,
/// MID 15 Hz, LOW 5 Hz.
const TIER_PERIOD_MS: [u64; 3] = [33, 66, 200];

/// The single cadence gate: does this tier owe an update?
pub fn should_send_snapshot_for_tier(tier: AoiTier, now_ms: u64, last_sent_ms: u64) -> bool {
    now_ms.saturating_sub(last_sent_ms) >= TIER_PERIOD_MS[tier.index()]
}

/// Rolling per-client snapshot state.
pub struct SnapshotState {
    /// Baselines the client has acknowledged holding, per entity.
    baselines: HashMap<u16, EntitySnapshot>,
    /// Snapshot id of the acked baseline set, if any.
    acked_base: Option<u16>,
    /// Sent-but-unacked baseline sets, keyed by snapshot id.
    pending: HashMap<u16, Vec<EntitySnapshot>>,
    pending_order: Vec<u16>,
    snap_counter: u32,
    pub bytes_sent: u64,
    pub snapshots_sent: u64,
    /// Entities that qualified but were deferred by the size cap.
    pub deferred_count: u64,
}

impl SnapshotState {
    pub fn new() -> Self {
        SnapshotState {
            baselines: HashMap::new(),
            acked_base: None,
            pending: HashMap::new(),
            pending_order: Vec::new(),
            snap_counter: 0,
            bytes_sent: 0,
            snapshots_sent: 0,
            deferred_count: 0,
        }
    }

    /// Marks a snapshot acknowledged. If it was a pending baseline the
    /// client is now known to hold it and deltas may reference it.
    pub fn on_ack(&mut self, snap_id: u16) {
        if let Some(records) = self.pending.remove(&snap_id) {
            self.pending_order.retain(|&id| id != snap_id);
            self.baselines.clear();
            for rec in records {
                self.baselines.insert(rec.entity_id, rec);
            }
            self.acked_base = Some(snap_id);
        }
    }

    fn remember_pending(&mut self, snap_id: u16, records: Vec<EntitySnapshot>) {
        if self.pending_order.len() >= MAX_PENDING_BASELINES {
            let oldest = self.pending_order.remove(0);
            self.pending.remove(&oldest);
        }
        self.pending.insert(snap_id, records);
        self.pending_order.push(snap_id);
    }
}

impl Default for SnapshotState {
    fn default() -> Self {
        Self::new()
    }
}

/// Quantizes one entity's wire state. The position goes out as an
/// offset from the origin of the entity's own grid cell, which keeps
/// every tracked entity inside the quantizer's ±64-unit window no
/// matter how far it sits from the subscriber.
fn quantize_entity(sim: &Sim, id: u16) -> Option<EntitySnapshot> {
    let ws = sim.wire_state(id)?;
    let cell = cell_of(ws.position);
    let rel = ws.position.sub(cell_origin(cell));
    Some(EntitySnapshot {
        entity_id: id,
        cell,
        qpos: (
            protocol::quantize_pos(to_f32(rel.x)),
            protocol::quantize_pos(to_f32(rel.y)),
        ),
        qvel: (
            protocol::quantize_vel(to_f32(ws.velocity.x)),
            protocol::quantize_vel(to_f32(ws.velocity.y)),
        ),
        qrot: protocol::quantize_rot_fx(ws.rotation),
        health: ws.health,
        state_flags: ws.state_flags,
    })
}

fn delta_between(base: &EntitySnapshot, cur: &EntitySnapshot) -> EntityDelta {
    let mut d = EntityDelta {
        entity_id: cur.entity_id,
        ..Default::default()
    };
    if cur.qpos != base.qpos || cur.cell != base.cell {
        d.mask |= delta_mask::POS;
        d.cell = cur.cell;
        d.qpos = cur.qpos;
    }
    if cur.qvel != base.qvel {
        d.mask |= delta_mask::VEL;
        d.qvel = cur.qvel;
    }
    if cur.qrot != base.qrot {
        d.mask |= delta_mask::ROT;
        d.qrot = cur.qrot;
    }
    if cur.health != base.health {
        d.mask |= delta_mask::HEALTH;
        d.health = cur.health;
    }
    if cur.state_flags != base.state_flags {
        d.mask |= delta_mask::STATE;
        d.state_flags = cur.state_flags;
    }
    d
}

/// A built snapshot packet. Baselines are the packets delta correctness
/// hangs on, so the caller registers them with the reliability layer.
pub struct SnapshotOut {
    pub bytes: Vec<u8>,
    pub snap_id: u16,
    pub baseline: bool,
}

/// Builds this tick's snapshot packet for one subscriber, or `None` when
/// no tier owes an update (or nothing changed under a delta). `snap_id`
/// comes from the connection's sequence space so acks cover snapshots
/// and heartbeats alike.
pub fn build_snapshot(
    sim: &Sim,
    sub: &mut Subscription,
    state: &mut SnapshotState,
    snap_id: u16,
    now_ms: u64,
    server_time: u32,
) -> Option<SnapshotOut> {
    // Which tiers are due this tick?
    let mut due = [false; 3];
    let mut any_due = false;
    for tier in AoiTier::ALL {
        if should_send_snapshot_for_tier(tier, now_ms, sub.last_update_ms[tier.index()]) {
            due[tier.index()] = true;
            any_due = true;
        }
    }
    if !any_due || sub.tracked.is_empty() {
        return None;
    }

    // Entities from due tiers, HIGH first (tracked is distance-ranked, so
    // slot priority follows tier priority already); cap and defer the rest.
    let mut chosen: Vec<u16> = Vec::with_capacity(MAX_ENTITIES_PER_SNAPSHOT);
    let mut deferred = 0u64;
    for tier in AoiTier::ALL {
        if !due[tier.index()] {
            continue;
        }
        for t in sub.tracked.iter().filter(|t| t.tier == tier) {
            if chosen.len() < MAX_ENTITIES_PER_SNAPSHOT {
                chosen.push(t.id);
            } else {
                deferred += 1;
            }
        }
    }
    state.deferred_count += deferred;

    let current: Vec<EntitySnapshot> = chosen
        .iter()
        .filter_map(|&id| quantize_entity(sim, id))
        .collect();
    if current.is_empty() {
        return None;
    }

    // Baseline whenever the cadence says so, the client's baseline set is
    // unknown, or a chosen entity has no acked baseline.
    let cadence_due = state.snap_counter % BASELINE_INTERVAL == 0;
    let unknown = state.acked_base.is_none();
    let missing_entity = current
        .iter()
        .any(|rec| !state.baselines.contains_key(&rec.entity_id));
    let send_baseline = cadence_due || unknown || missing_entity;

    let packet = if send_baseline {
        let header = SnapshotHeader {
            server_time,
            base_id: snap_id,
            snap_id,
            aoi_cell: sub.cell,
            entity_count: current.len() as u8,
            flags: 0,
        };
        let bytes = protocol::encode_baseline(&header, &current);
        state.remember_pending(snap_id, current);
        bytes
    } else {
        let deltas: Vec<EntityDelta> = current
            .iter()
            .filter_map(|rec| {
                let base = state.baselines.get(&rec.entity_id)?;
                let d = delta_between(base, rec);
                (d.mask != 0).then_some(d)
            })
            .collect();
        if deltas.is_empty() {
            // Nothing changed; the tier clocks still advance so idle
            // scenes do not busy-send.
            for tier in AoiTier::ALL {
                if due[tier.index()] {
                    sub.last_update_ms[tier.index()] = now_ms;
                }
            }
            state.snap_counter += 1;
            return None;
        }
        let header = SnapshotHeader {
            server_time,
            base_id: state.acked_base.expect("delta requires acked baseline"),
            snap_id,
            aoi_cell: sub.cell,
            entity_count: deltas.len() as u8,
            flags: snapshot_flags::DELTA,
        };
        protocol::encode_delta(&header, &deltas)
    };

    state.snap_counter += 1;
    state.bytes_sent += packet.len() as u64;
    state.snapshots_sent += 1;
    for tier in AoiTier::ALL {
        if due[tier.index()] {
            sub.last_update_ms[tier.index()] = now_ms;
        }
    }
    trace!(
        "snapshot {} ({} bytes, baseline={})",
        snap_id,
        packet.len(),
        send_baseline
    );
    Some(SnapshotOut {
        bytes: packet,
        snap_id,
        baseline: send_baseline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::{self, AoiGrid};
    use shared::fixed::{Vec2, ONE};
    use shared::protocol::{decode_snapshot, SnapshotRecords};

    /// Sim with one player at (1000, 1000) and two nearby ships.
    fn fixture() -> (Sim, Subscription, SnapshotState, u16) {
        let mut sim = Sim::new(7);
        let player = sim.spawn_player(Vec2::from_int(1000, 1000)).unwrap();
        sim.spawn_ship(Vec2::from_int(1020, 1000), 0).unwrap();
        sim.spawn_ship(Vec2::from_int(1040, 1010), 0).unwrap();

        let mut grid = AoiGrid::new();
        let positions: HashMap<u16, Vec2> = sim.entity_positions().into_iter().collect();
        for (&id, &pos) in &positions {
            grid.insert_entity(id, pos);
        }
        let mut sub = Subscription::new(player);
        aoi::update_subscription(
            &mut sub,
            &grid,
            &positions,
            Vec2::from_int(1000, 1000),
            0,
        );
        (sim, sub, SnapshotState::new(), player)
    }

    #[test]
    fn test_tier_cadence_gate() {
        assert!(should_send_snapshot_for_tier(AoiTier::High, 1000, 966));
        assert!(!should_send_snapshot_for_tier(AoiTier::High, 1000, 980));
        assert!(should_send_snapshot_for_tier(AoiTier::Mid, 1000, 930));
        assert!(!should_send_snapshot_for_tier(AoiTier::Mid, 1000, 950));
        assert!(should_send_snapshot_for_tier(AoiTier::Low, 1000, 800));
        assert!(!should_send_snapshot_for_tier(AoiTier::Low, 1000, 900));
        // Fresh state (last_sent 0) is always due.
        assert!(should_send_snapshot_for_tier(AoiTier::Low, 5, 0));
    }

    #[test]
    fn test_first_snapshot_is_baseline() {
        let (sim, mut sub, mut state, _) = fixture();
        let bytes = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1)
            .unwrap()
            .bytes;
        let (header, records) = decode_snapshot(&bytes).unwrap();
        assert_eq!(header.flags & snapshot_flags::DELTA, 0);
        assert_eq!(header.base_id, header.snap_id);
        match records {
            SnapshotRecords::Baseline(recs) => assert_eq!(recs.len(), 3),
            _ => panic!("expected baseline records"),
        }
    }

    #[test]
    fn test_delta_only_after_ack_and_only_changes() {
        let (mut sim, mut sub, mut state, player) = fixture();
        let _ = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1).unwrap();

        // Unacked: the next packet must be a baseline again.
        let again = build_snapshot(&sim, &mut sub, &mut state, 1, 1100, 2)
            .unwrap()
            .bytes;
        let (h2, _) = decode_snapshot(&again).unwrap();
        assert_eq!(h2.flags & snapshot_flags::DELTA, 0);

        // Ack the second baseline, move only the player, and the next
        // packet is a delta carrying just that entity's position.
        state.on_ack(h2.snap_id);
        sim.apply_input(
            player,
            &crate::sim::InputCommand {
                seq: 1,
                movement: Vec2::new(ONE, 0),
                actions: 0,
                client_time: 0,
                dt_ms: 33,
            },
        )
        .unwrap();
        sim.step();

        let bytes = build_snapshot(&sim, &mut sub, &mut state, 2, 1200, 3)
            .unwrap()
            .bytes;
        let (h3, records) = decode_snapshot(&bytes).unwrap();
        assert_ne!(h3.flags & snapshot_flags::DELTA, 0);
        assert_eq!(h3.base_id, h2.snap_id);
        match records {
            SnapshotRecords::Delta(recs) => {
                assert_eq!(recs.len(), 1);
                assert_eq!(recs[0].entity_id, player);
                assert_ne!(recs[0].mask & delta_mask::POS, 0);
            }
            _ => panic!("expected delta records"),
        }
    }

    #[test]
    fn test_unchanged_world_sends_nothing_between_baselines() {
        let (sim, mut sub, mut state, _) = fixture();
        let first = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1)
            .unwrap()
            .bytes;
        let (h, _) = decode_snapshot(&first).unwrap();
        state.on_ack(h.snap_id);
        // No entity changed: delta would be empty, so no packet goes out.
        assert!(build_snapshot(&sim, &mut sub, &mut state, 1, 1100, 2).is_none());
    }

    #[test]
    fn test_baseline_cadence_forces_periodic_fulls() {
        let (sim, mut sub, mut state, _) = fixture();
        let mut baselines = 0;
        let mut now = 1000;
        for i in 0..(BASELINE_INTERVAL * 2) {
            if let Some(out) = build_snapshot(&sim, &mut sub, &mut state, i as u16, now, i) {
                let (h, _) = decode_snapshot(&out.bytes).unwrap();
                if h.flags & snapshot_flags::DELTA == 0 {
                    assert!(out.baseline);
                    baselines += 1;
                    state.on_ack(h.snap_id);
                }
            }
            now += 40;
        }
        // At least the two cadence-driven fulls.
        assert!(baselines >= 2);
    }

    #[test]
    fn test_snapshot_respects_entity_cap() {
        let mut sim = Sim::new(9);
        let player = sim.spawn_player(Vec2::from_int(1000, 1000)).unwrap();
        // More trackable entities than one packet may carry.
        for i in 0..40 {
            sim.spawn_projectile(
                Vec2::from_int(1001 + i, 1000),
                Vec2::ZERO,
                0,
                1,
            )
            .unwrap();
        }
        let mut grid = AoiGrid::new();
        let positions: HashMap<u16, Vec2> = sim.entity_positions().into_iter().collect();
        for (&id, &pos) in &positions {
            grid.insert_entity(id, pos);
        }
        let mut sub = Subscription::new(player);
        aoi::update_subscription(&mut sub, &grid, &positions, Vec2::from_int(1000, 1000), 0);

        let mut state = SnapshotState::new();
        let bytes = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1)
            .unwrap()
            .bytes;
        let (header, _) = decode_snapshot(&bytes).unwrap();
        assert!(header.entity_count as usize <= MAX_ENTITIES_PER_SNAPSHOT);
        assert!(bytes.len() <= protocol::MAX_PACKET_SIZE);
    }

    #[test]
    fn test_quantized_positions_are_cell_relative() {
        let (sim, mut sub, mut state, player) = fixture();
        let bytes = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1)
            .unwrap()
            .bytes;
        let (_, records) = decode_snapshot(&bytes).unwrap();
        let SnapshotRecords::Baseline(recs) = records else {
            panic!("expected baseline");
        };
        let me = recs.iter().find(|r| r.entity_id == player).unwrap();
        let origin = cell_origin(me.cell);
        let world_x = to_f32(origin.x) + protocol::unquantize_pos(me.qpos.0);
        let world_y = to_f32(origin.y) + protocol::unquantize_pos(me.qpos.1);
        assert!((world_x - 1000.0).abs() <= 1.0 / 512.0 + f32::EPSILON);
        assert!((world_y - 1000.0).abs() <= 1.0 / 512.0 + f32::EPSILON);
    }

    #[test]
    fn test_entity_far_from_subscriber_cell_decodes_exactly() {
        // Subscriber at (127, 10), one step short of its cell's far edge;
        // the tracked ship at (200, 10) is more than 64 units past the
        // subscriber's cell origin. Its position must round-trip intact.
        let mut sim = Sim::new(5);
        let player = sim.spawn_player(Vec2::from_int(127, 10)).unwrap();
        let ship = sim.spawn_ship(Vec2::from_int(200, 10), 0).unwrap();

        let mut grid = AoiGrid::new();
        let positions: HashMap<u16, Vec2> = sim.entity_positions().into_iter().collect();
        for (&id, &pos) in &positions {
            grid.insert_entity(id, pos);
        }
        let mut sub = Subscription::new(player);
        aoi::update_subscription(&mut sub, &grid, &positions, Vec2::from_int(127, 10), 0);
        assert!(sub.tracked.iter().any(|t| t.id == ship));

        let mut state = SnapshotState::new();
        let bytes = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1)
            .unwrap()
            .bytes;
        let (_, records) = decode_snapshot(&bytes).unwrap();
        let SnapshotRecords::Baseline(recs) = records else {
            panic!("expected baseline");
        };
        let rec = recs.iter().find(|r| r.entity_id == ship).unwrap();
        let origin = cell_origin(rec.cell);
        let world_x = to_f32(origin.x) + protocol::unquantize_pos(rec.qpos.0);
        assert!(
            (world_x - 200.0).abs() <= 1.0 / 512.0 + f32::EPSILON,
            "ship at x=200 decoded at x={}",
            world_x
        );
    }

    #[test]
    fn test_subscriber_cell_change_keeps_deltas_valid() {
        // Record positions are relative to each entity's own cell, so the
        // subscriber crossing a cell boundary does not stale the acked
        // baselines; an unchanged world still sends nothing.
        let (sim, mut sub, mut state, _) = fixture();
        let bytes = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1)
            .unwrap()
            .bytes;
        let (h, _) = decode_snapshot(&bytes).unwrap();
        state.on_ack(h.snap_id);

        sub.cell += 1;
        assert!(build_snapshot(&sim, &mut sub, &mut state, 1, 1100, 2).is_none());
    }

    #[test]
    fn test_not_due_returns_none() {
        let (sim, mut sub, mut state, _) = fixture();
        let _ = build_snapshot(&sim, &mut sub, &mut state, 0, 1000, 1).unwrap();
        // 10 ms later nothing is due, not even LOW.
        assert!(build_snapshot(&sim, &mut sub, &mut state, 1, 1010, 2).is_none());
    }
}
