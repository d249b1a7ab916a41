//! Lag-compensated hit validation. Every tick the server captures the
//! collision-relevant state of the world into a 16-slot ring; when a
//! client's shot is judged, it is retraced against the state closest to
//! what that client was actually seeing, rewound by their measured
//! network delay. Claims landing outside the retained window fail
//! closed: "cannot validate" is a rejection, never an assumption.

use crate::entity::EntityKind;
use crate::physics::{self, PLAYER_SPEED};
use crate::sim::{Sim, PROJECTILE_DAMAGE};
use crate::util::Ring;
use log::debug;
use shared::fixed::{fx, mul, Fx, Vec2, ONE};
use shared::{REWIND_SLOTS, TICK_MS};

/// Movement claims get a couple units of slack on top of the speed
/// envelope, covering quantization and half-tick phase error.
const MOVE_TOLERANCE: Fx = fx(2);

/// A ship's collision state at capture time.
#[derive(Debug, Clone)]
struct ShipRecord {
    id: u16,
    position: Vec2,
    rotation: Fx,
    hull: Vec<Vec2>,
    bounding_radius: Fx,
}

/// A player's position at capture time.
#[derive(Debug, Clone, Copy)]
struct PlayerRecord {
    id: u16,
    position: Vec2,
}

/// One tick's worth of rewindable world state.
#[derive(Debug, Clone)]
pub struct RewindFrame {
    pub tick: u64,
    pub timestamp_ms: u64,
    ships: Vec<ShipRecord>,
    players: Vec<PlayerRecord>,
    /// (client id, estimated one-way delay ms) at capture time.
    delays: Vec<(u32, u64)>,
}

impl RewindFrame {
    fn delay_for(&self, client_id: u32) -> u64 {
        self.delays
            .iter()
            .find(|(id, _)| *id == client_id)
            .map_or(0, |(_, d)| *d)
    }
}

/// Outcome of retracing a reported shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitVerdict {
    /// The shot line crosses a ship's historical hull.
    Confirmed {
        target: u16,
        point: Vec2,
        damage: u8,
    },
    /// The shot crosses no hull where the ships actually were.
    Miss,
    /// The claimed tick is outside the rewind window.
    OutOfWindow,
}

impl HitVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, HitVerdict::Confirmed { .. })
    }
}

pub struct RewindBuffer {
    frames: Ring<RewindFrame>,
    pub rejected_out_of_window: u64,
}

impl RewindBuffer {
    pub fn new() -> Self {
        RewindBuffer {
            frames: Ring::new(REWIND_SLOTS),
            rejected_out_of_window: 0,
        }
    }

    /// Captures the current tick. Called once per tick after integration,
    /// so stored state matches what snapshots of this tick describe.
    pub fn store(&mut self, sim: &Sim, now_ms: u64, delays: Vec<(u32, u64)>) {
        let ships = sim
            .ships()
            .map(|(id, s)| ShipRecord {
                id,
                position: s.position,
                rotation: s.rotation,
                hull: s.hull.clone(),
                bounding_radius: s.bounding_radius,
            })
            .collect();
        let players = sim
            .players()
            .map(|(id, p)| PlayerRecord {
                id,
                position: p.position,
            })
            .collect();
        self.frames.push(RewindFrame {
            tick: sim.tick,
            timestamp_ms: now_ms,
            ships,
            players,
            delays,
        });
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn oldest_tick(&self) -> Option<u64> {
        self.frames.oldest().map(|f| f.tick)
    }

    pub fn newest_tick(&self) -> Option<u64> {
        self.frames.newest().map(|f| f.tick)
    }

    /// The stored frame for `tick`, or `None` once it has rolled out.
    pub fn get_state(&self, tick: u64) -> Option<&RewindFrame> {
        if tick < self.oldest_tick()? || tick > self.newest_tick()? {
            return None;
        }
        self.frames.iter().find(|f| f.tick == tick)
    }

    /// Retraces a shot the given client reports having fired at
    /// `reported_tick`, rewound further by that client's delay estimate
    /// recorded in the frame. Tests every ship hull at the historical
    /// state and returns the nearest intersection.
    pub fn validate_hit(
        &mut self,
        client_id: u32,
        reported_tick: u64,
        origin: Vec2,
        direction: Vec2,
        range: Fx,
    ) -> HitVerdict {
        let delay_ticks = match self.get_state(reported_tick) {
            Some(f) => {
                let delay = f.delay_for(client_id);
                ((delay + TICK_MS - 1) / TICK_MS).min(REWIND_SLOTS as u64)
            }
            None => 0,
        };
        let target_tick = reported_tick.saturating_sub(delay_ticks);
        let frame = match self.get_state(target_tick) {
            Some(f) => f,
            None => {
                self.rejected_out_of_window += 1;
                debug!(
                    "hit claim at tick {} (rewound to {}) outside the window",
                    reported_tick, target_tick
                );
                return HitVerdict::OutOfWindow;
            }
        };

        let mut best: Option<(i64, u16, Vec2)> = None;
        for rec in &frame.ships {
            // Bounding-circle reject before the segment test.
            let to_ship = rec.position.sub(origin);
            let reach = range + rec.bounding_radius;
            if to_ship.length_sq() > (reach as i64) * (reach as i64) {
                continue;
            }
            if let Some(point) = physics::ray_hull_intersect(
                origin,
                direction,
                range,
                &rec.hull,
                rec.position,
                rec.rotation,
            ) {
                let d = point.sub(origin).length_sq();
                if best.map_or(true, |(bd, _, _)| d < bd) {
                    best = Some((d, rec.id, point));
                }
            }
        }
        match best {
            Some((_, target, point)) => HitVerdict::Confirmed {
                target,
                point,
                damage: PROJECTILE_DAMAGE,
            },
            None => HitVerdict::Miss,
        }
    }

    /// Checks a reported position against the reach envelope from where
    /// the player actually was at `from_tick`: elapsed ticks times max
    /// speed, plus tolerance. Unverifiable claims fail closed.
    pub fn validate_movement(
        &self,
        player_id: u16,
        from_tick: u64,
        to_tick: u64,
        reported: Vec2,
    ) -> bool {
        if to_tick < from_tick {
            return false;
        }
        let Some(frame) = self.get_state(from_tick) else {
            return false;
        };
        let Some(rec) = frame.players.iter().find(|p| p.id == player_id) else {
            return false;
        };
        let elapsed_ticks = (to_tick - from_tick).min(REWIND_SLOTS as u64);
        let elapsed_fx = ((elapsed_ticks * TICK_MS) as i64 * ONE as i64 / 1000) as Fx;
        let reach = mul(PLAYER_SPEED, elapsed_fx) + MOVE_TOLERANCE;
        reported.sub(rec.position).length_sq() <= (reach as i64) * (reach as i64)
    }

    /// True when the target kind can be hit-validated at all. Projectiles
    /// are transient and never stored.
    pub fn can_validate(kind: EntityKind) -> bool {
        matches!(kind, EntityKind::Ship | EntityKind::Player)
    }
}

impl Default for RewindBuffer {
    fn default() -> Self {
        Self::new()
    }
}
