//! Authoritative simulation state and the fixed-timestep tick.
//!
//! Determinism contract: for a fixed RNG seed and an identical, ordered
//! sequence of accepted inputs, `step` produces bit-identical entity
//! state on every run and platform. All physics math is Q16.16, the RNG
//! is an explicit xorshift64 state, and `step` performs no I/O.

use crate::entity::{
    entity_id, module_flags, split_id, Arena, EntityKind, LodTier, ModuleKind, Player,
    Projectile, Ship, SimError,
};
use crate::physics;
use log::{debug, info};
use sha2::{Digest, Sha256};
use shared::fixed::{self, fx, Fx, Vec2, HALF_PI_FX, ONE};
use shared::protocol::action;
use shared::FIXED_DT;

/// Cannon reload time in ticks (2 s at 30 Hz).
const CANNON_RELOAD_TICKS: u16 = 60;
/// Cannonball flight time in ticks.
const PROJECTILE_LIFETIME_TICKS: u16 = 75;
pub const PROJECTILE_DAMAGE: u8 = 25;
/// Ticks a dead hull stays visible before it slips under (5 s).
const SINK_TICKS: u16 = 150;
/// Aim spread half-width in Q16.16 radians (~1.4°).
const CANNON_SPREAD: Fx = ONE / 40;
/// LOD distance cutoffs, squared, as Q32.32.
const LOD_MEDIUM_DIST: i64 = sq(fx(96));
const LOD_LOW_DIST: i64 = sq(fx(192));
const LOD_MINIMAL_DIST: i64 = sq(fx(384));

const fn sq(v: Fx) -> i64 {
    v as i64 * v as i64
}

/// Explicit xorshift64 state. Hashable and identical everywhere, which a
/// library RNG's opaque internals would not guarantee across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rng64 {
    state: u64,
}

impl Rng64 {
    pub fn new(seed: u64) -> Self {
        Rng64 {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform value in [-bound, bound], fixed-point friendly.
    pub fn next_symmetric(&mut self, bound: Fx) -> Fx {
        if bound == 0 {
            return 0;
        }
        let span = bound as i64 * 2 + 1;
        (self.next_u64() as i64).rem_euclid(span) as Fx - bound
    }

    pub fn state(&self) -> u64 {
        self.state
    }
}

/// One gated input command, as handed to `apply_input` after validation.
/// For a player at a helm, `movement.x` drives throttle and `movement.y`
/// the rudder; on foot it is the walk direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputCommand {
    pub seq: u16,
    /// Movement vector in Q16.16, magnitude ≤ 1 after clamping.
    pub movement: Vec2,
    pub actions: u16,
    pub client_time: u32,
    pub dt_ms: u16,
}

/// The authoritative simulation: tick counter, elapsed time, RNG state
/// and the three entity arenas. The simulation owns all entities
/// exclusively; nothing outside mutates them except through the tick's
/// command-application phase.
pub struct Sim {
    pub tick: u64,
    /// Elapsed simulated seconds, Q16.16.
    pub elapsed: Fx,
    rng: Rng64,
    ships: Arena<Ship>,
    players: Arena<Player>,
    projectiles: Arena<Projectile>,
}

/// Wire-facing view of one entity, handed to the snapshot codec.
#[derive(Debug, Clone, Copy)]
pub struct WireState {
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: Fx,
    pub health: u8,
    pub state_flags: u8,
}

impl Sim {
    pub fn new(seed: u64) -> Self {
        info!("Simulation created with seed {:#018x}", seed);
        Sim {
            tick: 0,
            elapsed: 0,
            rng: Rng64::new(seed),
            ships: Arena::new(EntityKind::Ship),
            players: Arena::new(EntityKind::Player),
            projectiles: Arena::new(EntityKind::Projectile),
        }
    }

    // -- spawning ----------------------------------------------------------

    pub fn spawn_ship(&mut self, position: Vec2, rotation: Fx) -> Result<u16, SimError> {
        let slot = self.ships.insert(Ship::new(position, rotation))?;
        Ok(entity_id(EntityKind::Ship, slot))
    }

    pub fn spawn_player(&mut self, position: Vec2) -> Result<u16, SimError> {
        let slot = self.players.insert(Player::new(position))?;
        Ok(entity_id(EntityKind::Player, slot))
    }

    pub fn spawn_projectile(
        &mut self,
        position: Vec2,
        velocity: Vec2,
        owner: u16,
        damage: u8,
    ) -> Result<u16, SimError> {
        let slot = self.projectiles.insert(Projectile {
            position,
            velocity,
            ticks_left: PROJECTILE_LIFETIME_TICKS,
            owner,
            damage,
        })?;
        Ok(entity_id(EntityKind::Projectile, slot))
    }

    /// Removes any entity by public id. Idempotent: false when already gone.
    pub fn destroy_entity(&mut self, id: u16) -> bool {
        match split_id(id) {
            Some((EntityKind::Ship, slot)) => self.ships.remove(slot),
            Some((EntityKind::Player, slot)) => self.players.remove(slot),
            Some((EntityKind::Projectile, slot)) => self.projectiles.remove(slot),
            None => false,
        }
    }

    // -- input -------------------------------------------------------------

    /// Applies one accepted command to one player's control state. Never
    /// advances physics; `step` consumes what is set here.
    pub fn apply_input(&mut self, player_id: u16, cmd: &InputCommand) -> Result<(), SimError> {
        let (kind, slot) = split_id(player_id).ok_or(SimError::NoSuchEntity(player_id))?;
        if kind != EntityKind::Player {
            return Err(SimError::NoSuchEntity(player_id));
        }
        let aboard = {
            let player = self
                .players
                .get_mut(slot)
                .ok_or(SimError::NoSuchEntity(player_id))?;
            player.move_input = clamp_unit(cmd.movement);
            player.actions = cmd.actions & action::ALL;
            player.aboard
        };

        if let Some(ship_id) = aboard {
            if let Some((EntityKind::Ship, ship_slot)) = split_id(ship_id) {
                if let Some(ship) = self.ships.get_mut(ship_slot) {
                    ship.throttle = cmd.movement.x.clamp(-ONE, ONE);
                    ship.rudder = cmd.movement.y.clamp(-ONE, ONE);
                    if cmd.actions & action::FIRE != 0 {
                        for module in &mut ship.modules {
                            if let ModuleKind::Cannon { .. } = module.kind {
                                if module.flags & (module_flags::DESTROYED | module_flags::RELOADING)
                                    == 0
                                {
                                    module.flags |= module_flags::FIRING;
                                }
                            }
                        }
                    }
                    if cmd.actions & action::RAISE_SAIL != 0 {
                        set_sail(ship, true);
                    }
                    if cmd.actions & action::LOWER_SAIL != 0 {
                        set_sail(ship, false);
                    }
                }
            }
        }
        Ok(())
    }

    /// Puts a player at a ship's helm (or takes them off with `None`).
    pub fn board(&mut self, player_id: u16, ship_id: Option<u16>) -> Result<(), SimError> {
        let (kind, slot) = split_id(player_id).ok_or(SimError::NoSuchEntity(player_id))?;
        if kind != EntityKind::Player {
            return Err(SimError::NoSuchEntity(player_id));
        }
        let player = self
            .players
            .get_mut(slot)
            .ok_or(SimError::NoSuchEntity(player_id))?;
        player.aboard = ship_id;
        Ok(())
    }

    // -- tick --------------------------------------------------------------

    /// Advances the world by exactly one fixed timestep. Entity-array
    /// order throughout; side effects confined to the arenas and the
    /// tick counter.
    pub fn step(&mut self) {
        let dt = FIXED_DT;
        self.refresh_lod();

        // Ship integration, honoring each ship's LOD update interval.
        // A skipped ship keeps its last-known state; it is still visible
        // to the snapshot path.
        for (_, ship) in self.ships.iter_mut() {
            if self.tick % ship.lod.update_interval() == 0 {
                physics::integrate_ship(ship, dt);
            }
        }

        self.resolve_ship_collisions();

        // Players stand on deck or walk; they are always full fidelity.
        for (_, player) in self.players.iter_mut() {
            physics::integrate_player(player, dt);
        }

        self.step_projectiles(dt);
        self.step_modules();
        self.sink_ships();

        self.tick += 1;
        self.elapsed += dt;
    }

    fn resolve_ship_collisions(&mut self) {
        // Pairwise over live slots in ascending order so the resolution
        // sequence is deterministic.
        let slots: Vec<u16> = self.ships.iter().map(|(s, _)| s).collect();
        for i in 0..slots.len() {
            for j in (i + 1)..slots.len() {
                // Two disjoint mutable borrows out of one arena.
                let (a, b) = (slots[i], slots[j]);
                let mut ship_a = match self.ships.get(a) {
                    Some(s) => s.clone(),
                    None => continue,
                };
                let Some(ship_b) = self.ships.get_mut(b) else {
                    continue;
                };
                if physics::resolve_ship_collision(&mut ship_a, ship_b) {
                    *self.ships.get_mut(a).unwrap() = ship_a;
                }
            }
        }
    }

    fn step_projectiles(&mut self, dt: Fx) {
        let mut expired: Vec<u16> = Vec::new();
        let mut impacts: Vec<(u16, u16, u8)> = Vec::new(); // (proj slot, ship slot, damage)

        let ship_poses: Vec<(u16, Vec2, Fx, Fx)> = self
            .ships
            .iter()
            .map(|(s, ship)| (s, ship.position, ship.rotation, ship.bounding_radius))
            .collect();

        for (slot, proj) in self.projectiles.iter_mut() {
            if !physics::integrate_projectile(proj, dt) {
                expired.push(slot);
                continue;
            }
            for &(ship_slot, pos, _rot, radius) in &ship_poses {
                if entity_id(EntityKind::Ship, ship_slot) == proj.owner {
                    continue;
                }
                let d = proj.position.sub(pos);
                if d.length_sq() > radius as i64 * radius as i64 {
                    continue;
                }
                impacts.push((slot, ship_slot, proj.damage));
                break;
            }
        }

        // Narrow-phase and damage after the iteration so borrows stay simple.
        for (proj_slot, ship_slot, damage) in impacts {
            let hit = {
                let proj = match self.projectiles.get(proj_slot) {
                    Some(p) => *p,
                    None => continue,
                };
                match self.ships.get(ship_slot) {
                    Some(ship) => physics::point_in_hull(
                        proj.position,
                        &ship.hull,
                        ship.position,
                        ship.rotation,
                    ),
                    None => false,
                }
            };
            if hit {
                self.damage_ship(ship_slot, damage);
                expired.push(proj_slot);
            }
        }

        for slot in expired {
            self.projectiles.remove(slot);
        }
    }

    fn step_modules(&mut self) {
        let mut shots: Vec<(u16, Vec2, Vec2)> = Vec::new(); // (owner id, position, velocity)

        for (slot, ship) in self.ships.iter_mut() {
            let ship_id = entity_id(EntityKind::Ship, slot);
            for module in &mut ship.modules {
                match &mut module.kind {
                    ModuleKind::Cannon { reload_ticks, ammo } => {
                        if *reload_ticks > 0 {
                            *reload_ticks -= 1;
                            if *reload_ticks == 0 {
                                module.flags &= !module_flags::RELOADING;
                            }
                        } else if module.flags & module_flags::FIRING != 0 && *ammo > 0 {
                            *ammo -= 1;
                            *reload_ticks = CANNON_RELOAD_TICKS;
                            module.flags &= !module_flags::FIRING;
                            module.flags |= module_flags::RELOADING;

                            // Broadside: fire out of whichever side the
                            // cannon is mounted on, with a little spread.
                            let side = if module.offset.y >= 0 {
                                HALF_PI_FX
                            } else {
                                -HALF_PI_FX
                            };
                            let spread = self.rng.next_symmetric(CANNON_SPREAD);
                            let dir = fixed::heading(ship.rotation + side + spread);
                            let muzzle = ship
                                .position
                                .add(module.offset.rotate(ship.rotation));
                            let velocity =
                                dir.scale(physics::PROJECTILE_SPEED).add(ship.velocity);
                            shots.push((ship_id, muzzle, velocity));
                            ship.in_combat = true;
                        } else {
                            module.flags &= !module_flags::FIRING;
                        }
                    }
                    ModuleKind::Mast { raise } => {
                        // The sail eases toward its deployed/furled target.
                        let target = if module.flags & module_flags::DEPLOYED != 0 {
                            ONE
                        } else {
                            0
                        };
                        let step = ONE / 60;
                        if *raise < target {
                            *raise = (*raise + step).min(target);
                        } else if *raise > target {
                            *raise = (*raise - step).max(target);
                        }
                    }
                    ModuleKind::Helm => {}
                    ModuleKind::Seat { .. } => {}
                }
                if ship.health < crate::entity::SHIP_MAX_HEALTH / 4 {
                    module.flags |= module_flags::DAMAGED;
                }
            }
        }

        for (owner, position, velocity) in shots {
            if let Err(e) = self.spawn_projectile(position, velocity, owner, PROJECTILE_DAMAGE) {
                debug!("Dropped cannon shot: {}", e);
            }
        }
    }

    /// Applies externally validated damage (rewind-confirmed hits) to a
    /// ship. Non-ship targets are ignored; returns whether it landed.
    pub fn apply_damage(&mut self, id: u16, amount: u8) -> bool {
        match split_id(id) {
            Some((EntityKind::Ship, slot)) if self.ships.get(slot).is_some() => {
                self.damage_ship(slot, amount);
                true
            }
            _ => false,
        }
    }

    fn damage_ship(&mut self, slot: u16, amount: u8) {
        if let Some(ship) = self.ships.get_mut(slot) {
            ship.health = ship.health.saturating_sub(amount);
            ship.in_combat = true;
            if ship.health == 0 && !ship.sinking {
                ship.sinking = true;
                ship.sink_ticks = SINK_TICKS;
            }
        }
    }

    /// Sinking hulls count down for a few seconds, then despawn.
    fn sink_ships(&mut self) {
        let mut gone: Vec<u16> = Vec::new();
        for (slot, ship) in self.ships.iter_mut() {
            if ship.sinking {
                ship.sink_ticks = ship.sink_ticks.saturating_sub(1);
                if ship.sink_ticks == 0 {
                    gone.push(slot);
                }
            }
        }
        for slot in gone {
            let id = entity_id(EntityKind::Ship, slot);
            info!("Ship {:#06x} sank", id);
            self.ships.remove(slot);
            // Anyone standing on it goes into the water.
            for (_, player) in self.players.iter_mut() {
                if player.aboard == Some(id) {
                    player.aboard = None;
                }
            }
        }
    }

    /// Reassigns LOD tiers by distance to the nearest player; combat or
    /// a crewed helm pins a ship at full fidelity.
    fn refresh_lod(&mut self) {
        let observers: Vec<Vec2> = self.players.iter().map(|(_, p)| p.position).collect();
        let crewed: Vec<u16> = self
            .players
            .iter()
            .filter_map(|(_, p)| p.aboard)
            .collect();

        for (slot, ship) in self.ships.iter_mut() {
            let id = entity_id(EntityKind::Ship, slot);
            if ship.in_combat || crewed.contains(&id) {
                ship.lod = LodTier::Full;
                continue;
            }
            ship.lod = tier_for_distance(nearest_sq(ship.position, &observers));
        }
    }

    // -- read access -------------------------------------------------------

    pub fn ship(&self, slot: u16) -> Option<&Ship> {
        self.ships.get(slot)
    }

    pub fn player(&self, slot: u16) -> Option<&Player> {
        self.players.get(slot)
    }

    /// Live ships with their public ids, slot order.
    pub fn ships(&self) -> impl Iterator<Item = (u16, &Ship)> {
        self.ships
            .iter()
            .map(|(slot, s)| (entity_id(EntityKind::Ship, slot), s))
    }

    /// Live players with their public ids, slot order.
    pub fn players(&self) -> impl Iterator<Item = (u16, &Player)> {
        self.players
            .iter()
            .map(|(slot, p)| (entity_id(EntityKind::Player, slot), p))
    }

    pub fn player_position(&self, player_id: u16) -> Option<Vec2> {
        match split_id(player_id)? {
            (EntityKind::Player, slot) => self.players.get(slot).map(|p| p.position),
            _ => None,
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.ships.len(),
            self.players.len(),
            self.projectiles.len(),
        )
    }

    /// Every live entity id and its position, in id order. Feeds the AOI
    /// grid refresh.
    pub fn entity_positions(&self) -> Vec<(u16, Vec2)> {
        let mut out =
            Vec::with_capacity(self.ships.len() + self.players.len() + self.projectiles.len());
        for (slot, ship) in self.ships.iter() {
            out.push((entity_id(EntityKind::Ship, slot), ship.position));
        }
        for (slot, player) in self.players.iter() {
            out.push((entity_id(EntityKind::Player, slot), player.position));
        }
        for (slot, proj) in self.projectiles.iter() {
            out.push((entity_id(EntityKind::Projectile, slot), proj.position));
        }
        out
    }

    /// Wire-facing state for one entity, if it is alive.
    pub fn wire_state(&self, id: u16) -> Option<WireState> {
        match split_id(id)? {
            (EntityKind::Ship, slot) => self.ships.get(slot).map(|s| WireState {
                position: s.position,
                velocity: s.velocity,
                rotation: s.rotation,
                health: s.health,
                state_flags: s.state_flags(),
            }),
            (EntityKind::Player, slot) => self.players.get(slot).map(|p| WireState {
                position: p.position,
                velocity: p.velocity,
                rotation: 0,
                health: p.health,
                state_flags: p.state_flags(),
            }),
            (EntityKind::Projectile, slot) => self.projectiles.get(slot).map(|p| WireState {
                position: p.position,
                velocity: p.velocity,
                rotation: 0,
                health: 255,
                state_flags: 0,
            }),
        }
    }

    pub fn rng_state(&self) -> u64 {
        self.rng.state()
    }

    /// SHA-256 over the canonical little-endian encoding of everything
    /// that defines the simulation: tick, RNG state, and every live
    /// entity's fixed-point fields. Two runs that ever diverge will
    /// disagree here; callers treat a mismatch as fatal to the
    /// determinism guarantee, never as noise.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.tick.to_le_bytes());
        h.update(self.elapsed.to_le_bytes());
        h.update(self.rng.state().to_le_bytes());

        for (slot, ship) in self.ships.iter() {
            h.update(slot.to_le_bytes());
            hash_vec2(&mut h, ship.position);
            hash_vec2(&mut h, ship.velocity);
            h.update(ship.rotation.to_le_bytes());
            h.update(ship.angular_velocity.to_le_bytes());
            h.update(ship.throttle.to_le_bytes());
            h.update(ship.rudder.to_le_bytes());
            h.update(ship.sink_ticks.to_le_bytes());
            h.update([ship.health, ship.state_flags()]);
            for module in &ship.modules {
                h.update([module.flags]);
                match module.kind {
                    ModuleKind::Cannon { reload_ticks, ammo } => {
                        h.update([0u8]);
                        h.update(reload_ticks.to_le_bytes());
                        h.update(ammo.to_le_bytes());
                    }
                    ModuleKind::Mast { raise } => {
                        h.update([1u8]);
                        h.update(raise.to_le_bytes());
                    }
                    ModuleKind::Helm => h.update([2u8]),
                    ModuleKind::Seat { occupant } => {
                        h.update([3u8]);
                        h.update(occupant.unwrap_or(u16::MAX).to_le_bytes());
                    }
                }
            }
        }
        for (slot, player) in self.players.iter() {
            h.update(slot.to_le_bytes());
            hash_vec2(&mut h, player.position);
            hash_vec2(&mut h, player.velocity);
            h.update([player.health, player.state_flags()]);
        }
        for (slot, proj) in self.projectiles.iter() {
            h.update(slot.to_le_bytes());
            hash_vec2(&mut h, proj.position);
            hash_vec2(&mut h, proj.velocity);
            h.update(proj.ticks_left.to_le_bytes());
            h.update(proj.owner.to_le_bytes());
        }
        h.finalize().into()
    }
}

fn hash_vec2(h: &mut Sha256, v: Vec2) {
    h.update(v.x.to_le_bytes());
    h.update(v.y.to_le_bytes());
}

fn nearest_sq(p: Vec2, observers: &[Vec2]) -> i64 {
    observers
        .iter()
        .map(|o| p.sub(*o).length_sq())
        .min()
        .unwrap_or(i64::MAX)
}

fn tier_for_distance(dist_sq: i64) -> LodTier {
    if dist_sq <= LOD_MEDIUM_DIST {
        LodTier::Full
    } else if dist_sq <= LOD_LOW_DIST {
        LodTier::Medium
    } else if dist_sq <= LOD_MINIMAL_DIST {
        LodTier::Low
    } else {
        LodTier::Minimal
    }
}

/// Clamps a movement vector to unit magnitude without touching shorter
/// inputs, so analog sticks keep their fine control.
fn clamp_unit(v: Vec2) -> Vec2 {
    if v.length_sq() > ONE as i64 * ONE as i64 {
        v.normalize()
    } else {
        v
    }
}

fn set_sail(ship: &mut Ship, deployed: bool) {
    for module in &mut ship.modules {
        if let ModuleKind::Mast { .. } = module.kind {
            if deployed {
                module.flags |= module_flags::DEPLOYED;
            } else {
                module.flags &= !module_flags::DEPLOYED;
            }
        }
    }
}
