//! Entity types and arena storage for the authoritative simulation.
//!
//! Each entity kind lives in its own fixed-capacity arena; the public
//! `u16` entity id packs the kind into the top four bits and the arena
//! slot into the low twelve, so ids route without a lookup table.

use shared::fixed::{Fx, Vec2, ONE};
use shared::{MAX_PLAYERS, MAX_PROJECTILES, MAX_SHIPS};
use thiserror::Error;

/// Hulls are capped at eight local-space vertices.
pub const MAX_HULL_VERTICES: usize = 8;
/// Modules mounted on one ship.
pub const MAX_MODULES: usize = 12;

pub const SHIP_MAX_HEALTH: u8 = 200;
pub const PLAYER_MAX_HEALTH: u8 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("{kind:?} arena at capacity ({cap})")]
    AtCapacity { kind: EntityKind, cap: usize },
    #[error("no such entity {0:#06x}")]
    NoSuchEntity(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Ship,
    Player,
    Projectile,
}

impl EntityKind {
    pub const fn tag(self) -> u16 {
        match self {
            EntityKind::Ship => 0,
            EntityKind::Player => 1,
            EntityKind::Projectile => 2,
        }
    }

    pub const fn capacity(self) -> usize {
        match self {
            EntityKind::Ship => MAX_SHIPS,
            EntityKind::Player => MAX_PLAYERS,
            EntityKind::Projectile => MAX_PROJECTILES,
        }
    }
}

/// Packs a kind tag and arena slot into a public entity id.
#[inline]
pub const fn entity_id(kind: EntityKind, slot: u16) -> u16 {
    (kind.tag() << 12) | (slot & 0x0FFF)
}

/// Splits a public entity id back into kind and slot.
pub fn split_id(id: u16) -> Option<(EntityKind, u16)> {
    let slot = id & 0x0FFF;
    let kind = match id >> 12 {
        0 => EntityKind::Ship,
        1 => EntityKind::Player,
        2 => EntityKind::Projectile,
        _ => return None,
    };
    if (slot as usize) < kind.capacity() {
        Some((kind, slot))
    } else {
        None
    }
}

/// Module state flag bits (the `state_data` bitfield on the wire).
pub mod module_flags {
    pub const ACTIVE: u8 = 0x01;
    pub const DAMAGED: u8 = 0x02;
    pub const DESTROYED: u8 = 0x04;
    pub const FIRING: u8 = 0x08;
    pub const RELOADING: u8 = 0x10;
    pub const OCCUPIED: u8 = 0x20;
    pub const DEPLOYED: u8 = 0x40;
    pub const LOCKED: u8 = 0x80;
}

/// Per-kind module payload. A cannon counts reload ticks, a mast tracks
/// how far the sail is raised, a seat remembers its occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Cannon { reload_ticks: u16, ammo: u16 },
    Mast { raise: Fx },
    Helm,
    Seat { occupant: Option<u16> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Module {
    pub kind: ModuleKind,
    /// Mount point in ship-local space.
    pub offset: Vec2,
    pub flags: u8,
}

impl Module {
    pub fn cannon(offset: Vec2) -> Self {
        Module {
            kind: ModuleKind::Cannon {
                reload_ticks: 0,
                ammo: 64,
            },
            offset,
            flags: module_flags::ACTIVE,
        }
    }

    pub fn mast(offset: Vec2) -> Self {
        Module {
            kind: ModuleKind::Mast { raise: ONE },
            offset,
            flags: module_flags::ACTIVE | module_flags::DEPLOYED,
        }
    }

    pub fn helm(offset: Vec2) -> Self {
        Module {
            kind: ModuleKind::Helm,
            offset,
            flags: module_flags::ACTIVE,
        }
    }

    pub fn seat(offset: Vec2) -> Self {
        Module {
            kind: ModuleKind::Seat { occupant: None },
            offset,
            flags: module_flags::ACTIVE,
        }
    }
}

/// Physics level-of-detail tier; controls solver effort and update rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LodTier {
    Full,
    Medium,
    Low,
    Minimal,
}

impl LodTier {
    /// Ticks between physics updates at this tier.
    pub const fn update_interval(self) -> u64 {
        match self {
            LodTier::Full => 1,
            LodTier::Medium => 2,
            LodTier::Low => 10,
            LodTier::Minimal => 30,
        }
    }

    /// Constraint-solver iterations at this tier.
    pub const fn solver_iterations(self) -> u32 {
        match self {
            LodTier::Full => 4,
            LodTier::Medium => 2,
            LodTier::Low => 1,
            LodTier::Minimal => 1,
        }
    }

    /// Continuous collision detection only runs at full fidelity.
    pub const fn ccd_enabled(self) -> bool {
        matches!(self, LodTier::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ship {
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: Fx,
    pub angular_velocity: Fx,
    pub health: u8,
    /// Local-space collision polygon, wound counter-clockwise.
    pub hull: Vec<Vec2>,
    /// Conservative bounding radius of the hull, for broad phase.
    pub bounding_radius: Fx,
    pub modules: Vec<Module>,
    pub lod: LodTier,
    pub in_combat: bool,
    /// Thrust command currently applied through the helm, Q16.16 −1..1.
    pub throttle: Fx,
    /// Turn command currently applied through the helm, Q16.16 −1..1.
    pub rudder: Fx,
    pub sinking: bool,
    /// Ticks until a sinking hull slips under and despawns.
    pub sink_ticks: u16,
}

impl Ship {
    /// A standard sloop hull: 24 units long, 10 wide.
    pub fn new(position: Vec2, rotation: Fx) -> Self {
        let hull = vec![
            Vec2::from_int(12, 0),
            Vec2::from_int(7, 5),
            Vec2::from_int(-10, 5),
            Vec2::from_int(-12, 0),
            Vec2::from_int(-10, -5),
            Vec2::from_int(7, -5),
        ];
        let bounding_radius = hull
            .iter()
            .map(|v| v.length())
            .max()
            .unwrap_or(0);
        Ship {
            position,
            velocity: Vec2::ZERO,
            rotation,
            angular_velocity: 0,
            health: SHIP_MAX_HEALTH,
            hull,
            bounding_radius,
            modules: vec![
                Module::helm(Vec2::from_int(-8, 0)),
                Module::mast(Vec2::from_int(0, 0)),
                Module::cannon(Vec2::from_int(3, 4)),
                Module::cannon(Vec2::from_int(3, -4)),
                Module::seat(Vec2::from_int(-6, 2)),
            ],
            lod: LodTier::Full,
            in_combat: false,
            throttle: 0,
            rudder: 0,
            sinking: false,
            sink_ticks: 0,
        }
    }

    /// State byte for the snapshot wire format.
    pub fn state_flags(&self) -> u8 {
        let mut f = 0u8;
        if self.sinking {
            f |= 0x01;
        }
        if self.in_combat {
            f |= 0x02;
        }
        f
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: u8,
    /// Ship this player stands on, if any.
    pub aboard: Option<u16>,
    /// Latest accepted movement input, Q16.16, magnitude ≤ 1.
    pub move_input: Vec2,
    pub actions: u16,
    pub lod: LodTier,
    pub in_combat: bool,
}

impl Player {
    pub fn new(position: Vec2) -> Self {
        Player {
            position,
            velocity: Vec2::ZERO,
            health: PLAYER_MAX_HEALTH,
            aboard: None,
            move_input: Vec2::ZERO,
            actions: 0,
            lod: LodTier::Full,
            in_combat: false,
        }
    }

    pub fn state_flags(&self) -> u8 {
        let mut f = 0u8;
        if self.aboard.is_some() {
            f |= 0x01;
        }
        if self.in_combat {
            f |= 0x02;
        }
        f
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projectile {
    pub position: Vec2,
    pub velocity: Vec2,
    pub ticks_left: u16,
    /// Ship entity id that fired this shot.
    pub owner: u16,
    pub damage: u8,
}

/// Fixed-capacity slot arena with a free list. Slot indices are stable
/// for an entity's lifetime and become the low bits of its public id.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    kind: EntityKind,
    slots: Vec<Option<T>>,
    free: Vec<u16>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new(kind: EntityKind) -> Self {
        let cap = kind.capacity();
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || None);
        // Hand out low slots first.
        let free = (0..cap as u16).rev().collect();
        Arena {
            kind,
            slots,
            free,
            live: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Result<u16, SimError> {
        let slot = self.free.pop().ok_or(SimError::AtCapacity {
            kind: self.kind,
            cap: self.kind.capacity(),
        })?;
        self.slots[slot as usize] = Some(value);
        self.live += 1;
        Ok(slot)
    }

    /// Idempotent removal; false if the slot was already empty.
    pub fn remove(&mut self, slot: u16) -> bool {
        match self.slots.get_mut(slot as usize) {
            Some(s) if s.is_some() => {
                *s = None;
                self.free.push(slot);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, slot: u16) -> Option<&T> {
        self.slots.get(slot as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: u16) -> Option<&mut T> {
        self.slots.get_mut(slot as usize).and_then(|s| s.as_mut())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entries in slot order. Iteration order is the determinism
    /// contract's "entity-array order".
    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u16, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u16, v)))
    }
}
