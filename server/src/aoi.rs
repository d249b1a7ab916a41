//! Area-of-interest grid: which entities matter to each player, and how
//! often each should be refreshed.
//!
//! A fixed 128×128 grid of 64-unit cells indexes every live entity by
//! position. Per-player subscriptions track up to 32 nearby entities,
//! ranked by distance into HIGH/MID/LOW tiers that drive snapshot
//! cadence. Tier assignment is purely rank-by-distance and only ever
//! changes when the subscription refreshes.

use log::debug;
use shared::fixed::{fx, Fx, Vec2};
use shared::{
    CELL_SIZE, GRID_DIM, HIGH_TIER_SLOTS, MAX_ENTITIES_PER_CELL, MAX_TRACKED_ENTITIES,
    MID_TIER_SLOTS,
};
use std::collections::HashMap;

/// Radius inside which entities are candidates for tracking.
pub const AOI_RADIUS: Fx = fx(256);

/// Snapshot priority tier, by distance rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AoiTier {
    High,
    Mid,
    Low,
}

impl AoiTier {
    pub const ALL: [AoiTier; 3] = [AoiTier::High, AoiTier::Mid, AoiTier::Low];

    pub const fn index(self) -> usize {
        match self {
            AoiTier::High => 0,
            AoiTier::Mid => 1,
            AoiTier::Low => 2,
        }
    }

    /// Tier for a 0-based distance rank.
    fn for_rank(rank: usize) -> AoiTier {
        if rank < HIGH_TIER_SLOTS {
            AoiTier::High
        } else if rank < HIGH_TIER_SLOTS + MID_TIER_SLOTS {
            AoiTier::Mid
        } else {
            AoiTier::Low
        }
    }
}

/// One tracked entity within a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub id: u16,
    pub tier: AoiTier,
    pub dist_sq: i64,
}

/// A player's view of the world: current cell, ranked tracked set, and
/// per-tier last-refresh bookkeeping (owned here, consumed by the
/// snapshot cadence gate).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub player_entity: u16,
    pub cell: u16,
    pub tracked: Vec<Tracked>,
    pub last_update_ms: [u64; 3],
}

impl Subscription {
    pub fn new(player_entity: u16) -> Self {
        Subscription {
            player_entity,
            cell: 0,
            tracked: Vec::with_capacity(MAX_TRACKED_ENTITIES),
            last_update_ms: [0; 3],
        }
    }

    pub fn tier_of(&self, id: u16) -> Option<AoiTier> {
        self.tracked.iter().find(|t| t.id == id).map(|t| t.tier)
    }
}

/// Fixed spatial index. Cells hold bounded id lists; a full cell rejects
/// further inserts (the entity stays invisible to queries until it moves
/// into a cell with room, a deliberate bounded-capacity trade).
pub struct AoiGrid {
    cells: Vec<Vec<u16>>,
    /// Reverse map: entity id -> cell index currently containing it.
    locations: HashMap<u16, u16>,
    /// Inserts refused because the target cell was full.
    pub overflow_count: u64,
}

/// Cell index for a world position.
pub fn cell_of(position: Vec2) -> u16 {
    let cx = ((position.x >> 16) / CELL_SIZE).clamp(0, GRID_DIM as i32 - 1);
    let cy = ((position.y >> 16) / CELL_SIZE).clamp(0, GRID_DIM as i32 - 1);
    (cy * GRID_DIM as i32 + cx) as u16
}

/// World origin (min corner) of a cell, for relative position encoding.
pub fn cell_origin(cell: u16) -> Vec2 {
    let cx = (cell as i32 % GRID_DIM as i32) * CELL_SIZE;
    let cy = (cell as i32 / GRID_DIM as i32) * CELL_SIZE;
    Vec2::from_int(cx, cy)
}

impl AoiGrid {
    pub fn new() -> Self {
        let mut cells = Vec::with_capacity(GRID_DIM * GRID_DIM);
        cells.resize_with(GRID_DIM * GRID_DIM, Vec::new);
        AoiGrid {
            cells,
            locations: HashMap::new(),
            overflow_count: 0,
        }
    }

    /// Adds an entity at a position. False if the target cell is full.
    pub fn insert_entity(&mut self, id: u16, position: Vec2) -> bool {
        let cell = cell_of(position);
        let list = &mut self.cells[cell as usize];
        if list.len() >= MAX_ENTITIES_PER_CELL {
            self.overflow_count += 1;
            debug!("AOI cell {} full, dropping entity {:#06x}", cell, id);
            return false;
        }
        list.push(id);
        self.locations.insert(id, cell);
        true
    }

    pub fn remove_entity(&mut self, id: u16) -> bool {
        match self.locations.remove(&id) {
            Some(cell) => {
                let list = &mut self.cells[cell as usize];
                if let Some(at) = list.iter().position(|&e| e == id) {
                    list.swap_remove(at);
                }
                true
            }
            None => false,
        }
    }

    /// Moves an entity, a no-op when it stays within its cell.
    pub fn update_entity(&mut self, id: u16, position: Vec2) -> bool {
        let new_cell = cell_of(position);
        match self.locations.get(&id) {
            Some(&cell) if cell == new_cell => true,
            Some(_) => {
                self.remove_entity(id);
                self.insert_entity(id, position)
            }
            None => self.insert_entity(id, position),
        }
    }

    /// Candidate ids within a cell rectangle around a center cell.
    pub fn query_cells(&self, center_cell: u16, radius_cells: i32) -> Vec<u16> {
        let cx = center_cell as i32 % GRID_DIM as i32;
        let cy = center_cell as i32 / GRID_DIM as i32;
        let mut out = Vec::new();
        for y in (cy - radius_cells).max(0)..=(cy + radius_cells).min(GRID_DIM as i32 - 1) {
            for x in (cx - radius_cells).max(0)..=(cx + radius_cells).min(GRID_DIM as i32 - 1) {
                out.extend_from_slice(&self.cells[(y * GRID_DIM as i32 + x) as usize]);
            }
        }
        out
    }

    /// Candidate ids within a radius. Exact distance filtering happens at
    /// subscription-refresh time; this only prunes to the covering cells.
    pub fn query_radius(&self, center: Vec2, radius: Fx) -> Vec<u16> {
        let radius_cells = ((radius >> 16) + CELL_SIZE - 1) / CELL_SIZE;
        self.query_cells(cell_of(center), radius_cells)
    }

    /// Drops entities that are no longer in the live set (despawned
    /// projectiles, sunk ships). Called before the per-tick position
    /// refresh.
    pub fn retain_entities(&mut self, live: &HashMap<u16, Vec2>) {
        let gone: Vec<u16> = self
            .locations
            .keys()
            .filter(|id| !live.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            self.remove_entity(id);
        }
    }

    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }
}

impl Default for AoiGrid {
    fn default() -> Self {
        Self::new()
    }
}

/// Recomputes a subscription: candidates within `AOI_RADIUS` ranked by
/// distance (ties broken by id so refreshes are deterministic), bounded
/// to the tracked-slot cap, tiers assigned purely by rank. Entities past
/// the cap silently drop out of tracking; they reappear once closer.
pub fn update_subscription(
    sub: &mut Subscription,
    grid: &AoiGrid,
    positions: &HashMap<u16, Vec2>,
    player_position: Vec2,
    now_ms: u64,
) {
    sub.cell = cell_of(player_position);

    let radius_sq = AOI_RADIUS as i64 * AOI_RADIUS as i64;
    let mut ranked: Vec<(i64, u16)> = grid
        .query_radius(player_position, AOI_RADIUS)
        .into_iter()
        .filter_map(|id| {
            let pos = positions.get(&id)?;
            let d = pos.sub(player_position).length_sq();
            (d <= radius_sq).then_some((d, id))
        })
        .collect();
    ranked.sort_unstable();
    ranked.truncate(MAX_TRACKED_ENTITIES);

    sub.tracked.clear();
    for (rank, (dist_sq, id)) in ranked.into_iter().enumerate() {
        sub.tracked.push(Tracked {
            id,
            tier: AoiTier::for_rank(rank),
            dist_sq,
        });
    }
    let _ = now_ms; // tier send timestamps advance in the snapshot path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{entity_id, EntityKind};

    fn positions_of(entries: &[(u16, Vec2)]) -> HashMap<u16, Vec2> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_cell_of_and_origin() {
        assert_eq!(cell_of(Vec2::from_int(0, 0)), 0);
        assert_eq!(cell_of(Vec2::from_int(63, 63)), 0);
        assert_eq!(cell_of(Vec2::from_int(64, 0)), 1);
        assert_eq!(cell_of(Vec2::from_int(0, 64)), GRID_DIM as u16);
        assert_eq!(cell_origin(1), Vec2::from_int(64, 0));
        assert_eq!(cell_origin(GRID_DIM as u16), Vec2::from_int(0, 64));
        // Out-of-world positions clamp to the edge cells.
        assert_eq!(cell_of(Vec2::from_int(-50, -50)), 0);
    }

    #[test]
    fn test_insert_query_remove() {
        let mut grid = AoiGrid::new();
        let id = entity_id(EntityKind::Ship, 0);
        assert!(grid.insert_entity(id, Vec2::from_int(100, 100)));
        assert_eq!(grid.query_radius(Vec2::from_int(110, 110), fx(64)), vec![id]);
        assert!(grid.remove_entity(id));
        assert!(!grid.remove_entity(id));
        assert!(grid.query_radius(Vec2::from_int(110, 110), fx(64)).is_empty());
    }

    #[test]
    fn test_update_moves_between_cells() {
        let mut grid = AoiGrid::new();
        let id = entity_id(EntityKind::Player, 3);
        grid.insert_entity(id, Vec2::from_int(10, 10));
        assert!(grid.update_entity(id, Vec2::from_int(500, 500)));
        assert!(grid.query_cells(cell_of(Vec2::from_int(10, 10)), 0).is_empty());
        assert_eq!(grid.query_cells(cell_of(Vec2::from_int(500, 500)), 0), vec![id]);
    }

    #[test]
    fn test_cell_capacity_bound() {
        let mut grid = AoiGrid::new();
        for i in 0..MAX_ENTITIES_PER_CELL as u16 {
            assert!(grid.insert_entity(entity_id(EntityKind::Projectile, i), Vec2::from_int(10, 10)));
        }
        let extra = entity_id(EntityKind::Projectile, 400);
        assert!(!grid.insert_entity(extra, Vec2::from_int(10, 10)));
        assert_eq!(grid.overflow_count, 1);
    }

    #[test]
    fn test_subscription_tiers_by_distance_rank() {
        let mut grid = AoiGrid::new();
        let player_pos = Vec2::from_int(1000, 1000);
        // 40 entities in a line at increasing distances: the nearest 8
        // are HIGH, the next 16 MID, the next 8 LOW, the rest dropped.
        let mut entries = Vec::new();
        for i in 0..40u16 {
            let id = entity_id(EntityKind::Projectile, i);
            let pos = Vec2::from_int(1000 + 2 * (i as i32 + 1), 1000);
            grid.insert_entity(id, pos);
            entries.push((id, pos));
        }
        let positions = positions_of(&entries);

        let mut sub = Subscription::new(entity_id(EntityKind::Player, 0));
        update_subscription(&mut sub, &grid, &positions, player_pos, 0);

        assert_eq!(sub.tracked.len(), MAX_TRACKED_ENTITIES);
        for (rank, t) in sub.tracked.iter().enumerate() {
            let expected = if rank < 8 {
                AoiTier::High
            } else if rank < 24 {
                AoiTier::Mid
            } else {
                AoiTier::Low
            };
            assert_eq!(t.tier, expected, "rank {}", rank);
        }
        // Ranked nearest-first.
        for pair in sub.tracked.windows(2) {
            assert!(pair[0].dist_sq <= pair[1].dist_sq);
        }
        // The 8 farthest of the 40 fell off the tracked set.
        let dropped = entity_id(EntityKind::Projectile, 39);
        assert!(sub.tier_of(dropped).is_none());
    }

    #[test]
    fn test_subscription_excludes_out_of_radius() {
        let mut grid = AoiGrid::new();
        let near = entity_id(EntityKind::Ship, 1);
        let far = entity_id(EntityKind::Ship, 2);
        let entries = [
            (near, Vec2::from_int(1100, 1000)),
            (far, Vec2::from_int(5000, 5000)),
        ];
        for (id, pos) in entries {
            grid.insert_entity(id, pos);
        }
        let mut sub = Subscription::new(entity_id(EntityKind::Player, 0));
        update_subscription(
            &mut sub,
            &grid,
            &positions_of(&entries),
            Vec2::from_int(1000, 1000),
            0,
        );
        assert_eq!(sub.tier_of(near), Some(AoiTier::High));
        assert_eq!(sub.tier_of(far), None);
    }

    #[test]
    fn test_refresh_retiers_on_movement() {
        let mut grid = AoiGrid::new();
        let id = entity_id(EntityKind::Ship, 1);
        let mut entries = vec![(id, Vec2::from_int(1010, 1000))];
        grid.insert_entity(id, entries[0].1);
        let mut sub = Subscription::new(entity_id(EntityKind::Player, 0));
        let me = Vec2::from_int(1000, 1000);
        update_subscription(&mut sub, &grid, &positions_of(&entries), me, 0);
        assert_eq!(sub.tier_of(id), Some(AoiTier::High));

        // The ship sails out of range; the next refresh drops it.
        entries[0].1 = Vec2::from_int(2000, 2000);
        grid.update_entity(id, entries[0].1);
        update_subscription(&mut sub, &grid, &positions_of(&entries), me, 1000);
        assert_eq!(sub.tier_of(id), None);
    }
}
