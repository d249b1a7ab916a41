//! Code shared between the authoritative server and any native client or
//! protocol bridge: the Q16.16 fixed-point math core, the bespoke wire
//! format, and the constants both sides must agree on bit-for-bit.

pub mod fixed;
pub mod protocol;

use fixed::{Fx, ONE};

/// Simulation tick rate in Hz.
pub const TICK_RATE: u32 = 30;
/// Fixed timestep as Q16.16 seconds (1/30 s).
pub const FIXED_DT: Fx = ONE / TICK_RATE as Fx;
/// Tick period in milliseconds, for scheduling and rewind arithmetic.
pub const TICK_MS: u64 = 1000 / TICK_RATE as u64;

// Entity capacities. These bound every arena, AOI cell list and snapshot,
// so nothing in the hot path allocates after startup.
pub const MAX_SHIPS: usize = 50;
pub const MAX_PLAYERS: usize = 100;
pub const MAX_PROJECTILES: usize = 500;

// AOI grid geometry.
pub const GRID_DIM: usize = 128;
pub const CELL_SIZE: i32 = 64;
pub const MAX_ENTITIES_PER_CELL: usize = 32;
pub const MAX_TRACKED_ENTITIES: usize = 32;
pub const HIGH_TIER_SLOTS: usize = 8;
pub const MID_TIER_SLOTS: usize = 16;

// Snapshot policy.
pub const BASELINE_INTERVAL: u32 = 30;
pub const MAX_ENTITIES_PER_SNAPSHOT: usize = 32;

// Reliability.
pub const ACK_WINDOW: u16 = 32;
pub const RESEND_TIMEOUT_MS: u64 = 250;
pub const MAX_RESENDS: u8 = 5;
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const MAX_PENDING_RELIABLE: usize = 64;

// Rewind history.
pub const REWIND_SLOTS: usize = 16;

/// World edge length in world units (the AOI grid covers the whole world).
pub const WORLD_SIZE: i32 = GRID_DIM as i32 * CELL_SIZE;

/// Player name length on the wire, zero-padded.
pub const NAME_LEN: usize = 16;

/// Returns elapsed milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
