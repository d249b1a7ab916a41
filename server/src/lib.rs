//! # Authoritative Ship-Combat Server
//!
//! This library implements the server side of a real-time multiplayer
//! naval game: a deterministic fixed-point simulation of ships, crews
//! and cannon fire, surrounded by the networking machinery that keeps
//! up to a hundred clients synchronized over UDP.
//!
//! ## Core Responsibilities
//!
//! ### Deterministic Simulation
//! All physics runs in Q16.16 fixed point at a fixed 30 Hz timestep.
//! Given the same seed and the same ordered inputs, two runs produce
//! bit-identical state on any platform; a SHA-256 state hash makes
//! divergence detectable rather than silent.
//!
//! ### Interest Management
//! A 128x128 cell grid answers "which entities matter to this player".
//! Each subscription tracks at most 32 entities, ranked by distance into
//! HIGH/MID/LOW tiers that control snapshot frequency.
//!
//! ### Bandwidth-Bounded Snapshots
//! State reaches clients as quantized baselines at a fixed cadence with
//! delta packets in between, encoded against the last baseline each
//! client has acknowledged.
//!
//! ### Custom Reliability over UDP
//! Sequence numbers with a 32-deep ack bitfield, timed resends for
//! packets that must arrive (baselines), RTT estimation and heartbeats.
//!
//! ### Lag Compensation and Anti-Cheat
//! A 16-slot rewind ring lets shots be judged against the world as the
//! shooter saw it; a tiered input validator rates, sanitizes and scores
//! every inbound command before the simulation sees it.
//!
//! ## Module Organization
//!
//! - [`entity`] — entity arenas, ship/player/projectile state, modules
//! - [`physics`] — fixed-point integration and hull collision tests
//! - [`sim`] — the authoritative tick: inputs, integration, combat
//! - [`aoi`] — spatial grid and per-player subscriptions
//! - [`snapshot`] — baseline/delta packet construction
//! - [`reliability`] — sequencing, acks, resends, RTT
//! - [`rewind`] — historical state ring and hit/movement validation
//! - [`validator`] — tiered input rate limiting and suspicion scoring
//! - [`clients`] — connected-client registry
//! - [`network`] — UDP plumbing and the main tick loop
//! - [`stats`] — read-only status for the admin surface

pub mod aoi;
pub mod clients;
pub mod entity;
pub mod network;
pub mod physics;
pub mod reliability;
pub mod rewind;
pub mod sim;
pub mod snapshot;
pub mod stats;
pub mod util;
pub mod validator;
