//! Read-only server introspection. `ServerStatus` is built on demand
//! from the live state and serialized with serde; nothing here can
//! mutate the simulation.

use crate::util::Ring;
use serde::Serialize;

/// Tick durations retained for the moving average.
const TICK_HISTORY: usize = 128;

/// Point-in-time server status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub tick: u64,
    pub uptime_secs: u64,
    pub ships: usize,
    pub players: usize,
    pub projectiles: usize,
    pub clients: usize,
    pub bytes_sent: u64,
    pub snapshots_sent: u64,
    pub tick_overruns: u64,
    pub mean_tick_ms: f64,
    pub dropped: DropCounters,
}

/// Packets dropped, by reason.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DropCounters {
    /// Failed checksum, truncation, bad version or unknown type.
    pub malformed: u64,
    /// Rejected by the input validator.
    pub rejected_inputs: u64,
    /// Reliability-window duplicates and too-old sequences.
    pub stale_sequences: u64,
    /// Hit claims outside the rewind window.
    pub unvalidatable_hits: u64,
}

/// Counters the tick loop feeds as it runs.
pub struct ServerStats {
    started_ms: u64,
    tick_durations: Ring<f64>,
    pub tick_overruns: u64,
    pub dropped: DropCounters,
}

impl ServerStats {
    pub fn new(now_ms: u64) -> Self {
        ServerStats {
            started_ms: now_ms,
            tick_durations: Ring::new(TICK_HISTORY),
            tick_overruns: 0,
            dropped: DropCounters::default(),
        }
    }

    pub fn record_tick(&mut self, duration_ms: f64) {
        self.tick_durations.push(duration_ms);
    }

    pub fn mean_tick_ms(&self) -> f64 {
        if self.tick_durations.is_empty() {
            return 0.0;
        }
        self.tick_durations.iter().sum::<f64>() / self.tick_durations.len() as f64
    }

    pub fn status(
        &self,
        now_ms: u64,
        tick: u64,
        counts: (usize, usize, usize),
        clients: usize,
        bytes_sent: u64,
        snapshots_sent: u64,
    ) -> ServerStatus {
        ServerStatus {
            tick,
            uptime_secs: now_ms.saturating_sub(self.started_ms) / 1000,
            ships: counts.0,
            players: counts.1,
            projectiles: counts.2,
            clients,
            bytes_sent,
            snapshots_sent,
            tick_overruns: self.tick_overruns,
            mean_tick_ms: self.mean_tick_ms(),
            dropped: self.dropped,
        }
    }
}
