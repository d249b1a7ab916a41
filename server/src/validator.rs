//! Server-side input validation. Every command a client sends passes
//! through here before it can touch the simulation. Rate and burst
//! abuse gets the command dropped outright; malformed fields inside an
//! otherwise legal command are sanitized and flagged rather than
//! rejected, so a client with a buggy frame timer still plays while the
//! suspicion score quietly accumulates.
//!
//! The permitted input rate is tiered by what the player is doing:
//! someone idle at anchor has no business sending 60 commands a second.

use log::{debug, warn};
use shared::protocol::{action, CommandPacket};

/// Violation flag bits, also used as suspicion-score weights.
pub mod violation {
    pub const RATE_LIMIT: u8 = 0x01;
    pub const BURST_LIMIT: u8 = 0x02;
    pub const MOVEMENT_BOUNDS: u8 = 0x04;
    pub const ACTION_INVALID: u8 = 0x08;
    pub const TIMESTAMP_ANOMALY: u8 = 0x10;
    pub const DUPLICATE_INPUT: u8 = 0x20;
}

/// Burst cap: no more than this many accepted commands per trailing 100ms.
const BURST_WINDOW_MS: u64 = 100;
const BURST_MAX: usize = 8;

/// Largest believable client frame delta.
const MAX_DT_MS: u16 = 500;

/// Suspicion accrued per violation kind. Hard rejections weigh more.
const SCORE_RATE: u32 = 3;
const SCORE_BURST: u32 = 5;
const SCORE_MOVEMENT: u32 = 2;
const SCORE_ACTION: u32 = 4;
const SCORE_TIMESTAMP: u32 = 1;
const SCORE_DUPLICATE: u32 = 1;

/// Suspicion decays by this much per second of clean play.
const SCORE_DECAY_PER_SEC: u32 = 2;
const BAN_THRESHOLD: u32 = 120;

/// How often a client may legitimately send, by situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationTier {
    /// Anchored, nobody around: 5 Hz is plenty.
    Idle,
    /// Sailing alone: 10 Hz.
    Background,
    /// Other players nearby: 30 Hz.
    Normal,
    /// In combat: full 60 Hz.
    Critical,
}

impl ValidationTier {
    pub fn min_interval_ms(self) -> u64 {
        match self {
            ValidationTier::Idle => 200,
            ValidationTier::Background => 100,
            ValidationTier::Normal => 33,
            ValidationTier::Critical => 16,
        }
    }
}

/// What `validate` decided about one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Apply the (possibly sanitized) command; flags name what was fixed.
    Accept { sanitized: CommandPacket, flags: u8 },
    /// Drop the command; flags name why.
    Reject { flags: u8 },
}

/// Per-client validation state.
pub struct InputValidator {
    tier: ValidationTier,
    last_accept_ms: u64,
    /// Arrival timestamps inside the trailing burst window. Arrivals,
    /// not accepts: a flood of rate-rejected packets still saturates it.
    recent: Vec<u64>,
    last_cmd: Option<CommandPacket>,
    last_client_time: u32,
    pub suspicion: u32,
    last_decay_ms: u64,
    pub violation_counts: [u64; 6],
    pub accepted: u64,
    pub rejected: u64,
}

impl InputValidator {
    pub fn new(now_ms: u64) -> Self {
        InputValidator {
            tier: ValidationTier::Normal,
            last_accept_ms: 0,
            recent: Vec::with_capacity(BURST_MAX + 1),
            last_cmd: None,
            last_client_time: 0,
            suspicion: 0,
            last_decay_ms: now_ms,
            violation_counts: [0; 6],
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn tier(&self) -> ValidationTier {
        self.tier
    }

    /// Re-derives the tier from the player's situation. Called by the
    /// tick loop, not per packet.
    pub fn update_tier(&mut self, players_nearby: bool, in_combat: bool, moving: bool) {
        let next = if in_combat {
            ValidationTier::Critical
        } else if players_nearby {
            ValidationTier::Normal
        } else if moving {
            ValidationTier::Background
        } else {
            ValidationTier::Idle
        };
        if next != self.tier {
            debug!("validation tier {:?} -> {:?}", self.tier, next);
            self.tier = next;
        }
    }

    fn flag(&mut self, flags: &mut u8, bit: u8, score: u32) {
        *flags |= bit;
        self.violation_counts[bit.trailing_zeros() as usize] += 1;
        self.suspicion = self.suspicion.saturating_add(score);
    }

    fn decay(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_decay_ms);
        if elapsed >= 1000 {
            let steps = (elapsed / 1000) as u32;
            self.suspicion = self.suspicion.saturating_sub(steps * SCORE_DECAY_PER_SEC);
            self.last_decay_ms += steps as u64 * 1000;
        }
    }

    /// Runs every check against one command, in severity order. Rate and
    /// burst failures reject; everything else sanitizes and flags.
    pub fn validate(&mut self, cmd: &CommandPacket, now_ms: u64) -> Verdict {
        self.decay(now_ms);
        let mut flags = 0u8;
        self.recent
            .retain(|&t| now_ms.saturating_sub(t) < BURST_WINDOW_MS);
        self.recent.push(now_ms);

        // Rate limit by tier.
        if self.last_accept_ms != 0
            && now_ms.saturating_sub(self.last_accept_ms) < self.tier.min_interval_ms()
        {
            self.flag(&mut flags, violation::RATE_LIMIT, SCORE_RATE);
            self.rejected += 1;
            return Verdict::Reject { flags };
        }

        // Burst limit over the trailing window.
        if self.recent.len() > BURST_MAX {
            self.flag(&mut flags, violation::BURST_LIMIT, SCORE_BURST);
            self.rejected += 1;
            return Verdict::Reject { flags };
        }

        // An exact repeat of the previous command is suspicious (true
        // wire replays were already dropped by the reliability window)
        // but harmless to apply, so it is flagged rather than rejected.
        if self.last_cmd.as_ref() == Some(cmd) {
            self.flag(&mut flags, violation::DUPLICATE_INPUT, SCORE_DUPLICATE);
        }

        let mut sanitized = *cmd;

        // Movement inputs are Q0.15 so each axis is bounded by the type,
        // but the combined stick magnitude must not exceed unit length.
        let tx = sanitized.thrust as i64;
        let ty = sanitized.turn as i64;
        let mag_sq = tx * tx + ty * ty;
        const UNIT: i64 = 32767;
        if mag_sq > UNIT * UNIT {
            self.flag(&mut flags, violation::MOVEMENT_BOUNDS, SCORE_MOVEMENT);
            // Integer scale back onto the unit circle.
            let mag = (mag_sq as f64).sqrt();
            sanitized.thrust = ((tx as f64 * UNIT as f64 / mag) as i64) as i16;
            sanitized.turn = ((ty as f64 * UNIT as f64 / mag) as i64) as i16;
        }

        // Unknown action bits are stripped, not obeyed.
        if sanitized.actions & !action::ALL != 0 {
            self.flag(&mut flags, violation::ACTION_INVALID, SCORE_ACTION);
            sanitized.actions &= action::ALL;
        }

        // Client clocks only move forward, and frame deltas stay sane.
        if sanitized.dt_ms == 0 || sanitized.dt_ms > MAX_DT_MS {
            self.flag(&mut flags, violation::TIMESTAMP_ANOMALY, SCORE_TIMESTAMP);
            sanitized.dt_ms = sanitized.dt_ms.clamp(1, MAX_DT_MS);
        }
        if self.last_client_time != 0 && sanitized.client_time < self.last_client_time {
            self.flag(&mut flags, violation::TIMESTAMP_ANOMALY, SCORE_TIMESTAMP);
            sanitized.client_time = self.last_client_time;
        }

        self.last_accept_ms = now_ms;
        self.last_cmd = Some(*cmd);
        self.last_client_time = sanitized.client_time;
        self.accepted += 1;
        Verdict::Accept { sanitized, flags }
    }

    /// True once accumulated suspicion crosses the ban threshold.
    pub fn should_ban(&self) -> bool {
        if self.suspicion >= BAN_THRESHOLD {
            warn!("suspicion {} crossed ban threshold", self.suspicion);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(seq: u16) -> CommandPacket {
        CommandPacket {
            seq,
            dt_ms: 33,
            thrust: 16000,
            turn: 0,
            actions: action::FIRE,
            client_time: 1000 + seq as u32 * 33,
        }
    }

    fn accept_flags(v: Verdict) -> u8 {
        match v {
            Verdict::Accept { flags, .. } => flags,
            Verdict::Reject { .. } => panic!("expected accept"),
        }
    }

    #[test]
    fn test_tier_intervals() {
        assert_eq!(ValidationTier::Idle.min_interval_ms(), 200);
        assert_eq!(ValidationTier::Background.min_interval_ms(), 100);
        assert_eq!(ValidationTier::Normal.min_interval_ms(), 33);
        assert_eq!(ValidationTier::Critical.min_interval_ms(), 16);
    }

    #[test]
    fn test_tier_derivation() {
        let mut v = InputValidator::new(0);
        v.update_tier(false, false, false);
        assert_eq!(v.tier(), ValidationTier::Idle);
        v.update_tier(false, false, true);
        assert_eq!(v.tier(), ValidationTier::Background);
        v.update_tier(true, false, false);
        assert_eq!(v.tier(), ValidationTier::Normal);
        // Combat wins over everything.
        v.update_tier(false, true, false);
        assert_eq!(v.tier(), ValidationTier::Critical);
    }

    #[test]
    fn test_rate_limit_rejects_too_fast() {
        let mut v = InputValidator::new(0);
        v.update_tier(true, false, false); // Normal, 33ms
        assert!(matches!(v.validate(&cmd(0), 1000), Verdict::Accept { .. }));
        match v.validate(&cmd(1), 1010) {
            Verdict::Reject { flags } => assert_eq!(flags, violation::RATE_LIMIT),
            _ => panic!("expected reject"),
        }
        assert!(matches!(v.validate(&cmd(1), 1040), Verdict::Accept { .. }));
        assert_eq!(v.accepted, 2);
        assert_eq!(v.rejected, 1);
    }

    #[test]
    fn test_critical_tier_allows_sixty_hz() {
        let mut v = InputValidator::new(0);
        v.update_tier(false, true, false);
        let mut now = 1000;
        let mut ok = 0;
        for seq in 0..30u16 {
            if matches!(v.validate(&cmd(seq), now), Verdict::Accept { .. }) {
                ok += 1;
            }
            // 17ms spacing clears both the 16ms interval and the burst cap.
            now += 17;
        }
        assert_eq!(ok, 30);
    }

    #[test]
    fn test_burst_limit() {
        let mut v = InputValidator::new(0);
        v.update_tier(false, true, false); // Critical, 16ms
        let mut now = 1000;
        let mut rejected_burst = false;
        for seq in 0..12u16 {
            match v.validate(&cmd(seq), now) {
                Verdict::Reject { flags } if flags & violation::BURST_LIMIT != 0 => {
                    rejected_burst = true;
                }
                _ => {}
            }
            now += 5; // flood: far more than 8 arrivals per 100ms
        }
        assert!(rejected_burst);
        // After a quiet spell the window clears.
        assert!(matches!(
            v.validate(&cmd(50), now + 500),
            Verdict::Accept { .. }
        ));
    }

    #[test]
    fn test_exact_duplicate_flagged_but_applied() {
        let mut v = InputValidator::new(0);
        assert_eq!(accept_flags(v.validate(&cmd(7), 1000)), 0);
        // Byte-identical repeat: flagged, still accepted.
        match v.validate(&cmd(7), 1100) {
            Verdict::Accept { flags, .. } => {
                assert_eq!(flags, violation::DUPLICATE_INPUT)
            }
            _ => panic!("expected flagged accept"),
        }
        assert_eq!(v.suspicion, SCORE_DUPLICATE);
        assert_eq!(v.accepted, 2);
        assert_eq!(v.rejected, 0);
    }

    #[test]
    fn test_reused_seq_with_new_contents_is_clean() {
        // A client-side resend may reuse a sequence number with fresher
        // stick values; that is not a duplicate.
        let mut v = InputValidator::new(0);
        assert_eq!(accept_flags(v.validate(&cmd(7), 1000)), 0);
        let mut c = cmd(7);
        c.turn = 5000;
        assert_eq!(accept_flags(v.validate(&c, 1100)), 0);
    }

    #[test]
    fn test_oversized_movement_clamped_not_rejected() {
        let mut v = InputValidator::new(0);
        let mut c = cmd(0);
        c.thrust = 32767;
        c.turn = 32767;
        match v.validate(&c, 1000) {
            Verdict::Accept { sanitized, flags } => {
                assert_ne!(flags & violation::MOVEMENT_BOUNDS, 0);
                let m = sanitized.thrust as i64 * sanitized.thrust as i64
                    + sanitized.turn as i64 * sanitized.turn as i64;
                assert!(m <= 32767i64 * 32767);
                // Direction preserved.
                assert_eq!(sanitized.thrust, sanitized.turn);
            }
            _ => panic!("expected sanitized accept"),
        }
    }

    #[test]
    fn test_unknown_action_bits_stripped() {
        let mut v = InputValidator::new(0);
        let mut c = cmd(0);
        c.actions = action::FIRE | 0x4000;
        match v.validate(&c, 1000) {
            Verdict::Accept { sanitized, flags } => {
                assert_ne!(flags & violation::ACTION_INVALID, 0);
                assert_eq!(sanitized.actions, action::FIRE);
            }
            _ => panic!("expected sanitized accept"),
        }
    }

    #[test]
    fn test_timestamp_anomalies_sanitized() {
        let mut v = InputValidator::new(0);
        let mut c = cmd(0);
        c.dt_ms = 0;
        match v.validate(&c, 1000) {
            Verdict::Accept { sanitized, flags } => {
                assert_ne!(flags & violation::TIMESTAMP_ANOMALY, 0);
                assert_eq!(sanitized.dt_ms, 1);
            }
            _ => panic!("expected accept"),
        }
        // Clock going backwards is held at the high-water mark.
        let mut c = cmd(1);
        c.client_time = 10;
        match v.validate(&c, 1100) {
            Verdict::Accept { sanitized, flags } => {
                assert_ne!(flags & violation::TIMESTAMP_ANOMALY, 0);
                assert_eq!(sanitized.client_time, 1000);
            }
            _ => panic!("expected accept"),
        }
    }

    #[test]
    fn test_suspicion_accumulates_and_decays() {
        let mut v = InputValidator::new(0);
        let mut c = cmd(0);
        c.actions = 0xFFFF;
        let _ = v.validate(&c, 1000);
        assert_eq!(v.suspicion, SCORE_ACTION);
        // Ten clean seconds decay it away.
        let _ = v.validate(&cmd(1), 11_000);
        assert_eq!(v.suspicion, 0);
    }

    #[test]
    fn test_ban_threshold() {
        let mut v = InputValidator::new(0);
        assert!(!v.should_ban());
        v.suspicion = BAN_THRESHOLD;
        assert!(v.should_ban());
    }

    #[test]
    fn test_violation_counters_indexed_by_bit() {
        let mut v = InputValidator::new(0);
        let mut c = cmd(0);
        c.actions = 0x8000;
        let _ = v.validate(&c, 1000);
        assert_eq!(
            v.violation_counts[violation::ACTION_INVALID.trailing_zeros() as usize],
            1
        );
    }
}
