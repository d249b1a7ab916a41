//! Reliability layer over the raw datagram socket: sequence numbers with
//! wraparound ordering, a 32-deep ack bitfield, timed resends for packets
//! that must arrive, and an RTT estimate fed by acks.
//!
//! Snapshots are fire-and-forget (a lost one is superseded by the next),
//! so only packets registered through [`Connection::track_reliable`] are
//! ever resent.

use log::{debug, warn};
use shared::protocol::AckPacket;
use shared::{ACK_WINDOW, HEARTBEAT_INTERVAL_MS, MAX_PENDING_RELIABLE, MAX_RESENDS, RESEND_TIMEOUT_MS};

/// Wraparound-aware sequence comparison over the u16 half-range.
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    (a > b && a - b <= 32768) || (a < b && b - a > 32768)
}

/// A packet awaiting acknowledgment.
struct PendingPacket {
    seq: u16,
    payload: Vec<u8>,
    first_sent_ms: u64,
    last_sent_ms: u64,
    resends: u8,
}

/// Per-peer reliability state.
pub struct Connection {
    /// Next sequence we will stamp on an outgoing packet.
    local_seq: u16,
    /// Newest sequence received from the peer.
    remote_seq: u16,
    /// Bit i set means `remote_seq - 1 - i` was received.
    ack_bitfield: u32,
    started: bool,
    pending: Vec<PendingPacket>,
    /// Smoothed round-trip estimate in ms.
    rtt_ms: f32,
    last_heartbeat_ms: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub resends: u64,
    /// Reliable packets abandoned after the resend budget ran out.
    pub lost: u64,
    /// Arrivals outside the ack window, dropped as too old.
    pub stale_drops: u64,
}

impl Connection {
    pub fn new(now_ms: u64) -> Self {
        Connection {
            local_seq: 0,
            remote_seq: 0,
            ack_bitfield: 0,
            started: false,
            pending: Vec::new(),
            rtt_ms: 0.0,
            last_heartbeat_ms: now_ms,
            packets_sent: 0,
            packets_received: 0,
            resends: 0,
            lost: 0,
            stale_drops: 0,
        }
    }

    /// Allocates the sequence number for the next outgoing packet.
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        self.packets_sent += 1;
        seq
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    /// Records an incoming sequence. Returns false for duplicates and for
    /// packets older than the ack window, which the caller must drop.
    pub fn receive_sequence(&mut self, seq: u16) -> bool {
        self.packets_received += 1;
        if !self.started {
            self.started = true;
            self.remote_seq = seq;
            self.ack_bitfield = 0;
            return true;
        }
        if seq == self.remote_seq {
            return false;
        }
        if sequence_greater_than(seq, self.remote_seq) {
            let advance = seq.wrapping_sub(self.remote_seq) as u32;
            // Shift the window forward, folding the old head into it. A
            // jump of exactly 32 leaves the old head on the last slot.
            self.ack_bitfield = if advance > 32 {
                0
            } else if advance == 32 {
                1 << 31
            } else {
                (self.ack_bitfield << advance) | (1 << (advance - 1))
            };
            self.remote_seq = seq;
            true
        } else {
            let behind = self.remote_seq.wrapping_sub(seq) as u32;
            if behind > ACK_WINDOW as u32 {
                self.stale_drops += 1;
                return false;
            }
            let bit = 1u32 << (behind - 1);
            if self.ack_bitfield & bit != 0 {
                return false;
            }
            self.ack_bitfield |= bit;
            true
        }
    }

    /// The ack this peer should be sent for what we have received.
    pub fn ack_fields(&self) -> (u16, u32) {
        (self.remote_seq, self.ack_bitfield)
    }

    /// Registers an outgoing packet for resend-until-acked delivery. When
    /// the table is full the oldest entry is abandoned to make room.
    pub fn track_reliable(&mut self, seq: u16, payload: Vec<u8>, now_ms: u64) {
        if self.pending.len() >= MAX_PENDING_RELIABLE {
            let dropped = self.pending.remove(0);
            warn!("reliable table full, abandoning seq {}", dropped.seq);
            self.lost += 1;
        }
        self.pending.push(PendingPacket {
            seq,
            payload,
            first_sent_ms: now_ms,
            last_sent_ms: now_ms,
            resends: 0,
        });
    }

    /// Applies a peer ack: clears pending entries it covers and feeds the
    /// RTT estimate from the newest one.
    pub fn handle_ack(&mut self, ack: &AckPacket, now_ms: u64) {
        let acked = |seq: u16| -> bool {
            if seq == ack.ack_sequence {
                return true;
            }
            if sequence_greater_than(ack.ack_sequence, seq) {
                let behind = ack.ack_sequence.wrapping_sub(seq) as u32;
                behind <= 32 && ack.ack_bitfield & (1 << (behind - 1)) != 0
            } else {
                false
            }
        };
        let mut newest_rtt: Option<f32> = None;
        self.pending.retain(|p| {
            if acked(p.seq) {
                if p.resends == 0 {
                    // Resent packets give ambiguous samples; skip them.
                    let sample = now_ms.saturating_sub(p.first_sent_ms) as f32;
                    newest_rtt = Some(newest_rtt.map_or(sample, |r: f32| r.min(sample)));
                }
                false
            } else {
                true
            }
        });
        if let Some(sample) = newest_rtt {
            self.rtt_ms = if self.rtt_ms == 0.0 {
                sample
            } else {
                self.rtt_ms * 0.9 + sample * 0.1
            };
        }
    }

    /// Collects payloads due for resend, abandoning packets that have
    /// exhausted their budget.
    pub fn due_resends(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut abandoned = 0u64;
        self.pending.retain_mut(|p| {
            if now_ms.saturating_sub(p.last_sent_ms) < RESEND_TIMEOUT_MS {
                return true;
            }
            if p.resends >= MAX_RESENDS {
                debug!("abandoning reliable seq {} after {} resends", p.seq, p.resends);
                abandoned += 1;
                return false;
            }
            p.resends += 1;
            p.last_sent_ms = now_ms;
            out.push(p.payload.clone());
            true
        });
        self.lost += abandoned;
        self.resends += out.len() as u64;
        out
    }

    /// True when the link has been quiet long enough to owe a heartbeat.
    pub fn heartbeat_due(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_heartbeat_ms) >= HEARTBEAT_INTERVAL_MS {
            self.last_heartbeat_ms = now_ms;
            true
        } else {
            false
        }
    }

    /// Any outbound traffic counts as a keep-alive.
    pub fn note_sent(&mut self, now_ms: u64) {
        self.last_heartbeat_ms = now_ms;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ordering_with_wraparound() {
        assert!(sequence_greater_than(1, 0));
        assert!(!sequence_greater_than(0, 1));
        assert!(sequence_greater_than(0, 65535));
        assert!(!sequence_greater_than(65535, 0));
        assert!(sequence_greater_than(32768, 0));
        assert!(!sequence_greater_than(32769, 0));
    }

    #[test]
    fn test_receive_window_tracks_out_of_order() {
        let mut conn = Connection::new(0);
        assert!(conn.receive_sequence(5));
        assert!(conn.receive_sequence(7));
        // 6 arrives late but inside the window.
        assert!(conn.receive_sequence(6));
        let (head, bits) = conn.ack_fields();
        assert_eq!(head, 7);
        // Bits for 6 and 5.
        assert_eq!(bits & 0b11, 0b11);
    }

    #[test]
    fn test_duplicate_sequences_rejected() {
        let mut conn = Connection::new(0);
        assert!(conn.receive_sequence(10));
        assert!(!conn.receive_sequence(10));
        assert!(conn.receive_sequence(12));
        assert!(conn.receive_sequence(11));
        assert!(!conn.receive_sequence(11));
        assert!(!conn.receive_sequence(12));
    }

    #[test]
    fn test_too_old_sequence_dropped() {
        let mut conn = Connection::new(0);
        assert!(conn.receive_sequence(100));
        // 100 - 33 is past the 32-slot window.
        assert!(!conn.receive_sequence(67));
        assert_eq!(conn.stale_drops, 1);
        // 100 - 32 is the last slot still in it.
        assert!(conn.receive_sequence(68));
    }

    #[test]
    fn test_head_survives_exact_window_jump() {
        // A jump of exactly 32 keeps the old head on the last window
        // slot, so its resend is still recognized as a duplicate.
        let mut conn = Connection::new(0);
        assert!(conn.receive_sequence(5));
        assert!(conn.receive_sequence(37));
        let (_, bits) = conn.ack_fields();
        assert_ne!(bits & (1 << 31), 0, "bit for seq 5 missing");
        assert!(!conn.receive_sequence(5), "replayed seq 5 accepted");

        // One past the window the old head really is gone.
        let mut conn = Connection::new(0);
        assert!(conn.receive_sequence(5));
        assert!(conn.receive_sequence(38));
        assert_eq!(conn.ack_fields().1, 0);
    }

    #[test]
    fn test_window_survives_sequence_wrap() {
        let mut conn = Connection::new(0);
        assert!(conn.receive_sequence(65534));
        assert!(conn.receive_sequence(1));
        let (head, bits) = conn.ack_fields();
        assert_eq!(head, 1);
        // 65534 is 3 behind 1.
        assert_ne!(bits & (1 << 2), 0);
        assert!(conn.receive_sequence(0));
        assert!(conn.receive_sequence(65535));
        assert!(!conn.receive_sequence(65534));
    }

    #[test]
    fn test_ack_clears_pending() {
        let mut conn = Connection::new(0);
        let s1 = conn.next_sequence();
        let s2 = conn.next_sequence();
        conn.track_reliable(s1, vec![1], 0);
        conn.track_reliable(s2, vec![2], 0);
        assert_eq!(conn.pending_count(), 2);

        conn.handle_ack(
            &AckPacket {
                ack_sequence: s2,
                ack_bitfield: 1, // covers s1
                client_time: 0,
            },
            50,
        );
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.rtt_ms() > 0.0);
    }

    #[test]
    fn test_resend_after_timeout_then_abandon() {
        let mut conn = Connection::new(0);
        let seq = conn.next_sequence();
        conn.track_reliable(seq, vec![9, 9], 0);

        assert!(conn.due_resends(100).is_empty());
        let mut now = 0;
        for _ in 0..MAX_RESENDS {
            now += RESEND_TIMEOUT_MS;
            let due = conn.due_resends(now);
            assert_eq!(due.len(), 1);
            assert_eq!(due[0], vec![9, 9]);
        }
        // Budget spent: the next sweep abandons the packet.
        now += RESEND_TIMEOUT_MS;
        assert!(conn.due_resends(now).is_empty());
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.lost, 1);
        assert_eq!(conn.resends, MAX_RESENDS as u64);
    }

    #[test]
    fn test_pending_table_bounded() {
        let mut conn = Connection::new(0);
        for _ in 0..(MAX_PENDING_RELIABLE + 5) {
            let seq = conn.next_sequence();
            conn.track_reliable(seq, Vec::new(), 0);
        }
        assert_eq!(conn.pending_count(), MAX_PENDING_RELIABLE);
        assert_eq!(conn.lost, 5);
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut conn = Connection::new(0);
        let s1 = conn.next_sequence();
        conn.track_reliable(s1, Vec::new(), 0);
        conn.handle_ack(
            &AckPacket {
                ack_sequence: s1,
                ack_bitfield: 0,
                client_time: 0,
            },
            100,
        );
        assert_eq!(conn.rtt_ms(), 100.0);

        let s2 = conn.next_sequence();
        conn.track_reliable(s2, Vec::new(), 1000);
        conn.handle_ack(
            &AckPacket {
                ack_sequence: s2,
                ack_bitfield: 0,
                client_time: 0,
            },
            1200,
        );
        // 100 * 0.9 + 200 * 0.1
        assert!((conn.rtt_ms() - 110.0).abs() < 0.01);
    }

    #[test]
    fn test_heartbeat_cadence() {
        let mut conn = Connection::new(0);
        assert!(!conn.heartbeat_due(500));
        assert!(conn.heartbeat_due(1000));
        assert!(!conn.heartbeat_due(1500));
        conn.note_sent(1900);
        assert!(!conn.heartbeat_due(2000));
        assert!(conn.heartbeat_due(2900));
    }
}
