//! Bespoke little-endian wire format for the datagram protocol.
//!
//! # Packet framing
//! ```text
//! ┌──────┬─────────┬─────────────────────────────┬──────────┐
//! │ type │ version │  packet-specific fields     │ checksum │
//! │ (u8) │ (u8)    │  (fixed little-endian)      │ (u16)    │
//! └──────┴─────────┴─────────────────────────────┴──────────┘
//! ```
//! The checksum is the sum of every byte preceding it, mod 256, widened
//! to u16. Malformed, truncated, wrong-version or checksum-failed packets
//! are decode errors; the server drops them silently and counts them.
//!
//! The quantization formulas in this module are part of the wire contract
//! and must be reproduced bit-for-bit by any client or bridge.

use crate::fixed::{self, Fx};
use thiserror::Error;

/// Protocol version; both sides move together.
pub const PROTOCOL_VERSION: u8 = 1;

/// Conservative MTU for internet UDP.
pub const MAX_PACKET_SIZE: usize = 1200;

/// Packet type discriminants (first byte on the wire).
pub mod packet_type {
    pub const COMMAND: u8 = 0x01;
    pub const SNAPSHOT: u8 = 0x02;
    pub const ACK: u8 = 0x03;
    pub const HANDSHAKE: u8 = 0x04;
    pub const HANDSHAKE_REPLY: u8 = 0x05;
    pub const HEARTBEAT: u8 = 0x06;
}

/// Snapshot header flag bits.
pub mod snapshot_flags {
    /// Records are `EntityDelta` rather than full `EntitySnapshot`.
    pub const DELTA: u8 = 0x01;
}

/// Change-mask bits for `EntityDelta`.
pub mod delta_mask {
    pub const POS: u8 = 0x01;
    pub const VEL: u8 = 0x02;
    pub const ROT: u8 = 0x04;
    pub const HEALTH: u8 = 0x08;
    pub const STATE: u8 = 0x10;
}

/// Action bitfield bits carried by command packets. Anything outside
/// `ACTION_ALL` is an ACTION_INVALID violation on the server.
pub mod action {
    pub const FIRE: u16 = 0x0001;
    pub const INTERACT: u16 = 0x0002;
    pub const BOARD: u16 = 0x0004;
    pub const RAISE_SAIL: u16 = 0x0008;
    pub const LOWER_SAIL: u16 = 0x0010;
    pub const DROP_ANCHOR: u16 = 0x0020;

    pub const ALL: u16 = 0x003F;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("checksum mismatch: computed {computed}, packet carries {carried}")]
    BadChecksum { computed: u16, carried: u16 },
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("wrong packet type {got:#04x}, expected {want:#04x}")]
    WrongType { got: u8, want: u8 },
}

// ---------------------------------------------------------------------------
// Quantization (wire contract, exact)
// ---------------------------------------------------------------------------

const Q_BIAS: i32 = 32768;
const POS_SCALE: f32 = 512.0;
const VEL_SCALE: f32 = 256.0;
const ROT_STEPS: i64 = 1024;

/// Position to u16: `round(v * 512) + 32768`, clamped to the ±64-unit
/// window. Positions are encoded relative to the origin of the cell an
/// entity occupies (the `cell` field of its record), never absolutely;
/// an entity is always within one 64-unit cell of that origin, so the
/// window covers every encodable offset.
pub fn quantize_pos(v: f32) -> u16 {
    ((v * POS_SCALE).round() as i32 + Q_BIAS).clamp(0, u16::MAX as i32) as u16
}

pub fn unquantize_pos(q: u16) -> f32 {
    (q as i32 - Q_BIAS) as f32 / POS_SCALE
}

/// Velocity to u16, same scheme as position at ×256 scale.
pub fn quantize_vel(v: f32) -> u16 {
    ((v * VEL_SCALE).round() as i32 + Q_BIAS).clamp(0, u16::MAX as i32) as u16
}

pub fn unquantize_vel(q: u16) -> f32 {
    (q as i32 - Q_BIAS) as f32 / VEL_SCALE
}

/// Rotation to u16: angle normalized to [0, 2π), then `angle * 1024 / 2π`.
pub fn quantize_rot(angle: f32) -> u16 {
    let a = angle.rem_euclid(std::f32::consts::TAU);
    ((a * ROT_STEPS as f32 / std::f32::consts::TAU).round() as i64 % ROT_STEPS) as u16
}

pub fn unquantize_rot(q: u16) -> f32 {
    q as f32 * std::f32::consts::TAU / ROT_STEPS as f32
}

/// Rotation quantizer on the fixed-point angle directly. Produces the same
/// codes as `quantize_rot` on the converted angle; the server uses this so
/// the hot path stays integer-only.
pub fn quantize_rot_fx(angle: Fx) -> u16 {
    let a = fixed::angle_normalize(angle) as i64;
    let tau = fixed::TAU_FX as i64;
    (((a * ROT_STEPS + tau / 2) / tau) % ROT_STEPS) as u16
}

// ---------------------------------------------------------------------------
// Byte-level encode/decode helpers
// ---------------------------------------------------------------------------

/// Sum of bytes mod 256, widened to u16 for the wire field.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, &b| (acc + b as u16) & 0xFF)
}

fn need(buf: &[u8], at: usize, n: usize) -> Result<(), WireError> {
    if buf.len() < at + n {
        Err(WireError::Truncated {
            need: at + n,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn read_u8(buf: &[u8], at: &mut usize) -> Result<u8, WireError> {
    need(buf, *at, 1)?;
    let v = buf[*at];
    *at += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], at: &mut usize) -> Result<u16, WireError> {
    need(buf, *at, 2)?;
    let v = u16::from_le_bytes([buf[*at], buf[*at + 1]]);
    *at += 2;
    Ok(v)
}

fn read_i16(buf: &[u8], at: &mut usize) -> Result<i16, WireError> {
    Ok(read_u16(buf, at)? as i16)
}

fn read_u32(buf: &[u8], at: &mut usize) -> Result<u32, WireError> {
    need(buf, *at, 4)?;
    let v = u32::from_le_bytes([buf[*at], buf[*at + 1], buf[*at + 2], buf[*at + 3]]);
    *at += 4;
    Ok(v)
}

/// Validates the leading type/version bytes and the trailing checksum,
/// returning the offset just past the header.
fn check_envelope(buf: &[u8], want_type: u8) -> Result<usize, WireError> {
    let mut at = 0;
    let ty = read_u8(buf, &mut at)?;
    let known = [
        packet_type::COMMAND,
        packet_type::SNAPSHOT,
        packet_type::ACK,
        packet_type::HANDSHAKE,
        packet_type::HANDSHAKE_REPLY,
        packet_type::HEARTBEAT,
    ];
    if !known.contains(&ty) {
        return Err(WireError::UnknownType(ty));
    }
    if ty != want_type {
        return Err(WireError::WrongType {
            got: ty,
            want: want_type,
        });
    }
    let ver = read_u8(buf, &mut at)?;
    if ver != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(ver));
    }
    need(buf, 0, at + 2)?; // room for at least the checksum
    let body_end = buf.len() - 2;
    let carried = u16::from_le_bytes([buf[body_end], buf[body_end + 1]]);
    let computed = checksum(&buf[..body_end]);
    if carried != computed {
        return Err(WireError::BadChecksum { computed, carried });
    }
    Ok(at)
}

fn seal(mut buf: Vec<u8>) -> Vec<u8> {
    let ck = checksum(&buf);
    buf.extend_from_slice(&ck.to_le_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Client → server input command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket {
    pub seq: u16,
    /// Client-measured frame delta in ms.
    pub dt_ms: u16,
    /// Thrust input in Q0.15 (−1.0..1.0).
    pub thrust: i16,
    /// Turn input in Q0.15 (−1.0..1.0).
    pub turn: i16,
    pub actions: u16,
    pub client_time: u32,
}

impl CommandPacket {
    pub const WIRE_SIZE: usize = 18;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.push(packet_type::COMMAND);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.dt_ms.to_le_bytes());
        buf.extend_from_slice(&self.thrust.to_le_bytes());
        buf.extend_from_slice(&self.turn.to_le_bytes());
        buf.extend_from_slice(&self.actions.to_le_bytes());
        buf.extend_from_slice(&self.client_time.to_le_bytes());
        seal(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut at = check_envelope(buf, packet_type::COMMAND)?;
        Ok(CommandPacket {
            seq: read_u16(buf, &mut at)?,
            dt_ms: read_u16(buf, &mut at)?,
            thrust: read_i16(buf, &mut at)?,
            turn: read_i16(buf, &mut at)?,
            actions: read_u16(buf, &mut at)?,
            client_time: read_u32(buf, &mut at)?,
        })
    }
}

/// Server → client snapshot header; records follow in the same datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub server_time: u32,
    /// Baseline snapshot id the records delta against (or this packet's
    /// own id for a baseline).
    pub base_id: u16,
    pub snap_id: u16,
    /// Subscriber's AOI cell at build time, for client-side interest
    /// bookkeeping. Positions are relative to each record's own cell.
    pub aoi_cell: u16,
    pub entity_count: u8,
    pub flags: u8,
}

impl SnapshotHeader {
    pub const WIRE_SIZE: usize = 16;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(packet_type::SNAPSHOT);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.server_time.to_le_bytes());
        buf.extend_from_slice(&self.base_id.to_le_bytes());
        buf.extend_from_slice(&self.snap_id.to_le_bytes());
        buf.extend_from_slice(&self.aoi_cell.to_le_bytes());
        buf.push(self.entity_count);
        buf.push(self.flags);
    }

    fn read(buf: &[u8], at: &mut usize) -> Result<Self, WireError> {
        Ok(SnapshotHeader {
            server_time: read_u32(buf, at)?,
            base_id: read_u16(buf, at)?,
            snap_id: read_u16(buf, at)?,
            aoi_cell: read_u16(buf, at)?,
            entity_count: read_u8(buf, at)?,
            flags: read_u8(buf, at)?,
        })
    }
}

/// Full quantized state for one entity. `qpos` is relative to the
/// origin of `cell`, the grid cell the entity occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub entity_id: u16,
    pub cell: u16,
    pub qpos: (u16, u16),
    pub qvel: (u16, u16),
    pub qrot: u16,
    pub health: u8,
    pub state_flags: u8,
}

impl EntitySnapshot {
    pub const WIRE_SIZE: usize = 16;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.entity_id.to_le_bytes());
        buf.extend_from_slice(&self.cell.to_le_bytes());
        buf.extend_from_slice(&self.qpos.0.to_le_bytes());
        buf.extend_from_slice(&self.qpos.1.to_le_bytes());
        buf.extend_from_slice(&self.qvel.0.to_le_bytes());
        buf.extend_from_slice(&self.qvel.1.to_le_bytes());
        buf.extend_from_slice(&self.qrot.to_le_bytes());
        buf.push(self.health);
        buf.push(self.state_flags);
    }

    fn read(buf: &[u8], at: &mut usize) -> Result<Self, WireError> {
        Ok(EntitySnapshot {
            entity_id: read_u16(buf, at)?,
            cell: read_u16(buf, at)?,
            qpos: (read_u16(buf, at)?, read_u16(buf, at)?),
            qvel: (read_u16(buf, at)?, read_u16(buf, at)?),
            qrot: read_u16(buf, at)?,
            health: read_u8(buf, at)?,
            state_flags: read_u8(buf, at)?,
        })
    }
}

/// Changed-fields-only record; `mask` says which fields follow. A POS
/// update carries the entity's cell alongside the offset, since the
/// offset means nothing without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityDelta {
    pub entity_id: u16,
    pub mask: u8,
    pub cell: u16,
    pub qpos: (u16, u16),
    pub qvel: (u16, u16),
    pub qrot: u16,
    pub health: u8,
    pub state_flags: u8,
}

impl EntityDelta {
    pub fn wire_size(&self) -> usize {
        let mut n = 3;
        if self.mask & delta_mask::POS != 0 {
            n += 6;
        }
        if self.mask & delta_mask::VEL != 0 {
            n += 4;
        }
        if self.mask & delta_mask::ROT != 0 {
            n += 2;
        }
        if self.mask & delta_mask::HEALTH != 0 {
            n += 1;
        }
        if self.mask & delta_mask::STATE != 0 {
            n += 1;
        }
        n
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.entity_id.to_le_bytes());
        buf.push(self.mask);
        if self.mask & delta_mask::POS != 0 {
            buf.extend_from_slice(&self.cell.to_le_bytes());
            buf.extend_from_slice(&self.qpos.0.to_le_bytes());
            buf.extend_from_slice(&self.qpos.1.to_le_bytes());
        }
        if self.mask & delta_mask::VEL != 0 {
            buf.extend_from_slice(&self.qvel.0.to_le_bytes());
            buf.extend_from_slice(&self.qvel.1.to_le_bytes());
        }
        if self.mask & delta_mask::ROT != 0 {
            buf.extend_from_slice(&self.qrot.to_le_bytes());
        }
        if self.mask & delta_mask::HEALTH != 0 {
            buf.push(self.health);
        }
        if self.mask & delta_mask::STATE != 0 {
            buf.push(self.state_flags);
        }
    }

    fn read(buf: &[u8], at: &mut usize) -> Result<Self, WireError> {
        let entity_id = read_u16(buf, at)?;
        let mask = read_u8(buf, at)?;
        let mut d = EntityDelta {
            entity_id,
            mask,
            ..Default::default()
        };
        if mask & delta_mask::POS != 0 {
            d.cell = read_u16(buf, at)?;
            d.qpos = (read_u16(buf, at)?, read_u16(buf, at)?);
        }
        if mask & delta_mask::VEL != 0 {
            d.qvel = (read_u16(buf, at)?, read_u16(buf, at)?);
        }
        if mask & delta_mask::ROT != 0 {
            d.qrot = read_u16(buf, at)?;
        }
        if mask & delta_mask::HEALTH != 0 {
            d.health = read_u8(buf, at)?;
        }
        if mask & delta_mask::STATE != 0 {
            d.state_flags = read_u8(buf, at)?;
        }
        Ok(d)
    }
}

/// Decoded snapshot payload, baseline or delta per the header flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRecords {
    Baseline(Vec<EntitySnapshot>),
    Delta(Vec<EntityDelta>),
}

pub fn encode_baseline(header: &SnapshotHeader, records: &[EntitySnapshot]) -> Vec<u8> {
    debug_assert_eq!(header.flags & snapshot_flags::DELTA, 0);
    debug_assert_eq!(header.entity_count as usize, records.len());
    let mut buf =
        Vec::with_capacity(SnapshotHeader::WIRE_SIZE + records.len() * EntitySnapshot::WIRE_SIZE);
    header.write(&mut buf);
    for rec in records {
        rec.write(&mut buf);
    }
    seal(buf)
}

pub fn encode_delta(header: &SnapshotHeader, records: &[EntityDelta]) -> Vec<u8> {
    debug_assert_ne!(header.flags & snapshot_flags::DELTA, 0);
    debug_assert_eq!(header.entity_count as usize, records.len());
    let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
    header.write(&mut buf);
    for rec in records {
        rec.write(&mut buf);
    }
    seal(buf)
}

pub fn decode_snapshot(buf: &[u8]) -> Result<(SnapshotHeader, SnapshotRecords), WireError> {
    let mut at = check_envelope(buf, packet_type::SNAPSHOT)?;
    let header = SnapshotHeader::read(buf, &mut at)?;
    let n = header.entity_count as usize;
    let records = if header.flags & snapshot_flags::DELTA != 0 {
        let mut recs = Vec::with_capacity(n);
        for _ in 0..n {
            recs.push(EntityDelta::read(buf, &mut at)?);
        }
        SnapshotRecords::Delta(recs)
    } else {
        let mut recs = Vec::with_capacity(n);
        for _ in 0..n {
            recs.push(EntitySnapshot::read(buf, &mut at)?);
        }
        SnapshotRecords::Baseline(recs)
    };
    Ok((header, records))
}

/// Acknowledgment of received sequences: `ack_sequence` is the newest
/// sequence seen, bit i of `ack_bitfield` covers `ack_sequence - 1 - i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket {
    pub ack_sequence: u16,
    pub ack_bitfield: u32,
    pub client_time: u32,
}

impl AckPacket {
    pub const WIRE_SIZE: usize = 14;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.push(packet_type::ACK);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.ack_sequence.to_le_bytes());
        buf.extend_from_slice(&self.ack_bitfield.to_le_bytes());
        buf.extend_from_slice(&self.client_time.to_le_bytes());
        seal(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut at = check_envelope(buf, packet_type::ACK)?;
        Ok(AckPacket {
            ack_sequence: read_u16(buf, &mut at)?,
            ack_bitfield: read_u32(buf, &mut at)?,
            client_time: read_u32(buf, &mut at)?,
        })
    }
}

/// First packet a client sends: a self-chosen id and a display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePacket {
    pub client_id: u32,
    pub name: [u8; crate::NAME_LEN],
}

impl HandshakePacket {
    pub const WIRE_SIZE: usize = 24;

    /// Builds a handshake from a UTF-8 name, truncated/zero-padded to fit.
    pub fn new(client_id: u32, name: &str) -> Self {
        let mut bytes = [0u8; crate::NAME_LEN];
        let src = name.as_bytes();
        let n = src.len().min(crate::NAME_LEN);
        bytes[..n].copy_from_slice(&src[..n]);
        HandshakePacket {
            client_id,
            name: bytes,
        }
    }

    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(crate::NAME_LEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.push(packet_type::HANDSHAKE);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.name);
        seal(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut at = check_envelope(buf, packet_type::HANDSHAKE)?;
        let client_id = read_u32(buf, &mut at)?;
        need(buf, at, crate::NAME_LEN)?;
        let mut name = [0u8; crate::NAME_LEN];
        name.copy_from_slice(&buf[at..at + crate::NAME_LEN]);
        Ok(HandshakePacket { client_id, name })
    }
}

/// Server's reply to a handshake: the assigned player id and server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub player_id: u16,
    pub server_time: u32,
}

impl HandshakeReply {
    pub const WIRE_SIZE: usize = 10;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.push(packet_type::HANDSHAKE_REPLY);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.player_id.to_le_bytes());
        buf.extend_from_slice(&self.server_time.to_le_bytes());
        seal(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut at = check_envelope(buf, packet_type::HANDSHAKE_REPLY)?;
        Ok(HandshakeReply {
            player_id: read_u16(buf, &mut at)?,
            server_time: read_u32(buf, &mut at)?,
        })
    }
}

/// Keep-alive carrying a reliability sequence so idle links still ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub seq: u16,
    pub time: u32,
}

impl HeartbeatPacket {
    pub const WIRE_SIZE: usize = 10;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_SIZE);
        buf.push(packet_type::HEARTBEAT);
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());
        seal(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut at = check_envelope(buf, packet_type::HEARTBEAT)?;
        Ok(HeartbeatPacket {
            seq: read_u16(buf, &mut at)?,
            time: read_u32(buf, &mut at)?,
        })
    }
}

/// Peeks the type byte without validating the rest.
pub fn peek_type(buf: &[u8]) -> Option<u8> {
    buf.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_quantize_pos_exact_formula() {
        // Wire contract values, computed by hand.
        assert_eq!(quantize_pos(0.0), 32768);
        assert_eq!(quantize_pos(1.0), 33280);
        assert_eq!(quantize_pos(-1.0), 32256);
        assert_eq!(quantize_pos(63.998), 65535);
        assert_eq!(quantize_pos(-64.0), 0);
    }

    #[test]
    fn test_quantize_pos_roundtrip_precision() {
        for i in 0..1000 {
            let v = -64.0 + i as f32 * 0.128;
            let back = unquantize_pos(quantize_pos(v));
            assert!((back - v).abs() <= 1.0 / 512.0 + f32::EPSILON, "v={}", v);
        }
    }

    #[test]
    fn test_quantize_vel_roundtrip_precision() {
        for i in 0..500 {
            let v = -100.0 + i as f32 * 0.4;
            let back = unquantize_vel(quantize_vel(v));
            assert!((back - v).abs() <= 1.0 / 256.0 + f32::EPSILON, "v={}", v);
        }
    }

    #[test]
    fn test_quantize_rot_roundtrip_precision() {
        let half_step = std::f32::consts::PI / 1024.0;
        for i in 0..256 {
            let a = i as f32 * std::f32::consts::TAU / 256.0;
            let back = unquantize_rot(quantize_rot(a));
            let mut diff = (back - a).abs();
            if diff > std::f32::consts::PI {
                diff = std::f32::consts::TAU - diff;
            }
            assert!(diff <= half_step + 1e-4, "a={} back={}", a, back);
        }
    }

    #[test]
    fn test_quantize_rot_fx_matches_float_path() {
        for i in 0..128 {
            let a = i as f32 * std::f32::consts::TAU / 128.0;
            let qf = quantize_rot(a);
            let qx = quantize_rot_fx(crate::fixed::from_f32(a));
            let diff = (qf as i32 - qx as i32).rem_euclid(1024).min(
                (qx as i32 - qf as i32).rem_euclid(1024),
            );
            assert!(diff <= 1, "a={} float={} fixed={}", a, qf, qx);
        }
    }

    #[test]
    fn test_checksum_is_mod_256() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
        assert_eq!(checksum(&[255, 1]), 0);
        assert_eq!(checksum(&[200, 200]), 144);
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = CommandPacket {
            seq: 4242,
            dt_ms: 33,
            thrust: 16384,
            turn: -8192,
            actions: action::FIRE | action::RAISE_SAIL,
            client_time: 123_456_789,
        };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), CommandPacket::WIRE_SIZE);
        assert_eq!(CommandPacket::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_command_rejects_corruption() {
        let mut bytes = CommandPacket {
            seq: 1,
            dt_ms: 16,
            thrust: 0,
            turn: 0,
            actions: 0,
            client_time: 99,
        }
        .encode();
        bytes[4] ^= 0xFF;
        assert!(matches!(
            CommandPacket::decode(&bytes),
            Err(WireError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_command_rejects_truncation_and_version() {
        let bytes = CommandPacket {
            seq: 1,
            dt_ms: 16,
            thrust: 0,
            turn: 0,
            actions: 0,
            client_time: 99,
        }
        .encode();
        assert!(matches!(
            CommandPacket::decode(&bytes[..3]),
            Err(WireError::Truncated { .. })
        ));

        let mut wrong_ver = bytes.clone();
        wrong_ver[1] = 9;
        // Reseal so only the version is wrong.
        let end = wrong_ver.len() - 2;
        let ck = checksum(&wrong_ver[..end]);
        wrong_ver[end..].copy_from_slice(&ck.to_le_bytes());
        assert_eq!(CommandPacket::decode(&wrong_ver), Err(WireError::BadVersion(9)));
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let buf = [0xEEu8, PROTOCOL_VERSION, 0, 0];
        assert_eq!(
            CommandPacket::decode(&buf),
            Err(WireError::UnknownType(0xEE))
        );
    }

    #[test]
    fn test_baseline_snapshot_roundtrip() {
        let header = SnapshotHeader {
            server_time: 1000,
            base_id: 7,
            snap_id: 7,
            aoi_cell: 300,
            entity_count: 2,
            flags: 0,
        };
        let records = vec![
            EntitySnapshot {
                entity_id: 0x1001,
                cell: 300,
                qpos: (quantize_pos(1.5), quantize_pos(-2.0)),
                qvel: (quantize_vel(0.25), quantize_vel(0.0)),
                qrot: quantize_rot(1.0),
                health: 200,
                state_flags: 0b0000_0101,
            },
            EntitySnapshot {
                entity_id: 0x2003,
                cell: 301,
                qpos: (32768, 32768),
                qvel: (32768, 32768),
                qrot: 0,
                health: 255,
                state_flags: 0,
            },
        ];
        let bytes = encode_baseline(&header, &records);
        let (h, recs) = decode_snapshot(&bytes).unwrap();
        assert_eq!(h, header);
        assert_eq!(recs, SnapshotRecords::Baseline(records));
    }

    #[test]
    fn test_delta_snapshot_roundtrip_partial_fields() {
        let header = SnapshotHeader {
            server_time: 2000,
            base_id: 7,
            snap_id: 9,
            aoi_cell: 300,
            entity_count: 2,
            flags: snapshot_flags::DELTA,
        };
        let records = vec![
            EntityDelta {
                entity_id: 0x1001,
                mask: delta_mask::POS | delta_mask::ROT,
                cell: 312,
                qpos: (33280, 32256),
                qrot: 512,
                ..Default::default()
            },
            EntityDelta {
                entity_id: 0x2003,
                mask: delta_mask::HEALTH,
                health: 90,
                ..Default::default()
            },
        ];
        let bytes = encode_delta(&header, &records);
        // 3 + 6 + 2 for the first record, 3 + 1 for the second.
        assert_eq!(
            bytes.len(),
            SnapshotHeader::WIRE_SIZE + 11 + 4
        );
        let (h, recs) = decode_snapshot(&bytes).unwrap();
        assert_eq!(h, header);
        assert_eq!(recs, SnapshotRecords::Delta(records));
    }

    #[test]
    fn test_ack_roundtrip() {
        let ack = AckPacket {
            ack_sequence: 65530,
            ack_bitfield: 0xF0F0_00FF,
            client_time: 42,
        };
        let bytes = ack.encode();
        assert_eq!(bytes.len(), AckPacket::WIRE_SIZE);
        assert_eq!(AckPacket::decode(&bytes).unwrap(), ack);
    }

    #[test]
    fn test_handshake_roundtrip_and_name_padding() {
        let hs = HandshakePacket::new(77, "blackbeard");
        let bytes = hs.encode();
        assert_eq!(bytes.len(), HandshakePacket::WIRE_SIZE);
        let back = HandshakePacket::decode(&bytes).unwrap();
        assert_eq!(back.client_id, 77);
        assert_eq!(back.name_str(), "blackbeard");

        let long = HandshakePacket::new(1, "a-name-that-is-way-too-long");
        assert_eq!(long.name_str().len(), crate::NAME_LEN);
    }

    #[test]
    fn test_handshake_reply_and_heartbeat_roundtrip() {
        let reply = HandshakeReply {
            player_id: 0x1005,
            server_time: 987_654,
        };
        assert_eq!(HandshakeReply::decode(&reply.encode()).unwrap(), reply);

        let hb = HeartbeatPacket { seq: 9, time: 1234 };
        assert_eq!(HeartbeatPacket::decode(&hb.encode()).unwrap(), hb);
    }

    #[test]
    fn test_unquantize_matches_reference_values() {
        assert_approx_eq!(unquantize_pos(33280), 1.0, 1e-6);
        assert_approx_eq!(unquantize_vel(33024), 1.0, 1e-6);
        assert_approx_eq!(unquantize_rot(256), std::f32::consts::FRAC_PI_2, 1e-4);
    }
}
