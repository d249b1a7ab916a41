//! Server network layer: UDP datagram plumbing and the tick loop that
//! drives the whole per-tick pipeline — receive and ack, validate and
//! apply commands, step the simulation, refresh AOI subscriptions,
//! capture the rewind frame, build and send per-player snapshots, then
//! run reliability maintenance.

use crate::aoi::{self, AoiGrid};
use crate::clients::{Client, ClientManager};
use crate::entity::{split_id, EntityKind};
use crate::reliability::sequence_greater_than;
use crate::rewind::{HitVerdict, RewindBuffer};
use crate::sim::{InputCommand, Sim};
use crate::snapshot::{self, SnapshotOut};
use crate::stats::{ServerStats, ServerStatus};
use crate::validator::Verdict;
use log::{debug, error, info, warn};
use shared::fixed::{fx, heading, Fx, Vec2, TAU_FX};
use shared::protocol::{
    self, action, packet_type, AckPacket, CommandPacket, HandshakePacket, HandshakeReply,
    HeartbeatPacket,
};
use shared::{now_millis, TICK_MS, WORLD_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;

/// On-foot shot reach for rewind-validated fire.
const MUSKET_RANGE: Fx = fx(48);
/// A player must be this close to a hull to board it.
const BOARD_RANGE: Fx = fx(16);

/// Messages sent from network tasks to the main loop.
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { data: Vec<u8>, addr: SocketAddr },
    ClientTimeout { client_id: u32 },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the tick loop to the sender task.
#[derive(Debug)]
pub enum GameMessage {
    SendBytes { data: Vec<u8>, addr: SocketAddr },
}

/// Main server coordinating networking and the authoritative simulation.
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    sim: Sim,
    grid: AoiGrid,
    rewind: RewindBuffer,
    stats: ServerStats,
    tick_duration: Duration,
    spawn_counter: u32,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: Option<mpsc::UnboundedReceiver<GameMessage>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        max_clients: usize,
        seed: u64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            sim: Sim::new(seed),
            grid: AoiGrid::new(),
            rewind: RewindBuffer::new(),
            stats: ServerStats::new(now_millis()),
            tick_duration: Duration::from_millis(TICK_MS),
            spawn_counter: 0,
            server_tx,
            server_rx,
            game_tx,
            game_rx: Some(game_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Seeds the world with unmanned ships spread over the map.
    pub fn populate(&mut self, ships: usize) {
        let center = Vec2::from_int(WORLD_SIZE / 2, WORLD_SIZE / 2);
        for i in 0..ships {
            let angle = (i as i64 * TAU_FX as i64 / ships.max(1) as i64) as Fx;
            let radius = fx(200 + (i as i32 % 5) * 120);
            let pos = center.add(heading(angle).scale(radius));
            if let Err(e) = self.sim.spawn_ship(pos, angle) {
                warn!("World population stopped early: {}", e);
                break;
            }
        }
        info!("World populated with {} ships", self.sim.counts().0);
    }

    /// Spawns the task that listens for incoming datagrams.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if server_tx
                            .send(ServerMessage::DatagramReceived { data, addr })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outbound queue.
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = self.game_rx.take().expect("sender task spawned twice");

        tokio::spawn(async move {
            while let Some(GameMessage::SendBytes { data, addr }) = game_rx.recv().await {
                if let Err(e) = socket.send_to(&data, addr).await {
                    error!("Failed to send to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns the task that sweeps for silent clients once a second.
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let timed_out = {
                    let clients_guard = clients.read().await;
                    clients_guard.timed_out(now_millis())
                };
                for client_id in timed_out {
                    if server_tx
                        .send(ServerMessage::ClientTimeout { client_id })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
    }

    fn send_bytes(&self, data: Vec<u8>, addr: SocketAddr) {
        if self.game_tx.send(GameMessage::SendBytes { data, addr }).is_err() {
            error!("Sender task gone, dropping outbound packet");
        }
    }

    /// Routes one inbound datagram. Malformed datagrams are dropped
    /// silently and counted; the sender sees no response.
    async fn handle_datagram(&mut self, data: Vec<u8>, addr: SocketAddr) {
        let now = now_millis();
        match protocol::peek_type(&data) {
            Some(packet_type::HANDSHAKE) => match HandshakePacket::decode(&data) {
                Ok(hs) => self.handle_handshake(hs, addr, now).await,
                Err(e) => {
                    debug!("Bad handshake from {}: {}", addr, e);
                    self.stats.dropped.malformed += 1;
                }
            },
            Some(packet_type::COMMAND) => match CommandPacket::decode(&data) {
                Ok(cmd) => self.handle_command(cmd, addr, now).await,
                Err(e) => {
                    debug!("Bad command from {}: {}", addr, e);
                    self.stats.dropped.malformed += 1;
                }
            },
            Some(packet_type::ACK) => match AckPacket::decode(&data) {
                Ok(ack) => self.handle_ack(ack, addr, now).await,
                Err(e) => {
                    debug!("Bad ack from {}: {}", addr, e);
                    self.stats.dropped.malformed += 1;
                }
            },
            Some(packet_type::HEARTBEAT) => match HeartbeatPacket::decode(&data) {
                Ok(hb) => self.handle_heartbeat(hb, addr, now).await,
                Err(e) => {
                    debug!("Bad heartbeat from {}: {}", addr, e);
                    self.stats.dropped.malformed += 1;
                }
            },
            _ => {
                debug!("Unknown datagram type from {}", addr);
                self.stats.dropped.malformed += 1;
            }
        }
    }

    async fn handle_handshake(&mut self, hs: HandshakePacket, addr: SocketAddr, now: u64) {
        let mut clients = self.clients.write().await;

        // A retried handshake from a known address just gets the reply
        // again; the original spawn stands.
        if let Some(client) = clients.find_by_addr(&addr) {
            client.last_seen_ms = now;
            let reply = HandshakeReply {
                player_id: client.player_entity,
                server_time: now as u32,
            };
            self.send_bytes(reply.encode(), addr);
            return;
        }
        if clients.is_full() {
            warn!("Server full, ignoring handshake from {}", addr);
            return;
        }

        let spawn = spawn_point(self.spawn_counter);
        self.spawn_counter = self.spawn_counter.wrapping_add(1);
        let player_entity = match self.sim.spawn_player(spawn) {
            Ok(id) => id,
            Err(e) => {
                warn!("Cannot spawn player for {}: {}", addr, e);
                return;
            }
        };
        let name = hs.name_str().to_string();
        if clients
            .add(hs.client_id, addr, name, player_entity, now)
            .is_none()
        {
            // Id collision from another address; undo the spawn.
            self.sim.destroy_entity(player_entity);
            return;
        }
        self.grid.insert_entity(player_entity, spawn);

        let reply = HandshakeReply {
            player_id: player_entity,
            server_time: now as u32,
        };
        self.send_bytes(reply.encode(), addr);
    }

    async fn handle_command(&mut self, cmd: CommandPacket, addr: SocketAddr, now: u64) {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.find_by_addr(&addr) else {
            debug!("Command from unknown address {}", addr);
            return;
        };
        client.last_seen_ms = now;

        // Reliability window first: resends and replays never reach the
        // validator.
        if !client.conn.receive_sequence(cmd.seq) {
            self.stats.dropped.stale_sequences += 1;
            return;
        }
        match client.validator.validate(&cmd, now) {
            Verdict::Accept { sanitized, flags } => {
                if flags != 0 {
                    debug!(
                        "Command {} from client {} sanitized (flags {:#04x})",
                        sanitized.seq, client.id, flags
                    );
                }
                client.pending_inputs.push(command_to_input(&sanitized));
            }
            Verdict::Reject { flags } => {
                debug!(
                    "Command {} from client {} rejected (flags {:#04x})",
                    cmd.seq, client.id, flags
                );
                self.stats.dropped.rejected_inputs += 1;
            }
        }
    }

    async fn handle_ack(&mut self, ack: AckPacket, addr: SocketAddr, now: u64) {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.find_by_addr(&addr) else {
            return;
        };
        client.last_seen_ms = now;
        client.conn.handle_ack(&ack, now);
        // Every sequence the ack covers may be a pending baseline.
        client.snapshot.on_ack(ack.ack_sequence);
        for bit in 0..32u16 {
            if ack.ack_bitfield & (1 << bit) != 0 {
                client.snapshot.on_ack(ack.ack_sequence.wrapping_sub(bit + 1));
            }
        }
        client.update_lag();
    }

    async fn handle_heartbeat(&mut self, hb: HeartbeatPacket, addr: SocketAddr, now: u64) {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.find_by_addr(&addr) else {
            return;
        };
        client.last_seen_ms = now;
        if !client.conn.receive_sequence(hb.seq) {
            self.stats.dropped.stale_sequences += 1;
        }
    }

    async fn remove_client(&mut self, client_id: u32) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.remove(client_id) {
            self.grid.remove_entity(client.player_entity);
            self.sim.destroy_entity(client.player_entity);
        }
    }

    /// One full tick of the per-tick pipeline.
    async fn tick(&mut self) {
        let now = now_millis();
        let mut clients = self.clients.write().await;

        // Apply this tick's accepted commands in sequence order.
        let mut fire_claims: Vec<(u32, u16, Vec2, Vec2)> = Vec::new();
        for client in clients.iter_mut() {
            client
                .pending_inputs
                .sort_by(|a, b| match sequence_greater_than(a.seq, b.seq) {
                    true => std::cmp::Ordering::Greater,
                    false if a.seq == b.seq => std::cmp::Ordering::Equal,
                    false => std::cmp::Ordering::Less,
                });
            for input in client.pending_inputs.drain(..) {
                let player = client.player_entity;
                if let Err(e) = self.sim.apply_input(player, &input) {
                    debug!("Input for {:#06x} not applied: {}", player, e);
                    continue;
                }
                if input.actions & action::BOARD != 0 {
                    toggle_boarding(&mut self.sim, player);
                }
                if input.actions & action::FIRE != 0 {
                    let on_foot = match split_id(player) {
                        Some((EntityKind::Player, slot)) => self
                            .sim
                            .player(slot)
                            .map_or(false, |p| p.aboard.is_none()),
                        _ => false,
                    };
                    if on_foot && input.movement.length_sq() > 0 {
                        if let Some(origin) = self.sim.player_position(player) {
                            fire_claims.push((client.id, player, origin, input.movement));
                        }
                    }
                }
            }
        }

        // On-foot shots are instant and judged against history at the
        // shooter's delay, not against live state.
        for (client_id, _player, origin, dir) in fire_claims {
            match self
                .rewind
                .validate_hit(client_id, self.sim.tick, origin, dir, MUSKET_RANGE)
            {
                HitVerdict::Confirmed { target, damage, .. } => {
                    self.sim.apply_damage(target, damage);
                }
                HitVerdict::Miss => {}
                HitVerdict::OutOfWindow => {
                    self.stats.dropped.unvalidatable_hits += 1;
                }
            }
        }

        self.sim.step();

        // AOI grid follows the post-step positions.
        let positions: HashMap<u16, Vec2> = self.sim.entity_positions().into_iter().collect();
        self.grid.retain_entities(&positions);
        for (&id, &pos) in &positions {
            self.grid.update_entity(id, pos);
        }

        // Rewind frame for this tick, with each client's current delay.
        let delays: Vec<(u32, u64)> = clients.iter().map(|c| (c.id, c.lag_ms)).collect();
        self.rewind.store(&self.sim, now, delays);

        // Per-client: subscription refresh, validator tier, snapshot.
        for client in clients.iter_mut() {
            let player = client.player_entity;
            let Some(player_pos) = self.sim.player_position(player) else {
                continue;
            };
            aoi::update_subscription(
                &mut client.subscription,
                &self.grid,
                &positions,
                player_pos,
                now,
            );
            let (nearby, combat, moving) = situation(&self.sim, client, player);
            client.validator.update_tier(nearby, combat, moving);

            let snap_seq = client.conn.next_sequence();
            if let Some(SnapshotOut {
                bytes,
                snap_id,
                baseline,
            }) = snapshot::build_snapshot(
                &self.sim,
                &mut client.subscription,
                &mut client.snapshot,
                snap_seq,
                now,
                now as u32,
            ) {
                if baseline {
                    client.conn.track_reliable(snap_id, bytes.clone(), now);
                }
                client.conn.note_sent(now);
                if self
                    .game_tx
                    .send(GameMessage::SendBytes {
                        data: bytes,
                        addr: client.addr,
                    })
                    .is_err()
                {
                    error!("Sender task gone, dropping snapshot");
                }
            }

            // Reliability maintenance: resends, then a heartbeat if the
            // link has been quiet.
            for payload in client.conn.due_resends(now) {
                let _ = self.game_tx.send(GameMessage::SendBytes {
                    data: payload,
                    addr: client.addr,
                });
            }
            if client.conn.heartbeat_due(now) {
                let hb = HeartbeatPacket {
                    seq: client.conn.next_sequence(),
                    time: now as u32,
                };
                let _ = self.game_tx.send(GameMessage::SendBytes {
                    data: hb.encode(),
                    addr: client.addr,
                });
            }
        }

        // Ban sweep: the validator only scores, disconnecting is ours.
        let to_ban = clients.to_ban();
        for client_id in to_ban {
            warn!("Banning client {} for accumulated violations", client_id);
            clients.bans += 1;
            if let Some(client) = clients.remove(client_id) {
                self.grid.remove_entity(client.player_entity);
                self.sim.destroy_entity(client.player_entity);
            }
        }
    }

    /// Read-only status for the admin surface.
    pub async fn status(&self) -> ServerStatus {
        let clients = self.clients.read().await;
        let (bytes, snaps) = clients
            .iter()
            .fold((0, 0), |(b, s), c| {
                (b + c.snapshot.bytes_sent, s + c.snapshot.snapshots_sent)
            });
        self.stats.status(
            now_millis(),
            self.sim.tick,
            self.sim.counts(),
            clients.len(),
            bytes,
            snaps,
        )
    }

    /// Main loop: network events and the fixed-rate tick, one writer.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = tokio::time::interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started, {} ms tick", TICK_MS);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { data, addr }) => {
                            self.handle_datagram(data, addr).await;
                        }
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            info!("Client {} timed out", client_id);
                            self.remove_client(client_id).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                }

                _ = tick_interval.tick() => {
                    let started = Instant::now();
                    self.tick().await;
                    let elapsed = started.elapsed();
                    self.stats.record_tick(elapsed.as_secs_f64() * 1000.0);
                    if elapsed > self.tick_duration {
                        self.stats.tick_overruns += 1;
                    }

                    if self.sim.tick % 150 == 0 {
                        let status = self.status().await;
                        debug!(
                            "Tick {}: {} clients, {} ships, {:.2} ms mean tick, {} overruns",
                            status.tick, status.clients, status.ships,
                            status.mean_tick_ms, status.tick_overruns
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Deterministic spawn spread around the map center.
fn spawn_point(i: u32) -> Vec2 {
    let center = Vec2::from_int(WORLD_SIZE / 2, WORLD_SIZE / 2);
    let angle = ((i as i64 * 7 % 24) * TAU_FX as i64 / 24) as Fx;
    let radius = fx(30 + (i as i32 % 4) * 10);
    center.add(heading(angle).scale(radius))
}

/// Converts a validated wire command into a simulation input. Q0.15
/// stick axes widen to Q16.16 by a single left shift.
fn command_to_input(cmd: &CommandPacket) -> InputCommand {
    InputCommand {
        seq: cmd.seq,
        movement: Vec2::new((cmd.thrust as Fx) << 1, (cmd.turn as Fx) << 1),
        actions: cmd.actions,
        client_time: cmd.client_time,
        dt_ms: cmd.dt_ms,
    }
}

/// Boards the nearest ship in reach, or steps off the current one.
fn toggle_boarding(sim: &mut Sim, player: u16) {
    let Some((EntityKind::Player, slot)) = split_id(player) else {
        return;
    };
    let Some(p) = sim.player(slot) else {
        return;
    };
    if p.aboard.is_some() {
        let _ = sim.board(player, None);
        return;
    }
    let pos = p.position;
    let nearest = sim
        .ships()
        .filter(|(_, s)| !s.sinking)
        .map(|(id, s)| (id, s.position.sub(pos).length_sq()))
        .min_by_key(|&(_, d)| d);
    if let Some((ship, dist_sq)) = nearest {
        if dist_sq <= (BOARD_RANGE as i64) * (BOARD_RANGE as i64) {
            let _ = sim.board(player, Some(ship));
        }
    }
}

/// Derives validator-tier inputs from what is around this client.
fn situation(sim: &Sim, client: &Client, player: u16) -> (bool, bool, bool) {
    let nearby = client
        .subscription
        .tracked
        .iter()
        .any(|t| t.id != player && matches!(split_id(t.id), Some((EntityKind::Player, _))));
    let (aboard, moving_on_foot) = match split_id(player) {
        Some((EntityKind::Player, slot)) => sim
            .player(slot)
            .map_or((None, false), |p| (p.aboard, p.velocity.length_sq() > 0)),
        _ => (None, false),
    };
    let (combat, underway) = match aboard.and_then(split_id) {
        Some((EntityKind::Ship, slot)) => sim
            .ship(slot)
            .map_or((false, false), |s| (s.in_combat, s.throttle != 0)),
        _ => (false, false),
    };
    (nearby, combat, moving_on_foot || underway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::fixed::ONE;

    #[test]
    fn test_command_to_input_widens_q015() {
        let cmd = CommandPacket {
            seq: 3,
            dt_ms: 33,
            thrust: 32767,
            turn: -32768,
            actions: action::FIRE,
            client_time: 99,
        };
        let input = command_to_input(&cmd);
        assert_eq!(input.movement.x, 65534); // one step shy of ONE
        assert_eq!(input.movement.y, -ONE);
        assert_eq!(input.seq, 3);
        assert_eq!(input.actions, action::FIRE);
    }

    #[test]
    fn test_spawn_points_stay_near_center() {
        let center = Vec2::from_int(WORLD_SIZE / 2, WORLD_SIZE / 2);
        for i in 0..48u32 {
            let p = spawn_point(i);
            assert!(p.x > 0 && p.x < fx(WORLD_SIZE));
            assert!(p.y > 0 && p.y < fx(WORLD_SIZE));
            // Never on top of the exact center.
            assert!(p.sub(center).length_sq() > 0);
        }
    }

    #[test]
    fn test_toggle_boarding_in_and_out_of_range() {
        let mut sim = Sim::new(1);
        let ship = sim.spawn_ship(Vec2::from_int(100, 100), 0).unwrap();
        let near = sim.spawn_player(Vec2::from_int(105, 100)).unwrap();
        let far = sim.spawn_player(Vec2::from_int(200, 200)).unwrap();

        toggle_boarding(&mut sim, near);
        let (_, slot) = split_id(near).unwrap();
        assert_eq!(sim.player(slot).unwrap().aboard, Some(ship));

        toggle_boarding(&mut sim, far);
        let (_, slot) = split_id(far).unwrap();
        assert_eq!(sim.player(slot).unwrap().aboard, None);

        // Toggling again steps off.
        toggle_boarding(&mut sim, near);
        let (_, slot) = split_id(near).unwrap();
        assert_eq!(sim.player(slot).unwrap().aboard, None);
    }

    #[test]
    fn test_situation_flags() {
        let mut sim = Sim::new(1);
        let ship = sim.spawn_ship(Vec2::from_int(100, 100), 0).unwrap();
        let player = sim.spawn_player(Vec2::from_int(105, 100)).unwrap();
        sim.board(player, Some(ship)).unwrap();

        let mut client = {
            let mut mgr = ClientManager::new(1);
            mgr.add(1, "127.0.0.1:9000".parse().unwrap(), "t".into(), player, 0);
            mgr.remove(1).unwrap()
        };
        client.subscription.tracked.clear();

        let (nearby, combat, moving) = situation(&sim, &client, player);
        assert!(!nearby);
        assert!(!combat);
        assert!(!moving);

        sim.apply_damage(ship, 10);
        let (_, combat, _) = situation(&sim, &client, player);
        assert!(combat);
    }
}
