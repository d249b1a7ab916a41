//! Connected-client registry. Each client bundles its address, its
//! player entity, and the per-client machinery: reliability connection,
//! snapshot codec state, AOI subscription and input validator.

use crate::aoi::Subscription;
use crate::reliability::Connection;
use crate::sim::InputCommand;
use crate::snapshot::SnapshotState;
use crate::validator::InputValidator;
use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Clients silent for this long are disconnected.
pub const CLIENT_TIMEOUT_MS: u64 = 5000;

pub struct Client {
    pub id: u32,
    pub addr: SocketAddr,
    pub name: String,
    /// Entity id of this client's deckhand in the simulation.
    pub player_entity: u16,
    pub last_seen_ms: u64,
    pub conn: Connection,
    pub snapshot: SnapshotState,
    pub subscription: Subscription,
    pub validator: InputValidator,
    /// Commands accepted this tick, applied in sequence order at the
    /// start of the next step.
    pub pending_inputs: Vec<InputCommand>,
    /// Shooter latency estimate fed to hit rewind, ms.
    pub lag_ms: u64,
    pub banned: bool,
}

impl Client {
    fn new(id: u32, addr: SocketAddr, name: String, player_entity: u16, now_ms: u64) -> Self {
        Client {
            id,
            addr,
            name,
            player_entity,
            last_seen_ms: now_ms,
            conn: Connection::new(now_ms),
            snapshot: SnapshotState::new(),
            subscription: Subscription::new(player_entity),
            validator: InputValidator::new(now_ms),
            pending_inputs: Vec::new(),
            lag_ms: 0,
            banned: false,
        }
    }

    /// Refreshes the latency estimate from the connection's RTT.
    pub fn update_lag(&mut self) {
        self.lag_ms = (self.conn.rtt_ms() / 2.0) as u64;
    }
}

pub struct ClientManager {
    clients: HashMap<u32, Client>,
    by_addr: HashMap<SocketAddr, u32>,
    max_clients: usize,
    pub total_connected: u64,
    pub timeouts: u64,
    pub bans: u64,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        ClientManager {
            clients: HashMap::new(),
            by_addr: HashMap::new(),
            max_clients,
            total_connected: 0,
            timeouts: 0,
            bans: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    /// Admits a client. Returns `None` when the server is full or the id
    /// is already taken by a different address.
    pub fn add(
        &mut self,
        id: u32,
        addr: SocketAddr,
        name: String,
        player_entity: u16,
        now_ms: u64,
    ) -> Option<&mut Client> {
        if let Some(existing) = self.clients.get(&id) {
            if existing.addr != addr {
                warn!("client id {} already connected from {}", id, existing.addr);
                return None;
            }
            // Same id, same address: a retried handshake.
            return self.clients.get_mut(&id);
        }
        if self.is_full() {
            warn!("server full, rejecting {} from {}", name, addr);
            return None;
        }
        info!("client {} ({}) connected from {}", id, name, addr);
        self.by_addr.insert(addr, id);
        self.total_connected += 1;
        self.clients
            .insert(id, Client::new(id, addr, name, player_entity, now_ms));
        self.clients.get_mut(&id)
    }

    /// Removes a client, returning it so the caller can despawn its
    /// player entity.
    pub fn remove(&mut self, id: u32) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        self.by_addr.remove(&client.addr);
        info!("client {} ({}) disconnected", client.id, client.name);
        Some(client)
    }

    pub fn get(&self, id: u32) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn find_by_addr(&mut self, addr: &SocketAddr) -> Option<&mut Client> {
        let id = *self.by_addr.get(addr)?;
        self.clients.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.values_mut()
    }

    /// Clients silent past the timeout, in no particular order.
    pub fn timed_out(&self, now_ms: u64) -> Vec<u32> {
        self.clients
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_seen_ms) > CLIENT_TIMEOUT_MS)
            .map(|c| c.id)
            .collect()
    }

    /// Clients whose suspicion crossed the ban threshold.
    pub fn to_ban(&self) -> Vec<u32> {
        self.clients
            .values()
            .filter(|c| !c.banned && c.validator.should_ban())
            .map(|c| c.id)
            .collect()
    }
}
