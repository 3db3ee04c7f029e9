//! Connected-client registry and broadcast fan-out.
//!
//! Each connection gets an outbound packet queue owned by its writer task;
//! the registry maps client ids to those queues plus the editing identity
//! used for ink accounting. A send to a closed queue means the client is
//! gone, and broadcast sweeps such clients out as it goes.

use log::info;
use shared::Packet;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct ConnectedClient {
    pub id: u32,
    /// Stable editing identity (guest id or user id), not unique per
    /// connection: the same person may hold several tabs.
    pub identity: String,
    pub addr: SocketAddr,
    pub sender: mpsc::UnboundedSender<Packet>,
}

pub struct ClientManager {
    clients: HashMap<u32, ConnectedClient>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a connection; `None` when the server is at capacity.
    pub fn add_client(
        &mut self,
        identity: String,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} ({}) connected from {}", client_id, identity, addr);
        self.clients.insert(
            client_id,
            ConnectedClient {
                id: client_id,
                identity,
                addr,
                sender,
            },
        );
        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: u32) -> bool {
        if let Some(client) = self.clients.remove(&client_id) {
            info!("Client {} ({}) disconnected", client.id, client.identity);
            true
        } else {
            false
        }
    }

    pub fn identity_of(&self, client_id: u32) -> Option<&str> {
        self.clients.get(&client_id).map(|c| c.identity.as_str())
    }

    /// Queues a packet for one client; false when the client is gone.
    pub fn send_to(&mut self, client_id: u32, packet: Packet) -> bool {
        match self.clients.get(&client_id) {
            Some(client) if client.sender.send(packet).is_ok() => true,
            Some(_) => {
                self.remove_client(client_id);
                false
            }
            None => false,
        }
    }

    /// Queues a packet for every connected client except `exclude`,
    /// dropping clients whose queue has closed.
    pub fn broadcast(&mut self, packet: &Packet, exclude: Option<u32>) {
        let mut stale = Vec::new();
        for (id, client) in &self.clients {
            if Some(*id) == exclude {
                continue;
            }
            if client.sender.send(packet.clone()).is_err() {
                stale.push(*id);
            }
        }
        for id in stale {
            self.remove_client(id);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
