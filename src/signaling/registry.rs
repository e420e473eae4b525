//! Relay-side room membership.
//!
//! Pure bookkeeping: every call returns the messages to deliver and leaves the
//! delivery to the caller. Rooms exist only while they have members.

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::protocol::{ClientMessage, ServerMessage};

pub type ConnectionId = u64;

/// A message addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

#[derive(Debug, Default)]
struct Connection {
    peer_id: Option<String>,
    rooms: BTreeSet<String>,
    current_room: Option<String>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Vec<ConnectionId>>,
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> ConnectionId {
        self.next_id += 1;
        self.connections.insert(self.next_id, Connection::default());
        self.next_id
    }

    pub fn handle(&mut self, conn: ConnectionId, message: ClientMessage) -> Vec<Outbound> {
        if !self.connections.contains_key(&conn) {
            debug!("Message from unknown connection {} ignored", conn);
            return Vec::new();
        }
        match message {
            ClientMessage::Join { room, peer_id } => self.join(conn, room, peer_id),
            ClientMessage::Leave { room } => self.leave(conn, &room),
            ClientMessage::ListPeers => self.list_peers(conn),
        }
    }

    /// Drop a connection, announcing its departure from every room it was in.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<Outbound> {
        let Some(connection) = self.connections.get(&conn) else {
            return Vec::new();
        };
        let rooms: Vec<String> = connection.rooms.iter().cloned().collect();
        let mut out = Vec::new();
        for room in rooms {
            out.extend(self.leave(conn, &room));
        }
        self.connections.remove(&conn);
        out
    }

    /// Peer ids in a room, in join order.
    pub fn members(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|conns| conns.iter().filter_map(|c| self.peer_id(*c)).collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn peer_id(&self, conn: ConnectionId) -> Option<String> {
        self.connections.get(&conn).and_then(|c| c.peer_id.clone())
    }

    fn join(&mut self, conn: ConnectionId, room: String, peer_id: String) -> Vec<Outbound> {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return Vec::new();
        };
        connection.peer_id = Some(peer_id.clone());
        connection.rooms.insert(room.clone());
        connection.current_room = Some(room.clone());

        let members = self.rooms.entry(room.clone()).or_default();
        let others: Vec<ConnectionId> = members.iter().copied().filter(|c| *c != conn).collect();
        if !members.contains(&conn) {
            members.push(conn);
        }
        info!("{} joined room {} ({} members)", peer_id, room, members.len());

        let mut out = vec![Outbound {
            to: conn,
            message: ServerMessage::JoinApprove { room },
        }];
        out.extend(others.into_iter().map(|to| Outbound {
            to,
            message: ServerMessage::UserJoined {
                peer_id: peer_id.clone(),
            },
        }));
        out
    }

    fn leave(&mut self, conn: ConnectionId, room: &str) -> Vec<Outbound> {
        let Some(members) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        let Some(position) = members.iter().position(|c| *c == conn) else {
            return Vec::new();
        };
        members.remove(position);
        let others = members.clone();
        if members.is_empty() {
            self.rooms.remove(room);
            debug!("Room {} is empty, dropping it", room);
        }

        let peer_id = match self.connections.get_mut(&conn) {
            Some(connection) => {
                connection.rooms.remove(room);
                if connection.current_room.as_deref() == Some(room) {
                    connection.current_room = None;
                }
                connection.peer_id.clone()
            }
            None => None,
        };
        let Some(peer_id) = peer_id else {
            return Vec::new();
        };
        info!("{} left room {}", peer_id, room);

        others
            .into_iter()
            .map(|to| Outbound {
                to,
                message: ServerMessage::UserLeft {
                    peer_id: peer_id.clone(),
                },
            })
            .collect()
    }

    fn list_peers(&self, conn: ConnectionId) -> Vec<Outbound> {
        let peer_ids = self
            .connections
            .get(&conn)
            .and_then(|c| c.current_room.as_deref())
            .map(|room| self.members(room))
            .unwrap_or_default();
        vec![Outbound {
            to: conn,
            message: ServerMessage::ListPeers { peer_ids },
        }]
    }
}
