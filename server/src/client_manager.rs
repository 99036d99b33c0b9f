//! Connection table for the UDP transport
//!
//! UDP has no connections, so the server keeps its own: a client address
//! becomes a connection the first time it sends an identify request and stops
//! being one when it disconnects, is rejected or is evicted. Capacity is
//! enforced here, before any session exists.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::registry::ConnectionId;

/// Maps client addresses to connection ids
///
/// Both directions are indexed: inbound datagrams are resolved by address,
/// outbound deliveries by connection id. Ids start at 1 and are never reused
/// while the server runs.
#[derive(Debug)]
pub struct ClientManager {
    by_addr: HashMap<SocketAddr, ConnectionId>,
    addrs: HashMap<ConnectionId, SocketAddr>,
    next_id: ConnectionId,
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty table that admits at most `max_clients` connections
    pub fn new(max_clients: usize) -> Self {
        Self {
            by_addr: HashMap::new(),
            addrs: HashMap::new(),
            next_id: 1,
            max_clients,
        }
    }

    /// Assigns a connection id to `addr`
    ///
    /// Returns the existing id if the address is already known and `None`
    /// when the server is full.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        if let Some(existing) = self.by_addr.get(&addr) {
            return Some(*existing);
        }
        if self.is_full() {
            return None;
        }

        let connection_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.by_addr.insert(addr, connection_id);
        self.addrs.insert(connection_id, addr);
        info!("Connection {} opened from {}", connection_id, addr);
        Some(connection_id)
    }

    /// Looks up the connection a datagram belongs to
    ///
    /// Returns `None` for addresses that never identified, or whose
    /// connection has since been closed.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(&addr).copied()
    }

    /// Address to send a connection's outbound packets to
    ///
    /// `None` once the connection is closed, so late deliveries for a
    /// departed client are dropped instead of sent.
    pub fn addr_of(&self, connection_id: ConnectionId) -> Option<SocketAddr> {
        self.addrs.get(&connection_id).copied()
    }

    /// Closes a connection and frees its slot
    ///
    /// Returns the address it was bound to, or `None` if it was already
    /// closed.
    pub fn remove_client(&mut self, connection_id: ConnectionId) -> Option<SocketAddr> {
        let addr = self.addrs.remove(&connection_id)?;
        self.by_addr.remove(&addr);
        info!("Connection {} from {} closed", connection_id, addr);
        Some(addr)
    }

    /// All open connections in ascending id order
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.addrs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// True when another identify from a new address would be refused
    pub fn is_full(&self) -> bool {
        self.addrs.len() >= self.max_clients
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_add_and_lookup() {
        let mut clients = ClientManager::new(4);
        let a = clients.add_client(addr(1000)).unwrap();
        let b = clients.add_client(addr(1001)).unwrap();

        assert_ne!(a, b);
        assert_eq!(clients.find_client_by_addr(addr(1000)), Some(a));
        assert_eq!(clients.addr_of(b), Some(addr(1001)));
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn test_same_address_keeps_id() {
        let mut clients = ClientManager::new(4);
        let first = clients.add_client(addr(1000));
        assert_eq!(clients.add_client(addr(1000)), first);
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let mut clients = ClientManager::new(1);
        assert!(clients.add_client(addr(1000)).is_some());
        assert!(clients.is_full());
        assert!(clients.add_client(addr(1001)).is_none());
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut clients = ClientManager::new(1);
        let id = clients.add_client(addr(1000)).unwrap();
        assert_eq!(clients.remove_client(id), Some(addr(1000)));
        assert_eq!(clients.remove_client(id), None);
        assert!(clients.find_client_by_addr(addr(1000)).is_none());

        let next = clients.add_client(addr(1001)).unwrap();
        assert_ne!(next, id);
        assert_eq!(clients.connection_ids(), vec![next]);
    }
}
