//! Area membership and delivery targeting.

use std::collections::{BTreeSet, HashMap};

use crate::registry::ConnectionId;

/// Who an outbound packet is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// One specific connection
    Direct(ConnectionId),
    /// Everyone subscribed to `area`, optionally minus the originator
    Area {
        area: String,
        except: Option<ConnectionId>,
    },
    /// Every connected session
    Global,
}

/// Tracks which area channel each connection is subscribed to.
///
/// A connection is subscribed to at most one area. Targets are resolved
/// against membership at dispatch time, so a change of area is visible to
/// the very next broadcast.
#[derive(Debug, Default)]
pub struct AreaRouter {
    members: HashMap<String, BTreeSet<ConnectionId>>,
    subscriptions: HashMap<ConnectionId, String>,
}

impl AreaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a connection to `area`, dropping any previous subscription.
    pub fn join(&mut self, area: &str, connection_id: ConnectionId) {
        self.leave(connection_id);
        self.members
            .entry(area.to_string())
            .or_default()
            .insert(connection_id);
        self.subscriptions.insert(connection_id, area.to_string());
    }

    /// Unsubscribes a connection. Returns the area it was in.
    pub fn leave(&mut self, connection_id: ConnectionId) -> Option<String> {
        let area = self.subscriptions.remove(&connection_id)?;
        if let Some(members) = self.members.get_mut(&area) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.members.remove(&area);
            }
        }
        Some(area)
    }

    /// Moves a connection from its current area to `area` in one step.
    pub fn change(&mut self, connection_id: ConnectionId, area: &str) -> Option<String> {
        let previous = self.leave(connection_id);
        self.join(area, connection_id);
        previous
    }

    pub fn area_of(&self, connection_id: ConnectionId) -> Option<&str> {
        self.subscriptions.get(&connection_id).map(String::as_str)
    }

    /// Members of `area` in ascending connection order.
    pub fn members(&self, area: &str) -> Vec<ConnectionId> {
        self.members
            .get(area)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolves a delivery target to concrete connections.
    pub fn recipients(&self, delivery: &Delivery) -> Vec<ConnectionId> {
        match delivery {
            Delivery::Direct(connection_id) => vec![*connection_id],
            Delivery::Area { area, except } => self
                .members(area)
                .into_iter()
                .filter(|id| Some(*id) != *except)
                .collect(),
            Delivery::Global => {
                let mut all: Vec<ConnectionId> = self.subscriptions.keys().copied().collect();
                all.sort_unstable();
                all
            }
        }
    }

    pub fn area_count(&self) -> usize {
        self.members.len()
    }
}
