//! Session registry: the single source of truth for live player state.
//!
//! This module tracks every identified connection and its player:
//! - Lookup by connection id and by player id, both O(1)
//! - Area membership, position, motion and equipment
//! - Per-player collision geometry for the current area
//! - Activity stamps used by idle eviction
//!
//! A session exists only after a successful identify. Removing a session is
//! idempotent so that disconnect and eviction can share one cleanup path.

use log::info;
use shared::{
    Direction, Equipment, MotionState, PlayerId, PlayerInfo, Rect, TradeId, Vector2,
};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, ServerError};
use crate::identity::Claims;

/// Server-assigned id for one client socket address.
pub type ConnectionId = u32;

/// Authoritative record of one connected player
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub player_id: PlayerId,
    pub username: String,
    pub role: String,
    pub area: String,
    pub position: Vector2,
    /// Present only while walking
    pub destination: Option<Vector2>,
    pub direction: Direction,
    pub motion: MotionState,
    pub equipment: Equipment,
    /// Collision rectangles of the current area, in client-supplied order
    pub collision: Vec<Rect>,
    /// Monotonic time of the last inbound request
    pub last_activity: Duration,
    pub active_trade: Option<TradeId>,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        claims: Claims,
        area: String,
        spawn: Vector2,
        collision: Vec<Rect>,
        now: Duration,
    ) -> Self {
        Self {
            connection_id,
            player_id: claims.player_id,
            username: claims.username,
            role: claims.role,
            area,
            position: spawn,
            destination: None,
            direction: Direction::South,
            motion: MotionState::Idle,
            equipment: Equipment::new(),
            collision,
            last_activity: now,
            active_trade: None,
        }
    }

    /// Ends any in-flight movement at the current position.
    pub fn stop(&mut self) {
        self.destination = None;
        self.motion = MotionState::Idle;
    }

    pub fn is_idle(&self, now: Duration, timeout: Duration) -> bool {
        now.saturating_sub(self.last_activity) > timeout
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.player_id,
            username: self.username.clone(),
            area: self.area.clone(),
            position: self.position,
            direction: self.direction,
            motion: self.motion,
            equipment: self.equipment.clone(),
        }
    }
}

/// Owns every live session, indexed by connection and by player
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
    by_player: HashMap<PlayerId, ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session for a freshly identified connection
    ///
    /// Fails with `DuplicateSession` if the connection already has a session
    /// or the player is already connected elsewhere.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        claims: Claims,
        area: String,
        spawn: Vector2,
        collision: Vec<Rect>,
        now: Duration,
    ) -> Result<&Session> {
        if self.sessions.contains_key(&connection_id)
            || self.by_player.contains_key(&claims.player_id)
        {
            return Err(ServerError::DuplicateSession);
        }

        let session = Session::new(connection_id, claims, area, spawn, collision, now);
        info!(
            "Player {} ({}) joined area '{}' on connection {}",
            session.player_id, session.username, session.area, connection_id
        );
        self.by_player.insert(session.player_id, connection_id);
        Ok(self.sessions.entry(connection_id).or_insert(session))
    }

    /// Session bound to a connection, if it has identified
    pub fn get(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    /// Mutable access for handlers that update position, equipment or
    /// activity stamps
    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&connection_id)
    }

    /// Finds a session by its authenticated player id
    ///
    /// Trade requests name their counterpart by player id, so this is how a
    /// receiver is resolved.
    pub fn get_by_player(&self, player_id: PlayerId) -> Option<&Session> {
        self.by_player
            .get(&player_id)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn get_by_player_mut(&mut self, player_id: PlayerId) -> Option<&mut Session> {
        self.by_player
            .get(&player_id)
            .and_then(|id| self.sessions.get_mut(id))
    }

    /// Connection currently carrying `player_id`
    pub fn connection_of(&self, player_id: PlayerId) -> Option<ConnectionId> {
        self.by_player.get(&player_id).copied()
    }

    /// Removes a session. Returns `None` if it was already gone.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&connection_id)?;
        self.by_player.remove(&session.player_id);
        info!(
            "Player {} left (connection {})",
            session.player_id, connection_id
        );
        Some(session)
    }

    /// Moves a session into a new area
    ///
    /// Resets position to the area's spawn point, stops any movement and
    /// swaps in the new area's collision geometry in one step.
    pub fn set_area(
        &mut self,
        connection_id: ConnectionId,
        area: String,
        spawn: Vector2,
        collision: Vec<Rect>,
    ) -> Result<&Session> {
        let session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or_else(|| ServerError::NotFound(format!("connection {}", connection_id)))?;
        session.area = area;
        session.position = spawn;
        session.stop();
        session.collision = collision;
        Ok(session)
    }

    /// Refreshes the activity stamp of a session
    pub fn touch(&mut self, connection_id: ConnectionId, now: Duration) {
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.last_activity = now;
        }
    }

    /// Connections whose last activity is older than `timeout`
    pub fn idle_connections(&self, now: Duration, timeout: Duration) -> Vec<ConnectionId> {
        let mut idle: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|session| session.is_idle(now, timeout))
            .map(|session| session.connection_id)
            .collect();
        idle.sort_unstable();
        idle
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
