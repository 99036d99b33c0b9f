//! The authoritative world: every live session, area and trade in one place.
//!
//! `World` is owned by the server's main loop and is the only component that
//! mutates sessions or trades. Each handler takes one inbound request and
//! returns the packets it produces, each addressed with a [`Delivery`]
//! target. Nothing here blocks or awaits; trade settlement is handed out as
//! an [`ExecutionTicket`] and its result comes back through
//! [`World::finish_trade`].

use log::{debug, info, warn};
use shared::{
    first_collision, Equipment, Offer, Packet, PlayerId, PlayerInfo, Rect, TradeId, Vector2,
    CHAT_MAX_CHARS, MAX_AREA_ID_LEN, MAX_COLLISION_RECTS, MAX_ITEM_CODE_LEN,
    ROSTER_CHUNK_PLAYERS, TRADE_CHAT_MAX_CHARS,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::areas::{AreaRouter, Delivery};
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::housekeeping::Housekeeper;
use crate::identity::IdentityProvider;
use crate::movement::MovementEngine;
use crate::registry::{ConnectionId, Session, SessionRegistry};
use crate::store::ItemCatalog;
use crate::trade::{equipped_items, ExecutionTicket, Trade, TradeBook};
use crate::utils::{get_timestamp, sanitize_message};

/// A packet and who should receive it
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub delivery: Delivery,
    pub packet: Packet,
}

impl Outbound {
    pub fn direct(connection_id: ConnectionId, packet: Packet) -> Self {
        Self {
            delivery: Delivery::Direct(connection_id),
            packet,
        }
    }

    pub fn area(area: &str, except: Option<ConnectionId>, packet: Packet) -> Self {
        Self {
            delivery: Delivery::Area {
                area: area.to_string(),
                except,
            },
            packet,
        }
    }

    pub fn global(packet: Packet) -> Self {
        Self {
            delivery: Delivery::Global,
            packet,
        }
    }
}

pub struct World {
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityProvider>,
    catalog: ItemCatalog,
    registry: SessionRegistry,
    areas: AreaRouter,
    movement: MovementEngine,
    trades: TradeBook,
    housekeeper: Housekeeper,
    /// Tickets issued but not yet picked up by the server loop
    pending_executions: Vec<ExecutionTicket>,
    /// Unequip plans of trades currently executing
    unequip_plans: HashMap<TradeId, HashMap<PlayerId, Vec<(shared::EquipmentSlot, String)>>>,
}

impl World {
    pub fn new(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        identity: Arc<dyn IdentityProvider>,
        catalog: ItemCatalog,
    ) -> Self {
        let housekeeper = Housekeeper::new(Arc::clone(&clock), config.idle_timeout);
        Self {
            movement: MovementEngine::from_config(&config),
            config,
            clock,
            identity,
            catalog,
            registry: SessionRegistry::new(),
            areas: AreaRouter::new(),
            trades: TradeBook::new(),
            housekeeper,
            pending_executions: Vec::new(),
            unequip_plans: HashMap::new(),
        }
    }

    pub fn session(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.registry.get(connection_id)
    }

    pub fn session_by_player(&self, player_id: PlayerId) -> Option<&Session> {
        self.registry.get_by_player(player_id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn trade(&self, trade_id: TradeId) -> Option<&Trade> {
        self.trades.get(trade_id)
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    /// Areas with at least one member.
    pub fn area_count(&self) -> usize {
        self.areas.area_count()
    }

    pub fn tick_count(&self) -> u64 {
        self.movement.tick_count()
    }

    /// Resolves a delivery target against current area membership.
    pub fn recipients(&self, delivery: &Delivery) -> Vec<ConnectionId> {
        self.areas.recipients(delivery)
    }

    /// Tickets for trades that just entered `Executing`.
    pub fn take_executions(&mut self) -> Vec<ExecutionTicket> {
        std::mem::take(&mut self.pending_executions)
    }

    /// Dispatches one inbound packet from a connection.
    pub fn handle_packet(&mut self, connection_id: ConnectionId, packet: Packet) -> Vec<Outbound> {
        self.registry.touch(connection_id, self.clock.now());

        let result = match packet {
            Packet::Identify {
                token,
                area,
                collision,
            } => return self.identify(connection_id, &token, area, collision),
            Packet::Disconnect => return self.disconnect(connection_id),
            Packet::MoveTo { x, y } => self.move_to(connection_id, Vector2::new(x, y)),
            Packet::ChangeArea { area, collision } => {
                self.change_area(connection_id, area, collision)
            }
            Packet::EquipmentUpdate { equipment } => {
                self.update_equipment(connection_id, equipment)
            }
            Packet::Chat { message } => self.chat(connection_id, &message),
            Packet::TradeRequest { receiver_id } => self.request_trade(connection_id, receiver_id),
            Packet::TradeAccept { trade_id } => self.accept_trade(connection_id, trade_id),
            Packet::TradeOfferUpdate { trade_id, offer } => {
                self.update_offer(connection_id, trade_id, offer)
            }
            Packet::TradeLockUpdate { trade_id, locked } => {
                self.update_lock(connection_id, trade_id, locked)
            }
            Packet::TradeReadyUpdate { trade_id, ready } => {
                self.update_ready(connection_id, trade_id, ready)
            }
            Packet::TradeCancel { trade_id, reason } => {
                self.cancel_trade(connection_id, trade_id, reason)
            }
            Packet::TradeChat { trade_id, message } => {
                self.trade_chat(connection_id, trade_id, &message)
            }
            other => {
                warn!(
                    "Unexpected packet type from connection {}: {:?}",
                    connection_id, other
                );
                Ok(Vec::new())
            }
        };

        match result {
            Ok(outbound) => outbound,
            Err(ServerError::PreconditionFailed(reason)) => {
                debug!("Ignored request from {}: {}", connection_id, reason);
                Vec::new()
            }
            Err(e) => {
                debug!("Dropped request from {}: {}", connection_id, e);
                Vec::new()
            }
        }
    }

    fn session_or_not_found(&self, connection_id: ConnectionId) -> Result<&Session> {
        self.registry
            .get(connection_id)
            .ok_or_else(|| ServerError::NotFound(format!("session for {}", connection_id)))
    }

    fn identify(
        &mut self,
        connection_id: ConnectionId,
        token: &str,
        area: Option<String>,
        collision: Vec<Rect>,
    ) -> Vec<Outbound> {
        match self.try_identify(connection_id, token, area, collision) {
            Ok(outbound) => outbound,
            Err(e) => {
                info!("Identify on connection {} rejected: {}", connection_id, e);
                let reason = match e {
                    ServerError::Unauthorized => "unauthorized".to_string(),
                    ServerError::DuplicateSession => "already connected".to_string(),
                    other => other.to_string(),
                };
                vec![Outbound::direct(
                    connection_id,
                    Packet::IdentifyRejected { reason },
                )]
            }
        }
    }

    fn try_identify(
        &mut self,
        connection_id: ConnectionId,
        token: &str,
        area: Option<String>,
        collision: Vec<Rect>,
    ) -> Result<Vec<Outbound>> {
        if self.registry.get(connection_id).is_some() {
            return Err(ServerError::DuplicateSession);
        }
        let claims = self.identity.verify(token)?;
        let area = match area {
            Some(area) if !area.trim().is_empty() => validate_area(area)?,
            _ => self.config.home_area.clone(),
        };
        validate_geometry(&collision)?;
        let spawn = self.config.spawn_point(&area);
        validate_spawn(&area, spawn, &collision)?;

        let now = self.clock.now();
        let player = self
            .registry
            .register(connection_id, claims, area.clone(), spawn, collision, now)?
            .info();
        self.areas.join(&area, connection_id);

        let mut outbound = vec![Outbound::direct(
            connection_id,
            Packet::IdentifyOk {
                player: player.clone(),
            },
        )];
        outbound.extend(self.roster(connection_id, &area));
        outbound.push(Outbound::area(
            &area,
            Some(connection_id),
            Packet::PlayerJoined { player },
        ));
        Ok(outbound)
    }

    fn players_in(&self, area: &str, except: Option<ConnectionId>) -> Vec<PlayerInfo> {
        self.areas
            .members(area)
            .into_iter()
            .filter(|id| Some(*id) != except)
            .filter_map(|id| self.registry.get(id))
            .map(Session::info)
            .collect()
    }

    /// Everyone else in `area`, split into datagram-sized `CurrentPlayers`
    ///
    /// An empty area still produces one packet so the client knows the
    /// roster is complete.
    fn roster(&self, connection_id: ConnectionId, area: &str) -> Vec<Outbound> {
        let others = self.players_in(area, Some(connection_id));
        if others.is_empty() {
            return vec![Outbound::direct(
                connection_id,
                Packet::CurrentPlayers {
                    area: area.to_string(),
                    players: others,
                },
            )];
        }
        others
            .chunks(ROSTER_CHUNK_PLAYERS)
            .map(|chunk| {
                Outbound::direct(
                    connection_id,
                    Packet::CurrentPlayers {
                        area: area.to_string(),
                        players: chunk.to_vec(),
                    },
                )
            })
            .collect()
    }

    fn move_to(&mut self, connection_id: ConnectionId, target: Vector2) -> Result<Vec<Outbound>> {
        let session = self
            .registry
            .get_mut(connection_id)
            .ok_or_else(|| ServerError::NotFound(format!("session for {}", connection_id)))?;

        match self.movement.request_move(session, target) {
            Ok(()) => Ok(Vec::new()),
            Err(ServerError::PreconditionFailed(_)) | Err(ServerError::InvalidRequest(_)) => {
                Ok(vec![Outbound::direct(
                    connection_id,
                    Packet::MoveRejected {
                        x: target.x,
                        y: target.y,
                    },
                )])
            }
            Err(e) => Err(e),
        }
    }

    fn change_area(
        &mut self,
        connection_id: ConnectionId,
        area: String,
        collision: Vec<Rect>,
    ) -> Result<Vec<Outbound>> {
        let area = validate_area(area)?;
        validate_geometry(&collision)?;

        let from = self.session_or_not_found(connection_id)?.area.clone();
        let spawn = self.config.spawn_point(&area);
        validate_spawn(&area, spawn, &collision)?;
        let session = self
            .registry
            .set_area(connection_id, area.clone(), spawn, collision)?;
        let player_id = session.player_id;
        let position = session.position;
        self.areas.change(connection_id, &area);
        info!("Player {} moved from '{}' to '{}'", player_id, from, area);

        let changed = Packet::PlayerAreaChanged {
            player_id,
            from: from.clone(),
            to: area.clone(),
            position,
        };
        let mut outbound = vec![
            Outbound::area(&from, Some(connection_id), changed.clone()),
            Outbound::area(&area, None, changed),
        ];
        outbound.extend(self.roster(connection_id, &area));
        Ok(outbound)
    }

    fn update_equipment(
        &mut self,
        connection_id: ConnectionId,
        equipment: Equipment,
    ) -> Result<Vec<Outbound>> {
        validate_equipment(&equipment)?;
        let session = self
            .registry
            .get_mut(connection_id)
            .ok_or_else(|| ServerError::NotFound(format!("session for {}", connection_id)))?;
        session.equipment = equipment;

        Ok(vec![Outbound::area(
            &session.area,
            Some(connection_id),
            Packet::PlayerUpdate {
                player_id: session.player_id,
                equipment: session.equipment.clone(),
            },
        )])
    }

    fn chat(&mut self, connection_id: ConnectionId, message: &str) -> Result<Vec<Outbound>> {
        let session = self.session_or_not_found(connection_id)?;
        let message = sanitize_message(message, CHAT_MAX_CHARS)
            .ok_or_else(|| ServerError::InvalidRequest("empty or oversized chat".into()))?;

        Ok(vec![Outbound::global(Packet::ChatMessage {
            player_id: session.player_id,
            username: session.username.clone(),
            area: session.area.clone(),
            message,
            timestamp: get_timestamp(),
        })])
    }

    /// Sends `packet` to each listed player that is still connected.
    fn to_players(&self, players: &[PlayerId], packet: Packet) -> Vec<Outbound> {
        players
            .iter()
            .filter_map(|player_id| self.registry.connection_of(*player_id))
            .map(|connection_id| Outbound::direct(connection_id, packet.clone()))
            .collect()
    }

    fn trade_status(&self, trade: &Trade) -> Vec<Outbound> {
        self.to_players(
            &trade.participants(),
            Packet::TradeStatusUpdated {
                trade: trade.snapshot(),
            },
        )
    }

    /// Drops the active-trade back-reference of each participant still online.
    fn release_participants(&mut self, trade: &Trade) {
        for player_id in trade.participants() {
            if let Some(session) = self.registry.get_by_player_mut(player_id) {
                if session.active_trade == Some(trade.id) {
                    session.active_trade = None;
                }
            }
        }
    }

    fn request_trade(
        &mut self,
        connection_id: ConnectionId,
        receiver_id: PlayerId,
    ) -> Result<Vec<Outbound>> {
        let initiator = self.session_or_not_found(connection_id)?;
        let initiator_key = (initiator.player_id, initiator.username.clone());

        let refusal = if receiver_id == initiator.player_id {
            Some("cannot trade with yourself")
        } else if initiator.active_trade.is_some() {
            Some("you are already trading")
        } else {
            match self.registry.get_by_player(receiver_id) {
                None => Some("player is not online"),
                Some(receiver) if receiver.active_trade.is_some() => Some("player is busy"),
                Some(_) => None,
            }
        };
        if let Some(reason) = refusal {
            debug!(
                "Trade request {} -> {} refused: {}",
                initiator_key.0, receiver_id, reason
            );
            return Ok(vec![Outbound::direct(
                connection_id,
                Packet::TradeRequestFailed {
                    receiver_id,
                    reason: reason.to_string(),
                },
            )]);
        }

        let receiver = self
            .registry
            .get_by_player(receiver_id)
            .ok_or_else(|| ServerError::NotFound(format!("player {}", receiver_id)))?;
        let receiver_key = (receiver.player_id, receiver.username.clone());
        let receiver_connection = receiver.connection_id;

        let trade = self.trades.open(initiator_key.clone(), receiver_key)?;
        let trade_id = trade.id;
        for player_id in trade.participants() {
            if let Some(session) = self.registry.get_by_player_mut(player_id) {
                session.active_trade = Some(trade_id);
            }
        }

        Ok(vec![Outbound::direct(
            receiver_connection,
            Packet::TradeRequestReceived {
                trade_id,
                initiator_id: initiator_key.0,
                initiator_name: initiator_key.1,
            },
        )])
    }

    fn actor(&self, connection_id: ConnectionId) -> Result<PlayerId> {
        Ok(self.session_or_not_found(connection_id)?.player_id)
    }

    fn accept_trade(&mut self, connection_id: ConnectionId, trade_id: TradeId) -> Result<Vec<Outbound>> {
        let actor = self.actor(connection_id)?;
        let trade = self.trades.accept(actor, trade_id)?.clone();
        Ok(self.trade_status(&trade))
    }

    fn update_offer(
        &mut self,
        connection_id: ConnectionId,
        trade_id: TradeId,
        offer: Offer,
    ) -> Result<Vec<Outbound>> {
        let actor = self.actor(connection_id)?;
        let trade = self
            .trades
            .update_offer(actor, trade_id, offer, &self.catalog)?
            .clone();
        Ok(self.trade_status(&trade))
    }

    fn update_lock(
        &mut self,
        connection_id: ConnectionId,
        trade_id: TradeId,
        locked: bool,
    ) -> Result<Vec<Outbound>> {
        let actor = self.actor(connection_id)?;
        let trade = self.trades.update_lock(actor, trade_id, locked)?.clone();
        Ok(self.trade_status(&trade))
    }

    fn update_ready(
        &mut self,
        connection_id: ConnectionId,
        trade_id: TradeId,
        ready: bool,
    ) -> Result<Vec<Outbound>> {
        let actor = self.actor(connection_id)?;
        if let Some(mut ticket) = self.trades.update_ready(actor, trade_id, ready)? {
            for (player_id, offer) in [
                (ticket.initiator_id, &ticket.initiator_offer),
                (ticket.receiver_id, &ticket.receiver_offer),
            ] {
                let worn = self
                    .registry
                    .get_by_player(player_id)
                    .map(|session| equipped_items(offer, &session.equipment, &self.catalog))
                    .unwrap_or_default();
                ticket.unequip.insert(player_id, worn);
            }
            self.unequip_plans
                .insert(trade_id, ticket.unequip.clone());
            self.pending_executions.push(ticket);
        }

        let trade = self
            .trades
            .get(trade_id)
            .ok_or_else(|| ServerError::NotFound(format!("trade {}", trade_id)))?;
        Ok(self.trade_status(trade))
    }

    fn cancel_trade(
        &mut self,
        connection_id: ConnectionId,
        trade_id: TradeId,
        reason: Option<String>,
    ) -> Result<Vec<Outbound>> {
        let actor = self.actor(connection_id)?;
        let reason = reason.and_then(|r| sanitize_message(&r, TRADE_CHAT_MAX_CHARS));
        let trade = self.trades.cancel(actor, trade_id, reason)?;
        self.release_participants(&trade);
        Ok(self.trade_status(&trade))
    }

    fn trade_chat(
        &mut self,
        connection_id: ConnectionId,
        trade_id: TradeId,
        message: &str,
    ) -> Result<Vec<Outbound>> {
        let session = self.session_or_not_found(connection_id)?;
        let participants = self
            .trades
            .chat_participants(session.player_id, trade_id)
            .ok_or_else(|| ServerError::InvalidRequest("not a trade participant".into()))?;
        let message = sanitize_message(message, TRADE_CHAT_MAX_CHARS)
            .ok_or_else(|| ServerError::InvalidRequest("empty or oversized trade chat".into()))?;

        let packet = Packet::TradeChatMessage {
            trade_id,
            sender_id: session.player_id,
            sender_name: session.username.clone(),
            message,
            timestamp: get_timestamp(),
        };
        Ok(self.to_players(&participants, packet))
    }

    /// Applies the entity store's verdict to an executing trade
    ///
    /// On success each participant's offered items that are still worn are
    /// taken off, the owner is told which slots emptied and their area sees
    /// the new equipment. A second call for the same trade does nothing.
    pub fn finish_trade(&mut self, trade_id: TradeId, outcome: Result<()>) -> Vec<Outbound> {
        let outcome = outcome.map_err(|e| match e {
            ServerError::ExecutionFailed(reason) => reason,
            other => other.to_string(),
        });
        let plans = self.unequip_plans.remove(&trade_id).unwrap_or_default();
        let Some(trade) = self.trades.finish(trade_id, outcome) else {
            return Vec::new();
        };
        self.release_participants(&trade);

        if trade.status != shared::TradeStatus::Completed {
            return self.trade_status(&trade);
        }

        let mut outbound = Vec::new();
        for player_id in trade.participants() {
            let Some(session) = self.registry.get_by_player_mut(player_id) else {
                continue;
            };
            let mut emptied = Vec::new();
            for (slot, code) in plans.get(&player_id).into_iter().flatten() {
                if session.equipment.is_wearing(*slot, code) {
                    session.equipment.clear(*slot);
                    emptied.push(*slot);
                }
            }
            if emptied.is_empty() {
                continue;
            }
            outbound.push(Outbound::direct(
                session.connection_id,
                Packet::ItemsUnequipped { slots: emptied },
            ));
            outbound.push(Outbound::area(
                &session.area,
                None,
                Packet::PlayerUpdate {
                    player_id,
                    equipment: session.equipment.clone(),
                },
            ));
        }
        outbound.extend(self.to_players(
            &trade.participants(),
            Packet::TradeCompleted {
                trade: trade.snapshot(),
            },
        ));
        outbound
    }

    /// Tears down a session: registry, area and any negotiable trade, in one step.
    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Vec<Outbound> {
        let Some(session) = self.registry.remove(connection_id) else {
            return Vec::new();
        };
        let area = self.areas.leave(connection_id).unwrap_or(session.area.clone());

        let mut outbound = vec![Outbound::area(
            &area,
            None,
            Packet::PlayerDisconnected {
                player_id: session.player_id,
            },
        )];

        if let Some(trade_id) = session.active_trade {
            if let Some(trade) = self.trades.abandon(trade_id, "player disconnected") {
                self.release_participants(&trade);
                if let Some(counterpart) = trade.counterpart(session.player_id) {
                    outbound.extend(self.to_players(
                        &[counterpart],
                        Packet::TradeStatusUpdated {
                            trade: trade.snapshot(),
                        },
                    ));
                }
            }
        }
        outbound
    }

    /// Advances every walker by one tick and batches the deltas.
    pub fn tick(&mut self) -> Vec<Outbound> {
        let moves = self.movement.tick(self.registry.iter_mut());
        if moves.is_empty() {
            return Vec::new();
        }
        vec![Outbound::global(Packet::PlayersMoved {
            tick: self.movement.tick_count(),
            moves,
        })]
    }

    /// Disconnects every idle session. Returns the evicted connections too.
    pub fn evict_idle(&mut self) -> (Vec<ConnectionId>, Vec<Outbound>) {
        let idle = self.housekeeper.sweep(&self.registry);
        let mut outbound = Vec::new();
        for connection_id in &idle {
            outbound.extend(self.disconnect(*connection_id));
        }
        (idle, outbound)
    }
}

fn validate_area(area: String) -> Result<String> {
    let area = area.trim().to_string();
    if area.is_empty() || area.len() > MAX_AREA_ID_LEN {
        return Err(ServerError::InvalidRequest(format!(
            "bad area id '{}'",
            area
        )));
    }
    Ok(area)
}

fn validate_equipment(equipment: &Equipment) -> Result<()> {
    match equipment
        .iter()
        .find(|(_, code)| code.is_empty() || code.len() > MAX_ITEM_CODE_LEN)
    {
        Some((slot, code)) => Err(ServerError::InvalidRequest(format!(
            "{}-byte item code in slot {}",
            code.len(),
            slot
        ))),
        None => Ok(()),
    }
}

/// The spawn point must be walkable, or the session could never move.
fn validate_spawn(area: &str, spawn: Vector2, collision: &[Rect]) -> Result<()> {
    match first_collision(collision, &spawn) {
        Some(rect) => Err(ServerError::InvalidRequest(format!(
            "spawn point ({}, {}) of '{}' lies inside {:?}",
            spawn.x, spawn.y, area, rect
        ))),
        None => Ok(()),
    }
}

fn validate_geometry(collision: &[Rect]) -> Result<()> {
    if collision.len() > MAX_COLLISION_RECTS {
        return Err(ServerError::InvalidRequest(format!(
            "{} collision rectangles, limit is {}",
            collision.len(),
            MAX_COLLISION_RECTS
        )));
    }
    if let Some(rect) = collision.iter().find(|rect| !rect.is_valid()) {
        return Err(ServerError::InvalidRequest(format!(
            "invalid collision rectangle {:?}",
            rect
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{Claims, TokenVerifier};
    use crate::store::CatalogItem;
    use shared::{
        EquipmentSlot, MotionState, OfferedItem, PlayerMoved, TradeStatus, HOME_SPAWN,
    };
    use std::time::Duration;

    const SECRET: &str = "test-secret";

    struct Harness {
        world: World,
        clock: Arc<ManualClock>,
        verifier: TokenVerifier,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let config = ServerConfig {
                auth_secret: SECRET.to_string(),
                ..ServerConfig::default()
            };
            let catalog = ItemCatalog::new(vec![CatalogItem {
                item_id: 1,
                code: "hat_red".to_string(),
                item_type: "hat".to_string(),
            }]);
            let world = World::new(
                config,
                clock.clone(),
                Arc::new(TokenVerifier::new(SECRET).unwrap()),
                catalog,
            );
            Self {
                world,
                clock,
                verifier: TokenVerifier::new(SECRET).unwrap(),
            }
        }

        fn token(&self, player_id: PlayerId) -> String {
            self.verifier.sign(&Claims {
                player_id,
                username: format!("player{}", player_id),
                role: "user".to_string(),
            })
        }

        fn join(&mut self, connection_id: ConnectionId, player_id: PlayerId) -> Vec<Outbound> {
            let token = self.token(player_id);
            self.world.handle_packet(
                connection_id,
                Packet::Identify {
                    token,
                    area: None,
                    collision: vec![],
                },
            )
        }

        fn send(&mut self, connection_id: ConnectionId, packet: Packet) -> Vec<Outbound> {
            self.world.handle_packet(connection_id, packet)
        }

        /// Opens and accepts a trade between connections 1 (player 10) and 2 (player 20).
        fn started_trade(&mut self) -> TradeId {
            self.join(1, 10);
            self.join(2, 20);
            let out = self.send(1, Packet::TradeRequest { receiver_id: 20 });
            let trade_id = match &out[0].packet {
                Packet::TradeRequestReceived { trade_id, .. } => *trade_id,
                other => panic!("unexpected {:?}", other),
            };
            self.send(2, Packet::TradeAccept { trade_id });
            trade_id
        }

        fn lock_both(&mut self, trade_id: TradeId) {
            self.send(1, Packet::TradeLockUpdate { trade_id, locked: true });
            self.send(2, Packet::TradeLockUpdate { trade_id, locked: true });
        }
    }

    fn packets_for(outbound: &[Outbound], delivery: &Delivery) -> Vec<Packet> {
        outbound
            .iter()
            .filter(|o| &o.delivery == delivery)
            .map(|o| o.packet.clone())
            .collect()
    }

    #[test]
    fn test_identify_success() {
        let mut h = Harness::new();
        h.join(1, 10);
        let out = h.join(2, 20);

        assert!(matches!(out[0].packet, Packet::IdentifyOk { ref player } if player.player_id == 20));
        match &out[1].packet {
            Packet::CurrentPlayers { area, players } => {
                assert_eq!(area, "home");
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].player_id, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            out[2].delivery,
            Delivery::Area {
                area: "home".to_string(),
                except: Some(2),
            }
        );
        assert_eq!(h.world.recipients(&out[2].delivery), vec![1]);

        let session = h.world.session(2).unwrap();
        assert_eq!(session.position, HOME_SPAWN);
    }

    #[test]
    fn test_identify_bad_token() {
        let mut h = Harness::new();
        let out = h.send(
            1,
            Packet::Identify {
                token: "forged.token".to_string(),
                area: None,
                collision: vec![],
            },
        );
        assert_eq!(
            out,
            vec![Outbound::direct(
                1,
                Packet::IdentifyRejected {
                    reason: "unauthorized".to_string()
                }
            )]
        );
        assert!(h.world.session(1).is_none());
    }

    #[test]
    fn test_identify_twice_rejected() {
        let mut h = Harness::new();
        h.join(1, 10);
        let out = h.join(1, 11);
        assert!(matches!(out[0].packet, Packet::IdentifyRejected { .. }));
        assert_eq!(h.world.session(1).unwrap().player_id, 10);
        assert_eq!(h.world.session_count(), 1);
    }

    #[test]
    fn test_identify_area_hint() {
        let mut h = Harness::new();
        let token = h.token(10);
        h.send(
            1,
            Packet::Identify {
                token,
                area: Some("beach".to_string()),
                collision: vec![Rect::new(0.0, 0.0, 5.0, 5.0)],
            },
        );
        let session = h.world.session(1).unwrap();
        assert_eq!(session.area, "beach");
        assert_eq!(session.collision.len(), 1);
    }

    #[test]
    fn test_requests_before_identify_are_dropped() {
        let mut h = Harness::new();
        assert!(h.send(1, Packet::MoveTo { x: 1.0, y: 1.0 }).is_empty());
        assert!(h
            .send(1, Packet::Chat { message: "hi".into() })
            .is_empty());
        assert!(h.send(1, Packet::Disconnect).is_empty());
    }

    #[test]
    fn test_move_rejected_inside_rectangle() {
        let mut h = Harness::new();
        let token = h.token(10);
        h.send(
            1,
            Packet::Identify {
                token,
                area: None,
                collision: vec![Rect::new(695.0, 380.0, 10.0, 10.0)],
            },
        );

        let out = h.send(1, Packet::MoveTo { x: 700.0, y: 385.0 });
        assert_eq!(
            out,
            vec![Outbound::direct(1, Packet::MoveRejected { x: 700.0, y: 385.0 })]
        );
        let session = h.world.session(1).unwrap();
        assert_eq!(session.position, HOME_SPAWN);
        assert!(session.destination.is_none());
        assert_eq!(session.motion, MotionState::Idle);
    }

    #[test]
    fn test_collision_stop_scenario() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);
        assert!(h.send(1, Packet::MoveTo { x: 700.0, y: 385.0 }).is_empty());

        // The area's geometry arrives after the walk was accepted
        h.world
            .registry
            .get_mut(1)
            .unwrap()
            .collision = vec![Rect::from_corners(
            Vector2::new(695.0, 380.0),
            Vector2::new(705.0, 390.0),
        )];

        let out = h.world.tick();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delivery, Delivery::Global);
        match &out[0].packet {
            Packet::PlayersMoved { moves, .. } => {
                assert_eq!(
                    moves,
                    &vec![PlayerMoved {
                        player_id: 10,
                        position: HOME_SPAWN,
                        direction: shared::Direction::South,
                        motion: MotionState::Idle,
                    }]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.world.tick().is_empty());
    }

    #[test]
    fn test_walk_produces_batches_until_arrival() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.send(1, Packet::MoveTo { x: 720.0, y: 385.0 });

        let mut batches = 0;
        for _ in 0..20 {
            if !h.world.tick().is_empty() {
                batches += 1;
            }
        }
        // Five 5-unit steps; at exactly 10 units out the walker still steps
        assert_eq!(batches, 6);
        let session = h.world.session(1).unwrap();
        assert_eq!(session.position, Vector2::new(720.0, 385.0));
        assert_eq!(session.motion, MotionState::Idle);
    }

    #[test]
    fn test_change_area() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);
        h.send(1, Packet::MoveTo { x: 800.0, y: 385.0 });

        let geometry = vec![Rect::new(1.0, 1.0, 1.0, 1.0)];
        let out = h.send(
            1,
            Packet::ChangeArea {
                area: "beach".to_string(),
                collision: geometry.clone(),
            },
        );

        let session = h.world.session(1).unwrap();
        assert_eq!(session.area, "beach");
        assert_eq!(session.collision, geometry);
        assert!(session.destination.is_none());
        assert_eq!(session.motion, MotionState::Idle);

        let old_area = Delivery::Area {
            area: "home".to_string(),
            except: Some(1),
        };
        assert_eq!(packets_for(&out, &old_area).len(), 1);
        assert_eq!(h.world.recipients(&old_area), vec![2]);
        let new_area = Delivery::Area {
            area: "beach".to_string(),
            except: None,
        };
        assert_eq!(h.world.recipients(&new_area), vec![1]);
    }

    #[test]
    fn test_equipment_update_echo_suppressed() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);
        let mut equipment = Equipment::new();
        equipment.set(EquipmentSlot::Hat, "hat_red");

        let out = h.send(
            1,
            Packet::EquipmentUpdate {
                equipment: equipment.clone(),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(h.world.recipients(&out[0].delivery), vec![2]);
        assert_eq!(h.world.session(1).unwrap().equipment, equipment);
    }

    #[test]
    fn test_identify_with_spawn_inside_geometry_rejected() {
        let mut h = Harness::new();
        let token = h.token(10);
        let out = h.send(
            1,
            Packet::Identify {
                token,
                area: None,
                collision: vec![Rect::new(680.0, 375.0, 20.0, 20.0)],
            },
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].packet, Packet::IdentifyRejected { .. }));
        assert!(h.world.session(1).is_none());
        assert!(h.world.session_by_player(10).is_none());
    }

    #[test]
    fn test_change_area_with_spawn_inside_geometry_refused() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);

        let out = h.send(
            1,
            Packet::ChangeArea {
                area: "beach".to_string(),
                collision: vec![Rect::new(680.0, 375.0, 20.0, 20.0)],
            },
        );
        assert!(out.is_empty());

        let session = h.world.session(1).unwrap();
        assert_eq!(session.area, "home");
        assert!(session.collision.is_empty());
        assert_eq!(
            h.world.recipients(&Delivery::Area {
                area: "home".to_string(),
                except: None,
            }),
            vec![1, 2]
        );
        assert!(h
            .world
            .recipients(&Delivery::Area {
                area: "beach".to_string(),
                except: None,
            })
            .is_empty());

        // Still free to walk in the old area
        assert!(h.send(1, Packet::MoveTo { x: 720.0, y: 385.0 }).is_empty());
        assert!(!h.world.tick().is_empty());
    }

    #[test]
    fn test_oversized_item_code_dropped() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);

        let mut equipment = Equipment::new();
        equipment.set(EquipmentSlot::Hat, "h".repeat(MAX_ITEM_CODE_LEN + 1));
        assert!(h.send(1, Packet::EquipmentUpdate { equipment }).is_empty());
        assert!(h.world.session(1).unwrap().equipment.is_empty());

        let mut equipment = Equipment::new();
        equipment.set(EquipmentSlot::Shoes, "");
        assert!(h.send(1, Packet::EquipmentUpdate { equipment }).is_empty());

        let mut equipment = Equipment::new();
        equipment.set(EquipmentSlot::Hat, "h".repeat(MAX_ITEM_CODE_LEN));
        assert_eq!(h.send(1, Packet::EquipmentUpdate { equipment }).len(), 1);
        assert_eq!(h.world.session(1).unwrap().equipment.len(), 1);
    }

    #[test]
    fn test_large_roster_is_split() {
        let mut h = Harness::new();
        for i in 1..=40 {
            h.join(i, i as PlayerId * 10);
        }

        let out = h.join(41, 410);
        let chunks: Vec<usize> = out
            .iter()
            .filter_map(|o| match &o.packet {
                Packet::CurrentPlayers { players, .. } => {
                    assert_eq!(o.delivery, Delivery::Direct(41));
                    Some(players.len())
                }
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![ROSTER_CHUNK_PLAYERS, 40 - ROSTER_CHUNK_PLAYERS]);
        assert!(matches!(out.last().unwrap().packet, Packet::PlayerJoined { .. }));
    }

    #[test]
    fn test_chat_is_global_and_trimmed() {
        let mut h = Harness::new();
        h.join(1, 10);
        let out = h.send(1, Packet::Chat { message: "  hello  ".into() });
        assert_eq!(out[0].delivery, Delivery::Global);
        assert!(matches!(&out[0].packet, Packet::ChatMessage { message, .. } if message == "hello"));

        assert!(h.send(1, Packet::Chat { message: "   ".into() }).is_empty());
    }

    #[test]
    fn test_trade_request_receiver_only_notified() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);

        let out = h.send(1, Packet::TradeRequest { receiver_id: 20 });
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delivery, Delivery::Direct(2));
        assert!(matches!(
            out[0].packet,
            Packet::TradeRequestReceived { initiator_id: 10, .. }
        ));
        assert!(h.world.session(1).unwrap().active_trade.is_some());
        assert!(h.world.session(2).unwrap().active_trade.is_some());
    }

    #[test]
    fn test_trade_request_refusals() {
        let mut h = Harness::new();
        h.join(1, 10);
        h.join(2, 20);
        h.join(3, 30);

        let out = h.send(1, Packet::TradeRequest { receiver_id: 99 });
        assert!(matches!(out[0].packet, Packet::TradeRequestFailed { .. }));
        let out = h.send(1, Packet::TradeRequest { receiver_id: 10 });
        assert!(matches!(out[0].packet, Packet::TradeRequestFailed { .. }));

        h.send(1, Packet::TradeRequest { receiver_id: 20 });
        let out = h.send(3, Packet::TradeRequest { receiver_id: 20 });
        assert!(matches!(&out[0].packet, Packet::TradeRequestFailed { reason, .. } if reason == "player is busy"));
        let out = h.send(1, Packet::TradeRequest { receiver_id: 30 });
        assert!(matches!(out[0].packet, Packet::TradeRequestFailed { .. }));
        assert_eq!(h.world.trade_count(), 1);
    }

    #[test]
    fn test_offer_update_resets_consent_and_notifies_both() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        h.lock_both(trade_id);
        h.send(1, Packet::TradeReadyUpdate { trade_id, ready: true });

        let out = h.send(
            2,
            Packet::TradeOfferUpdate {
                trade_id,
                offer: Offer {
                    coins: 5,
                    ..Offer::default()
                },
            },
        );
        assert_eq!(out.len(), 2);
        let trade = h.world.trade(trade_id).unwrap();
        assert!(!trade.initiator.locked && !trade.receiver.locked);
        assert!(!trade.initiator.ready && !trade.receiver.ready);
    }

    #[test]
    fn test_ready_while_unlocked_is_silent() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        h.send(1, Packet::TradeLockUpdate { trade_id, locked: true });

        let before = h.world.trade(trade_id).unwrap().snapshot();
        let out = h.send(1, Packet::TradeReadyUpdate { trade_id, ready: true });
        assert!(out.is_empty());
        assert_eq!(h.world.trade(trade_id).unwrap().snapshot(), before);
    }

    #[test]
    fn test_equipped_hat_trade_scenario() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        h.join(3, 30);

        let mut equipment = Equipment::new();
        equipment.set(EquipmentSlot::Hat, "hat_red");
        h.send(1, Packet::EquipmentUpdate { equipment });

        h.send(
            1,
            Packet::TradeOfferUpdate {
                trade_id,
                offer: Offer {
                    items: vec![OfferedItem {
                        inventory_id: 500,
                        item_id: 1,
                    }],
                    ..Offer::default()
                },
            },
        );
        h.send(
            2,
            Packet::TradeOfferUpdate {
                trade_id,
                offer: Offer {
                    coins: 100,
                    ..Offer::default()
                },
            },
        );
        h.lock_both(trade_id);
        h.send(1, Packet::TradeReadyUpdate { trade_id, ready: true });
        let out = h.send(2, Packet::TradeReadyUpdate { trade_id, ready: true });
        assert!(out.iter().all(|o| matches!(
            &o.packet,
            Packet::TradeStatusUpdated { trade } if trade.status == TradeStatus::Executing
        )));

        let tickets = h.world.take_executions();
        assert_eq!(tickets.len(), 1);
        assert_eq!(
            tickets[0].unequip[&10],
            vec![(EquipmentSlot::Hat, "hat_red".to_string())]
        );
        assert!(tickets[0].unequip[&20].is_empty());
        assert!(h.world.take_executions().is_empty());

        let out = h.world.finish_trade(trade_id, Ok(()));

        assert!(h.world.session(1).unwrap().equipment.get(EquipmentSlot::Hat).is_none());
        assert_eq!(
            packets_for(&out, &Delivery::Direct(1))[0],
            Packet::ItemsUnequipped {
                slots: vec![EquipmentSlot::Hat]
            }
        );
        let area_update = out
            .iter()
            .find(|o| matches!(o.packet, Packet::PlayerUpdate { player_id: 10, .. }))
            .unwrap();
        assert_eq!(h.world.recipients(&area_update.delivery), vec![1, 2, 3]);
        let completions = out
            .iter()
            .filter(|o| matches!(o.packet, Packet::TradeCompleted { .. }))
            .count();
        assert_eq!(completions, 2);

        assert!(h.world.trade(trade_id).is_none());
        assert!(h.world.session(1).unwrap().active_trade.is_none());
        assert!(h.world.session(2).unwrap().active_trade.is_none());

        // The trade is gone: late updates and results are no-ops
        assert!(h
            .send(1, Packet::TradeReadyUpdate { trade_id, ready: true })
            .is_empty());
        assert!(h.world.finish_trade(trade_id, Ok(())).is_empty());
    }

    #[test]
    fn test_execution_failure_notifies_both() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        h.lock_both(trade_id);
        h.send(1, Packet::TradeReadyUpdate { trade_id, ready: true });
        h.send(2, Packet::TradeReadyUpdate { trade_id, ready: true });

        let out = h.world.finish_trade(
            trade_id,
            Err(ServerError::ExecutionFailed("not enough coins".into())),
        );
        assert_eq!(out.len(), 2);
        for o in &out {
            match &o.packet {
                Packet::TradeStatusUpdated { trade } => {
                    assert_eq!(trade.status, TradeStatus::Failed);
                    assert_eq!(trade.message.as_deref(), Some("not enough coins"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(h.world.session(1).unwrap().active_trade.is_none());
        assert_eq!(h.world.trade_count(), 0);
    }

    #[test]
    fn test_disconnect_cancels_trade_with_single_notice() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();

        let out = h.send(1, Packet::Disconnect);
        assert!(h.world.session(1).is_none());
        assert!(h.world.trade(trade_id).is_none());
        assert!(h.world.session(2).unwrap().active_trade.is_none());

        let notices: Vec<&Outbound> = out
            .iter()
            .filter(|o| matches!(o.packet, Packet::TradeStatusUpdated { .. }))
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].delivery, Delivery::Direct(2));
        assert!(matches!(
            &notices[0].packet,
            Packet::TradeStatusUpdated { trade } if trade.status == TradeStatus::Cancelled
        ));

        let left = packets_for(
            &out,
            &Delivery::Area {
                area: "home".to_string(),
                except: None,
            },
        );
        assert_eq!(left, vec![Packet::PlayerDisconnected { player_id: 10 }]);

        // Second disconnect is a no-op
        assert!(h.world.disconnect(1).is_empty());
    }

    #[test]
    fn test_disconnect_during_execution_keeps_trade() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        h.lock_both(trade_id);
        h.send(1, Packet::TradeReadyUpdate { trade_id, ready: true });
        h.send(2, Packet::TradeReadyUpdate { trade_id, ready: true });

        h.world.disconnect(1);
        assert_eq!(
            h.world.trade(trade_id).unwrap().status,
            TradeStatus::Executing
        );

        let out = h.world.finish_trade(trade_id, Ok(()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].delivery, Delivery::Direct(2));
        assert!(h.world.session(2).unwrap().active_trade.is_none());
    }

    #[test]
    fn test_cancel_trade() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        let out = h.send(
            2,
            Packet::TradeCancel {
                trade_id,
                reason: Some("  changed my mind ".into()),
            },
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0].packet,
            Packet::TradeStatusUpdated { trade }
                if trade.status == TradeStatus::Cancelled
                    && trade.message.as_deref() == Some("changed my mind")
        ));
        assert!(h.world.session(1).unwrap().active_trade.is_none());
        assert!(h.world.session(2).unwrap().active_trade.is_none());
    }

    #[test]
    fn test_trade_chat() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();
        h.join(3, 30);

        let out = h.send(
            1,
            Packet::TradeChat {
                trade_id,
                message: " deal? ".into(),
            },
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0].packet,
            Packet::TradeChatMessage { sender_id: 10, message, .. } if message == "deal?"
        ));

        let outsider = h.send(
            3,
            Packet::TradeChat {
                trade_id,
                message: "hi".into(),
            },
        );
        assert!(outsider.is_empty());

        let oversized = h.send(
            2,
            Packet::TradeChat {
                trade_id,
                message: "x".repeat(101),
            },
        );
        assert!(oversized.is_empty());
    }

    #[test]
    fn test_idle_eviction_runs_disconnect_path() {
        let mut h = Harness::new();
        let trade_id = h.started_trade();

        h.clock.advance(Duration::from_secs(100));
        h.send(2, Packet::Chat { message: "still here".into() });
        h.clock.advance(Duration::from_secs(30));

        let (evicted, out) = h.world.evict_idle();
        assert_eq!(evicted, vec![1]);
        assert!(h.world.session(1).is_none());
        assert!(h.world.session(2).is_some());
        assert!(h.world.trade(trade_id).is_none());
        assert!(out
            .iter()
            .any(|o| matches!(o.packet, Packet::PlayerDisconnected { player_id: 10 })));
    }
}
