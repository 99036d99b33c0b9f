//! Two-party trade negotiation.
//!
//! A trade moves through `Pending -> Started -> Executing` and ends in
//! `Completed`, `Failed` or `Cancelled`. Consent is gated twice:
//! - each party locks their offer, and
//! - once both are locked, each party marks itself ready.
//!
//! Any offer change clears every lock and ready flag, so consent given to an
//! older offer never carries over. Ready requests while either side is
//! unlocked are ignored without an error reaching the client. When both sides
//! are ready the trade enters `Executing` exactly once and an
//! [`ExecutionTicket`] is handed out for the entity store to settle.
//!
//! Terminal trades are removed from the book immediately and their ids are
//! never reused.

use log::{debug, info};
use shared::{
    Equipment, EquipmentSlot, Offer, PlayerId, TradeId, TradeSnapshot, TradeStatus,
    MAX_OFFER_ITEMS,
};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, ServerError};
use crate::store::{ItemCatalog, TradeExecution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Receiver,
}

/// One participant's half of a trade
#[derive(Debug, Clone)]
pub struct Party {
    pub player_id: PlayerId,
    pub name: String,
    pub offer: Offer,
    pub locked: bool,
    pub ready: bool,
}

impl Party {
    fn new(player_id: PlayerId, name: String) -> Self {
        Self {
            player_id,
            name,
            offer: Offer::default(),
            locked: false,
            ready: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub id: TradeId,
    pub initiator: Party,
    pub receiver: Party,
    pub status: TradeStatus,
    /// Reason attached to a cancellation or failure
    pub message: Option<String>,
}

impl Trade {
    pub fn side_of(&self, player_id: PlayerId) -> Option<Side> {
        if self.initiator.player_id == player_id {
            Some(Side::Initiator)
        } else if self.receiver.player_id == player_id {
            Some(Side::Receiver)
        } else {
            None
        }
    }

    pub fn party(&self, side: Side) -> &Party {
        match side {
            Side::Initiator => &self.initiator,
            Side::Receiver => &self.receiver,
        }
    }

    fn party_mut(&mut self, side: Side) -> &mut Party {
        match side {
            Side::Initiator => &mut self.initiator,
            Side::Receiver => &mut self.receiver,
        }
    }

    pub fn participants(&self) -> [PlayerId; 2] {
        [self.initiator.player_id, self.receiver.player_id]
    }

    pub fn counterpart(&self, player_id: PlayerId) -> Option<PlayerId> {
        match self.side_of(player_id)? {
            Side::Initiator => Some(self.receiver.player_id),
            Side::Receiver => Some(self.initiator.player_id),
        }
    }

    pub fn both_locked(&self) -> bool {
        self.initiator.locked && self.receiver.locked
    }

    pub fn both_ready(&self) -> bool {
        self.initiator.ready && self.receiver.ready
    }

    fn clear_consent(&mut self) {
        for party in [&mut self.initiator, &mut self.receiver] {
            party.locked = false;
            party.ready = false;
        }
    }

    pub fn snapshot(&self) -> TradeSnapshot {
        TradeSnapshot {
            trade_id: self.id,
            initiator_id: self.initiator.player_id,
            initiator_name: self.initiator.name.clone(),
            receiver_id: self.receiver.player_id,
            receiver_name: self.receiver.name.clone(),
            initiator_offer: self.initiator.offer.clone(),
            receiver_offer: self.receiver.offer.clone(),
            initiator_locked: self.initiator.locked,
            receiver_locked: self.receiver.locked,
            initiator_ready: self.initiator.ready,
            receiver_ready: self.receiver.ready,
            status: self.status,
            message: self.message.clone(),
        }
    }
}

/// Issued once, when a trade enters `Executing`
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTicket {
    pub trade_id: TradeId,
    pub initiator_id: PlayerId,
    pub receiver_id: PlayerId,
    pub initiator_offer: Offer,
    pub receiver_offer: Offer,
    /// Slots each participant must vacate when the trade succeeds
    pub unequip: HashMap<PlayerId, Vec<(EquipmentSlot, String)>>,
}

impl ExecutionTicket {
    pub fn request(&self) -> TradeExecution {
        TradeExecution {
            trade_id: self.trade_id,
            initiator_id: self.initiator_id,
            receiver_id: self.receiver_id,
            initiator_offer: self.initiator_offer.clone(),
            receiver_offer: self.receiver_offer.clone(),
        }
    }
}

/// Offered items that the owner is currently wearing, with their slots.
pub fn equipped_items(
    offer: &Offer,
    equipment: &Equipment,
    catalog: &ItemCatalog,
) -> Vec<(EquipmentSlot, String)> {
    let mut worn = Vec::new();
    for item in &offer.items {
        let Some(entry) = catalog.get(item.item_id) else {
            continue;
        };
        let Some(slot) = entry.slot() else {
            continue;
        };
        if equipment.is_wearing(slot, &entry.code)
            && !worn.iter().any(|(taken, _)| *taken == slot)
        {
            worn.push((slot, entry.code.clone()));
        }
    }
    worn
}

/// The live set of trades
#[derive(Debug)]
pub struct TradeBook {
    trades: HashMap<TradeId, Trade>,
    next_id: TradeId,
}

impl Default for TradeBook {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeBook {
    pub fn new() -> Self {
        Self {
            trades: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, trade_id: TradeId) -> Option<&Trade> {
        self.trades.get(&trade_id)
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Looks up a trade the actor takes part in.
    fn participant_trade(
        &mut self,
        actor: PlayerId,
        trade_id: TradeId,
    ) -> Result<(&mut Trade, Side)> {
        let trade = self
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| ServerError::NotFound(format!("trade {}", trade_id)))?;
        let side = trade.side_of(actor).ok_or_else(|| {
            ServerError::InvalidRequest(format!(
                "player {} is not part of trade {}",
                actor, trade_id
            ))
        })?;
        Ok((trade, side))
    }

    /// Opens a pending trade. Callers check that both players are online and free.
    pub fn open(
        &mut self,
        initiator: (PlayerId, String),
        receiver: (PlayerId, String),
    ) -> Result<&Trade> {
        if initiator.0 == receiver.0 {
            return Err(ServerError::InvalidRequest(
                "cannot trade with yourself".into(),
            ));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let trade = Trade {
            id,
            initiator: Party::new(initiator.0, initiator.1),
            receiver: Party::new(receiver.0, receiver.1),
            status: TradeStatus::Pending,
            message: None,
        };
        info!(
            "Trade {} opened: {} -> {}",
            id, trade.initiator.player_id, trade.receiver.player_id
        );
        Ok(self.trades.entry(id).or_insert(trade))
    }

    pub fn accept(&mut self, actor: PlayerId, trade_id: TradeId) -> Result<&Trade> {
        let (trade, side) = self.participant_trade(actor, trade_id)?;
        if side != Side::Receiver {
            return Err(ServerError::InvalidRequest(
                "only the receiver can accept".into(),
            ));
        }
        if trade.status != TradeStatus::Pending {
            return Err(ServerError::PreconditionFailed(format!(
                "trade {} is {:?}",
                trade_id, trade.status
            )));
        }
        trade.status = TradeStatus::Started;
        info!("Trade {} started", trade_id);
        Ok(trade)
    }

    /// Replaces the actor's offer and clears all consent.
    pub fn update_offer(
        &mut self,
        actor: PlayerId,
        trade_id: TradeId,
        offer: Offer,
        catalog: &ItemCatalog,
    ) -> Result<&Trade> {
        validate_offer(&offer, catalog)?;

        let (trade, side) = self.participant_trade(actor, trade_id)?;
        if trade.status != TradeStatus::Started {
            return Err(ServerError::PreconditionFailed(format!(
                "offer update on {:?} trade {}",
                trade.status, trade_id
            )));
        }
        trade.party_mut(side).offer = offer;
        trade.clear_consent();
        debug!("Trade {}: player {} updated offer", trade_id, actor);
        Ok(trade)
    }

    /// Sets or clears the actor's lock. Unlocking also withdraws readiness.
    pub fn update_lock(
        &mut self,
        actor: PlayerId,
        trade_id: TradeId,
        locked: bool,
    ) -> Result<&Trade> {
        let (trade, side) = self.participant_trade(actor, trade_id)?;
        if trade.status != TradeStatus::Started {
            return Err(ServerError::PreconditionFailed(format!(
                "lock update on {:?} trade {}",
                trade.status, trade_id
            )));
        }
        let party = trade.party_mut(side);
        party.locked = locked;
        if !locked {
            party.ready = false;
        }
        debug!("Trade {}: player {} locked={}", trade_id, actor, locked);
        Ok(trade)
    }

    /// Sets the actor's ready flag, if both sides are locked
    ///
    /// Returns the execution ticket when this update made both sides ready.
    /// The caller fills in the unequip plan.
    pub fn update_ready(
        &mut self,
        actor: PlayerId,
        trade_id: TradeId,
        ready: bool,
    ) -> Result<Option<ExecutionTicket>> {
        let (trade, side) = self.participant_trade(actor, trade_id)?;
        if trade.status != TradeStatus::Started {
            return Err(ServerError::PreconditionFailed(format!(
                "ready update on {:?} trade {}",
                trade.status, trade_id
            )));
        }
        if !trade.both_locked() {
            return Err(ServerError::PreconditionFailed(
                "ready requires both offers locked".into(),
            ));
        }

        trade.party_mut(side).ready = ready;
        if !trade.both_ready() {
            return Ok(None);
        }

        trade.status = TradeStatus::Executing;
        info!("Trade {} executing", trade_id);
        Ok(Some(ExecutionTicket {
            trade_id,
            initiator_id: trade.initiator.player_id,
            receiver_id: trade.receiver.player_id,
            initiator_offer: trade.initiator.offer.clone(),
            receiver_offer: trade.receiver.offer.clone(),
            unequip: HashMap::new(),
        }))
    }

    /// Cancels on request of a participant. Executing trades cannot be cancelled.
    pub fn cancel(
        &mut self,
        actor: PlayerId,
        trade_id: TradeId,
        reason: Option<String>,
    ) -> Result<Trade> {
        let (trade, _) = self.participant_trade(actor, trade_id)?;
        if trade.status == TradeStatus::Executing || trade.status.is_terminal() {
            return Err(ServerError::PreconditionFailed(format!(
                "cannot cancel {:?} trade {}",
                trade.status, trade_id
            )));
        }
        self.close(trade_id, TradeStatus::Cancelled, reason)
            .ok_or_else(|| ServerError::NotFound(format!("trade {}", trade_id)))
    }

    /// Cancels because a participant went away. Leaves executing trades alone.
    pub fn abandon(&mut self, trade_id: TradeId, reason: &str) -> Option<Trade> {
        match self.trades.get(&trade_id) {
            Some(trade) if trade.status != TradeStatus::Executing => {
                self.close(trade_id, TradeStatus::Cancelled, Some(reason.to_string()))
            }
            _ => None,
        }
    }

    /// Applies the store's verdict to an executing trade. Later calls are no-ops.
    pub fn finish(
        &mut self,
        trade_id: TradeId,
        outcome: std::result::Result<(), String>,
    ) -> Option<Trade> {
        match self.trades.get(&trade_id) {
            Some(trade) if trade.status == TradeStatus::Executing => {}
            _ => return None,
        }
        match outcome {
            Ok(()) => self.close(trade_id, TradeStatus::Completed, None),
            Err(reason) => self.close(trade_id, TradeStatus::Failed, Some(reason)),
        }
    }

    fn close(
        &mut self,
        trade_id: TradeId,
        status: TradeStatus,
        message: Option<String>,
    ) -> Option<Trade> {
        let mut trade = self.trades.remove(&trade_id)?;
        trade.status = status;
        trade.message = message;
        info!(
            "Trade {} closed as {:?}{}",
            trade_id,
            status,
            trade
                .message
                .as_deref()
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        );
        Some(trade)
    }

    /// Participants of a trade the actor takes part in, for trade chat.
    pub fn chat_participants(&self, actor: PlayerId, trade_id: TradeId) -> Option<[PlayerId; 2]> {
        let trade = self.trades.get(&trade_id)?;
        trade.side_of(actor)?;
        Some(trade.participants())
    }
}

fn validate_offer(offer: &Offer, catalog: &ItemCatalog) -> Result<()> {
    if offer.items.len() > MAX_OFFER_ITEMS {
        return Err(ServerError::InvalidRequest(format!(
            "offer has {} items, limit is {}",
            offer.items.len(),
            MAX_OFFER_ITEMS
        )));
    }
    let mut seen = HashSet::new();
    for item in &offer.items {
        if !seen.insert(item.inventory_id) {
            return Err(ServerError::InvalidRequest(format!(
                "inventory entry {} offered twice",
                item.inventory_id
            )));
        }
        if !catalog.contains(item.item_id) {
            return Err(ServerError::InvalidRequest(format!(
                "unknown item {}",
                item.item_id
            )));
        }
    }
    Ok(())
}
