use serde::{Deserialize, Serialize};

use crate::{PlayerId, TradeId};

/// A reference to one inventory entry offered in a trade.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfferedItem {
    /// Row id of the entry in the owner's inventory.
    pub inventory_id: u64,
    /// Catalog id of the item held by that entry.
    pub item_id: u32,
}

/// One party's side of a trade.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Offer {
    pub items: Vec<OfferedItem>,
    pub coins: u64,
    pub gems: u64,
}

impl Offer {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.coins == 0 && self.gems == 0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Pending,
    Started,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Completed | TradeStatus::Failed | TradeStatus::Cancelled
        )
    }
}

/// Full view of a trade as sent to both participants.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TradeSnapshot {
    pub trade_id: TradeId,
    pub initiator_id: PlayerId,
    pub initiator_name: String,
    pub receiver_id: PlayerId,
    pub receiver_name: String,
    pub initiator_offer: Offer,
    pub receiver_offer: Offer,
    pub initiator_locked: bool,
    pub receiver_locked: bool,
    pub initiator_ready: bool,
    pub receiver_ready: bool,
    pub status: TradeStatus,
    /// Cancellation or failure reason, when there is one.
    pub message: Option<String>,
}
