//! Entity store boundary: item catalog, inventories and atomic trade execution.
//!
//! The production backend lives outside this process. [`InMemoryStore`] is a
//! complete stand-in that can be seeded from a JSON fixture.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{EquipmentSlot, Offer, PlayerId, TradeId};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::Mutex;

use crate::error::{Result, ServerError};

/// One item definition from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub item_id: u32,
    /// Code rendered by clients and stored in equipment slots
    pub code: String,
    /// Item type name; wearable types match an equipment slot name
    pub item_type: String,
}

impl CatalogItem {
    /// Slot this item occupies when worn, if it is wearable at all.
    pub fn slot(&self) -> Option<EquipmentSlot> {
        self.item_type.parse().ok()
    }
}

/// Read-only item lookup loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: HashMap<u32, CatalogItem>,
}

impl ItemCatalog {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.item_id, item)).collect(),
        }
    }

    pub fn get(&self, item_id: u32) -> Option<&CatalogItem> {
        self.items.get(&item_id)
    }

    pub fn contains(&self, item_id: u32) -> bool {
        self.items.contains_key(&item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub inventory_id: u64,
    pub item_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub items: Vec<InventoryEntry>,
    #[serde(default)]
    pub coins: u64,
    #[serde(default)]
    pub gems: u64,
}

/// Everything the store needs to settle a trade
#[derive(Debug, Clone, PartialEq)]
pub struct TradeExecution {
    pub trade_id: TradeId,
    pub initiator_id: PlayerId,
    pub receiver_id: PlayerId,
    pub initiator_offer: Offer,
    pub receiver_offer: Offer,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn catalog(&self) -> Result<Vec<CatalogItem>>;

    async fn inventory(&self, player_id: PlayerId) -> Result<Inventory>;

    /// Transfers both offers atomically or not at all.
    ///
    /// A refusal is reported as `ServerError::ExecutionFailed` with a reason
    /// suitable for showing to both players.
    async fn execute_trade(&self, request: TradeExecution) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreFixture {
    #[serde(default)]
    pub catalog: Vec<CatalogItem>,
    #[serde(default)]
    pub inventories: HashMap<PlayerId, Inventory>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    catalog: Vec<CatalogItem>,
    inventories: Mutex<HashMap<PlayerId, Inventory>>,
}

impl InMemoryStore {
    pub fn new(catalog: Vec<CatalogItem>, inventories: HashMap<PlayerId, Inventory>) -> Self {
        Self {
            catalog,
            inventories: Mutex::new(inventories),
        }
    }

    pub fn from_fixture(fixture: StoreFixture) -> Self {
        Self::new(fixture.catalog, fixture.inventories)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let fixture: StoreFixture = serde_json::from_str(&data)?;
        info!(
            "Loaded store fixture {}: {} catalog items, {} inventories",
            path.display(),
            fixture.catalog.len(),
            fixture.inventories.len()
        );
        Ok(Self::from_fixture(fixture))
    }

    /// Checks that `offer` can be paid out of `inventory`.
    fn check_offer(owner: PlayerId, inventory: &Inventory, offer: &Offer) -> Result<()> {
        let owned: HashSet<(u64, u32)> = inventory
            .items
            .iter()
            .map(|entry| (entry.inventory_id, entry.item_id))
            .collect();

        for item in &offer.items {
            if !owned.contains(&(item.inventory_id, item.item_id)) {
                return Err(ServerError::ExecutionFailed(format!(
                    "player {} no longer owns item {}",
                    owner, item.inventory_id
                )));
            }
        }
        if inventory.coins < offer.coins {
            return Err(ServerError::ExecutionFailed(format!(
                "player {} does not have enough coins",
                owner
            )));
        }
        if inventory.gems < offer.gems {
            return Err(ServerError::ExecutionFailed(format!(
                "player {} does not have enough gems",
                owner
            )));
        }
        Ok(())
    }

    fn transfer(from: &mut Inventory, to: &mut Inventory, offer: &Offer) {
        let moving: HashSet<u64> = offer.items.iter().map(|item| item.inventory_id).collect();
        let (moved, kept): (Vec<InventoryEntry>, Vec<InventoryEntry>) = from
            .items
            .drain(..)
            .partition(|entry| moving.contains(&entry.inventory_id));
        from.items = kept;
        to.items.extend(moved);

        from.coins -= offer.coins;
        to.coins += offer.coins;
        from.gems -= offer.gems;
        to.gems += offer.gems;
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn catalog(&self) -> Result<Vec<CatalogItem>> {
        Ok(self.catalog.clone())
    }

    async fn inventory(&self, player_id: PlayerId) -> Result<Inventory> {
        let inventories = self.inventories.lock().await;
        Ok(inventories.get(&player_id).cloned().unwrap_or_default())
    }

    async fn execute_trade(&self, request: TradeExecution) -> Result<()> {
        let mut inventories = self.inventories.lock().await;

        let mut initiator = inventories
            .get(&request.initiator_id)
            .cloned()
            .unwrap_or_default();
        let mut receiver = inventories
            .get(&request.receiver_id)
            .cloned()
            .unwrap_or_default();

        Self::check_offer(request.initiator_id, &initiator, &request.initiator_offer)?;
        Self::check_offer(request.receiver_id, &receiver, &request.receiver_offer)?;

        Self::transfer(&mut initiator, &mut receiver, &request.initiator_offer);
        Self::transfer(&mut receiver, &mut initiator, &request.receiver_offer);

        inventories.insert(request.initiator_id, initiator);
        inventories.insert(request.receiver_id, receiver);
        debug!("Trade {} settled", request.trade_id);
        Ok(())
    }
}
