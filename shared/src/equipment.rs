use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Wearable slots. Every catalog item type maps to exactly one slot.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentSlot {
    Hair,
    Top,
    Pants,
    Gloves,
    Hat,
    Face,
    Necklace,
    Halo,
    Shoes,
    Accessory,
}

impl EquipmentSlot {
    pub const ALL: [EquipmentSlot; 10] = [
        EquipmentSlot::Hair,
        EquipmentSlot::Top,
        EquipmentSlot::Pants,
        EquipmentSlot::Gloves,
        EquipmentSlot::Hat,
        EquipmentSlot::Face,
        EquipmentSlot::Necklace,
        EquipmentSlot::Halo,
        EquipmentSlot::Shoes,
        EquipmentSlot::Accessory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentSlot::Hair => "hair",
            EquipmentSlot::Top => "top",
            EquipmentSlot::Pants => "pants",
            EquipmentSlot::Gloves => "gloves",
            EquipmentSlot::Hat => "hat",
            EquipmentSlot::Face => "face",
            EquipmentSlot::Necklace => "necklace",
            EquipmentSlot::Halo => "halo",
            EquipmentSlot::Shoes => "shoes",
            EquipmentSlot::Accessory => "accessory",
        }
    }
}

impl fmt::Display for EquipmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquipmentSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EquipmentSlot::ALL
            .iter()
            .copied()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| format!("unknown equipment slot '{}'", s))
    }
}

/// What a player is wearing: slot -> item code.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Equipment {
    slots: BTreeMap<EquipmentSlot, String>,
}

impl Equipment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: EquipmentSlot) -> Option<&str> {
        self.slots.get(&slot).map(String::as_str)
    }

    pub fn set(&mut self, slot: EquipmentSlot, code: impl Into<String>) {
        self.slots.insert(slot, code.into());
    }

    pub fn clear(&mut self, slot: EquipmentSlot) -> Option<String> {
        self.slots.remove(&slot)
    }

    /// True if `slot` currently holds exactly `code`.
    pub fn is_wearing(&self, slot: EquipmentSlot, code: &str) -> bool {
        self.get(slot) == Some(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EquipmentSlot, &str)> {
        self.slots.iter().map(|(slot, code)| (*slot, code.as_str()))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
