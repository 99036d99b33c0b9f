//! Wire protocol and plain data types shared between the Plaza server and its clients.
//!
//! Everything in this crate is transport-agnostic: the server serializes
//! [`Packet`] values with bincode, one packet per datagram.

use serde::{Deserialize, Serialize};

pub mod equipment;
pub mod trade;

pub use equipment::{Equipment, EquipmentSlot};
pub use trade::{Offer, OfferedItem, TradeSnapshot, TradeStatus};

pub type PlayerId = u64;
pub type TradeId = u32;

/// Movement ticks per second.
pub const TICK_RATE: u32 = 60;
/// Walking speed in world units per second.
pub const WALK_SPEED: f64 = 300.0;
/// A walker closer than this to its destination snaps onto it.
pub const SNAP_THRESHOLD: f64 = 10.0;

pub const HOME_AREA: &str = "home";
pub const HOME_SPAWN: Vector2 = Vector2 { x: 690.0, y: 385.0 };

pub const CHAT_MAX_CHARS: usize = 200;
pub const TRADE_CHAT_MAX_CHARS: usize = 100;
pub const MAX_OFFER_ITEMS: usize = 24;
pub const MAX_COLLISION_RECTS: usize = 1024;
pub const MAX_AREA_ID_LEN: usize = 64;
/// Longest item code accepted in an equipment slot, in bytes.
pub const MAX_ITEM_CODE_LEN: usize = 64;
/// Players per `CurrentPlayers` datagram; larger rosters are split.
pub const ROSTER_CHUNK_PLAYERS: usize = 32;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    Identify {
        token: String,
        area: Option<String>,
        collision: Vec<Rect>,
    },
    MoveTo {
        x: f64,
        y: f64,
    },
    ChangeArea {
        area: String,
        collision: Vec<Rect>,
    },
    EquipmentUpdate {
        equipment: Equipment,
    },
    Chat {
        message: String,
    },
    TradeRequest {
        receiver_id: PlayerId,
    },
    TradeAccept {
        trade_id: TradeId,
    },
    TradeOfferUpdate {
        trade_id: TradeId,
        offer: Offer,
    },
    TradeLockUpdate {
        trade_id: TradeId,
        locked: bool,
    },
    TradeReadyUpdate {
        trade_id: TradeId,
        ready: bool,
    },
    TradeCancel {
        trade_id: TradeId,
        reason: Option<String>,
    },
    TradeChat {
        trade_id: TradeId,
        message: String,
    },
    Disconnect,

    // Server -> client
    IdentifyOk {
        player: PlayerInfo,
    },
    IdentifyRejected {
        reason: String,
    },
    CurrentPlayers {
        area: String,
        players: Vec<PlayerInfo>,
    },
    PlayerJoined {
        player: PlayerInfo,
    },
    PlayerDisconnected {
        player_id: PlayerId,
    },
    PlayersMoved {
        tick: u64,
        moves: Vec<PlayerMoved>,
    },
    MoveRejected {
        x: f64,
        y: f64,
    },
    PlayerAreaChanged {
        player_id: PlayerId,
        from: String,
        to: String,
        position: Vector2,
    },
    ChatMessage {
        player_id: PlayerId,
        username: String,
        area: String,
        message: String,
        timestamp: u64,
    },
    TradeRequestReceived {
        trade_id: TradeId,
        initiator_id: PlayerId,
        initiator_name: String,
    },
    TradeRequestFailed {
        receiver_id: PlayerId,
        reason: String,
    },
    TradeStatusUpdated {
        trade: TradeSnapshot,
    },
    ItemsUnequipped {
        slots: Vec<EquipmentSlot>,
    },
    PlayerUpdate {
        player_id: PlayerId,
        equipment: Equipment,
    },
    TradeCompleted {
        trade: TradeSnapshot,
    },
    TradeChatMessage {
        trade_id: TradeId,
        sender_id: PlayerId,
        sender_name: String,
        message: String,
        timestamp: u64,
    },
    Disconnected {
        reason: String,
    },
}

/// A point or displacement in world space. +x is east, +y is south.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vector2 {
    pub x: f64,
    pub y: f64,
}

impl Vector2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn sub(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub fn add(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    pub fn scale(&self, scalar: f64) -> Vector2 {
        Vector2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    pub fn distance_to(&self, other: &Vector2) -> f64 {
        other.sub(self).magnitude()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned collision rectangle anchored at its top-left corner.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a rectangle from two opposite corners.
    pub fn from_corners(a: Vector2, b: Vector2) -> Self {
        let x = a.x.min(b.x);
        let y = a.y.min(b.y);
        Self {
            x,
            y,
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    /// Point-in-rectangle test with inclusive bounds.
    pub fn contains(&self, point: &Vector2) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width >= 0.0
            && self.height >= 0.0
    }
}

/// Returns the first rectangle containing `point`, in geometry order.
pub fn first_collision<'a>(geometry: &'a [Rect], point: &Vector2) -> Option<&'a Rect> {
    geometry.iter().find(|rect| rect.contains(point))
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    North,
    #[default]
    South,
    East,
    West,
}

impl Direction {
    /// Facing for a displacement: the dominant axis wins, ties go vertical.
    pub fn from_delta(dx: f64, dy: f64) -> Self {
        if dx.abs() > dy.abs() {
            if dx > 0.0 {
                Direction::East
            } else {
                Direction::West
            }
        } else if dy < 0.0 {
            Direction::North
        } else {
            Direction::South
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Idle,
    Walking,
}

/// Public view of a connected player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub username: String,
    pub area: String,
    pub position: Vector2,
    pub direction: Direction,
    pub motion: MotionState,
    pub equipment: Equipment,
}

/// One authoritative position delta inside a `PlayersMoved` batch.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PlayerMoved {
    pub player_id: PlayerId,
    pub position: Vector2,
    pub direction: Direction,
    pub motion: MotionState,
}
