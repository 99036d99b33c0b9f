//! # Plaza Server Library
//!
//! Authoritative server for a multiplayer plaza: players identify with a
//! signed token, walk around areas with server-side collision, chat, and
//! trade items with each other through a consent protocol.
//!
//! ## Architecture
//!
//! ### Single-owner world
//! All session, area and trade state lives in [`world::World`], owned by the
//! main select loop in [`network::Server::run`]. Handlers run to completion
//! one at a time, so a disconnect and a trade update from the counterpart can
//! never interleave halfway.
//!
//! ### Tasks
//! - **Network receiver**: decodes datagrams and forwards them to the loop
//! - **Network sender**: encodes packets and writes them to client addresses
//! - **Trade execution**: one short-lived task per trade, calling the
//!   [`store::EntityStore`] and reporting the verdict back to the loop
//! - **Main loop**: packets, the 60 Hz movement tick and idle eviction
//!
//! ### Delivery
//! Handlers return packets tagged with a [`areas::Delivery`] target: one
//! connection, an area channel (optionally minus the sender) or everyone.
//! Targets are resolved against area membership at dispatch time.
//!
//! ## Modules
//!
//! - `registry`: live sessions indexed by connection and player
//! - `movement`: fixed-step walking and collision
//! - `areas`: area channel membership
//! - `trade`: the offer, lock, ready, execute state machine
//! - `world`: request handlers tying the above together
//! - `identity`: token verification
//! - `store`: item catalog, inventories and trade settlement
//! - `housekeeping`: idle session eviction
//! - `client_manager`: UDP address to connection mapping
//! - `network`: sockets, channels and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::clock::SystemClock;
//! use server::config::ServerConfig;
//! use server::identity::TokenVerifier;
//! use server::network::Server;
//! use server::store::InMemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         auth_secret: "change-me".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let identity = Arc::new(TokenVerifier::new(config.auth_secret.clone())?);
//!     let store = Arc::new(InMemoryStore::default());
//!
//!     let mut server = Server::new(config, identity, store, Arc::new(SystemClock::new())).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod areas;
pub mod client_manager;
pub mod clock;
pub mod config;
pub mod error;
pub mod housekeeping;
pub mod identity;
pub mod movement;
pub mod network;
pub mod registry;
pub mod store;
pub mod trade;
pub mod utils;
pub mod world;
