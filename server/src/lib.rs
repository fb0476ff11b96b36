//! # Realm session server
//!
//! The session and transport core of a multiplayer game server. It accepts
//! clients over TCP and WebSocket, negotiates an encrypted channel for each
//! connection, and dispatches their packets against a shared registry of
//! sessions. A fixed-rate tick loop drives the simulation and evicts idle
//! sessions. The operator console kicks, bans, mutes and announces while
//! all of that is running.
//!
//! ## Connection pipeline
//!
//! Every accepted socket gets its own task ([`connection`]):
//!
//! 1. WebSocket upgrade, for connections from the WebSocket listener
//! 2. Key exchange ([`handshake`]), bounded by the handshake timeout
//! 3. Slot allocation in the [`registry`], or a goodbye if the server is full
//! 4. The packet loop: decode, touch, [`dispatcher`], and flush the outbox
//!
//! No session is visible in the registry before step 2 succeeds.
//!
//! ## Shared state
//!
//! [`context::ServerContext`] ties together the registry, the database
//! collaborator, the broadcast queue and the simulation command channel.
//! The registry lock is held only for lookups and single-field updates,
//! never across I/O or database calls.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::database::MemoryDatabase;
//! use server::server::Server;
//! use server::world::World;
//! use shared::ServerIdentity;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let identity = ServerIdentity::load(&config.key_file)?;
//!     let database = Arc::new(MemoryDatabase::with_accounts(["alice"]));
//!
//!     let running = Server::start(&config, identity, database, Box::new(World::new())).await?;
//!     tokio::signal::ctrl_c().await?;
//!     running.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod connection;
pub mod console;
pub mod context;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod handshake;
pub mod listener;
pub mod registry;
pub mod server;
pub mod tick;
pub mod world;
