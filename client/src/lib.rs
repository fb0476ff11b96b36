//! # Realm protocol client
//!
//! A headless client for the session server. It connects over either
//! transport, performs the key exchange (optionally pinning the server's
//! public key) and then speaks the encrypted packet protocol.
//!
//! The integration tests drive servers through it, and the `client` binary
//! uses it as an operator smoke-test tool.
//!
//! ```rust,no_run
//! use client::network::{ConnectOptions, GameClient};
//! use shared::TransportKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client =
//!         GameClient::connect("127.0.0.1:5400", TransportKind::Stream, ConnectOptions::default())
//!             .await?;
//!     client.login("alice").await?;
//!     client.select_character("Alice").await?;
//!     println!("Round trip: {:?}", client.heartbeat().await?);
//!     client.logout().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod handshake;
pub mod network;

pub use error::ClientError;
pub use network::{ConnectOptions, GameClient, LoginInfo};
