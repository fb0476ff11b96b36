use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use client::{ClientError, ConnectOptions, GameClient};
use log::{info, warn};
use shared::crypto::KEY_LEN;
use shared::{Packet, TransportKind};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:5400")]
    server: String,

    /// Connect over WebSocket instead of TCP
    #[arg(short = 'w', long)]
    websocket: bool,

    /// Base64 public key the server must present
    #[arg(short = 'k', long)]
    server_key: Option<String>,

    /// Account to log in with
    #[arg(short = 'a', long)]
    account: Option<String>,

    /// Character to play (requires --account)
    #[arg(short = 'c', long)]
    character: Option<String>,

    /// Chat message to send once in game
    #[arg(short = 'm', long)]
    message: Option<String>,

    /// Seconds to stay connected printing server messages
    #[arg(short = 'd', long, default_value = "5")]
    duration: u64,
}

fn decode_key(text: &str) -> Result<[u8; KEY_LEN], ClientError> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| ClientError::InvalidServerKey(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| {
            ClientError::InvalidServerKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let kind = if args.websocket {
        TransportKind::WebSocket
    } else {
        TransportKind::Stream
    };
    let options = ConnectOptions {
        pinned_key: args.server_key.as_deref().map(decode_key).transpose()?,
        ..ConnectOptions::default()
    };

    let mut client = GameClient::connect(&args.server, kind, options).await?;
    info!("Server key {}", STANDARD.encode(client.server_key()));
    info!("Round trip {:?}", client.heartbeat().await?);

    if let Some(account) = &args.account {
        let login = client.login(account).await?;
        info!(
            "Logged in as {} (power {}, muted {})",
            account, login.power, login.muted
        );

        if let Some(character) = &args.character {
            let name = client.select_character(character).await?;
            info!("Playing {}", name);

            if let Some(message) = &args.message {
                client
                    .send(&Packet::Chat {
                        message: message.clone(),
                    })
                    .await?;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match client.recv_timeout(remaining).await {
            Ok(Packet::ChatMessage { sender, message }) => println!("[{}] {}", sender, message),
            Ok(Packet::GlobalMessage { message }) => println!("[Global] {}", message),
            Ok(Packet::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
                return Ok(());
            }
            Ok(other) => info!("Received {:?}", other.code()),
            Err(ClientError::Timeout(_)) => break,
            Err(e) => return Err(e.into()),
        }
    }

    let reason = client.logout().await?;
    info!("Server said goodbye: {}", reason);
    Ok(())
}
