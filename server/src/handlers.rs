//! Default packet handlers.
//!
//! A session starts anonymous. `Login` attaches an account, `CharacterSelect`
//! attaches a character, and only then are chat and game data accepted.
//! Packets that skip a step are protocol violations and close the
//! connection.

use crate::database::Database;
use crate::dispatcher::{Dispatcher, Flow, HandlerContext};
use crate::error::{DatabaseError, DispatchError, HandlerError};
use crate::registry::{Claim, ClientSession};
use crate::world::WorldCommand;
use log::{error, info};
use shared::{Packet, PacketCode};
use std::net::IpAddr;

/// Sender name used for notices that come from the server itself.
pub const SERVER_SENDER: &str = "Server";

/// Dispatcher with every client-bound packet handled.
pub fn default_dispatcher() -> Result<Dispatcher, DispatchError> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(PacketCode::Heartbeat, heartbeat)?;
    dispatcher.register(PacketCode::Login, login)?;
    dispatcher.register(PacketCode::CharacterSelect, character_select)?;
    dispatcher.register(PacketCode::Chat, chat)?;
    dispatcher.register(PacketCode::Binary, binary)?;
    dispatcher.register(PacketCode::Logout, logout)?;
    Ok(dispatcher)
}

fn logged_in(ctx: &HandlerContext<'_>, code: PacketCode) -> Result<ClientSession, HandlerError> {
    let session = ctx.session()?;
    if session.account.is_none() {
        return Err(HandlerError::NotLoggedIn(code));
    }
    Ok(session)
}

fn in_game(ctx: &HandlerContext<'_>, code: PacketCode) -> Result<ClientSession, HandlerError> {
    let session = logged_in(ctx, code)?;
    if session.entity.is_none() {
        return Err(HandlerError::NoCharacter(code));
    }
    Ok(session)
}

fn heartbeat(ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError> {
    if let Packet::Heartbeat { timestamp } = packet {
        ctx.reply(Packet::HeartbeatAck { timestamp });
    }
    Ok(Flow::Continue)
}

/// Reply to a login the database could not answer. The client may retry.
pub const LOGIN_UNAVAILABLE: &str = "Login is unavailable, try again later";

/// What the database says about an account at login.
enum Standing {
    Unknown,
    Banned(String),
    Allowed {
        power: i32,
        mute_reason: Option<String>,
    },
}

fn standing(
    database: &dyn Database,
    account: &str,
    ip: Option<IpAddr>,
) -> Result<Standing, DatabaseError> {
    if !database.account_exists(account)? {
        return Ok(Standing::Unknown);
    }
    if let Some(reason) = database.check_ban(account, ip)? {
        return Ok(Standing::Banned(reason));
    }
    Ok(Standing::Allowed {
        power: database.player_power(account)?,
        mute_reason: database.check_mute(account, ip)?,
    })
}

fn login(ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError> {
    let Packet::Login { account } = packet else {
        return Ok(Flow::Continue);
    };
    if ctx.session()?.account.is_some() {
        return Err(HandlerError::AlreadyLoggedIn);
    }

    // A database fault is the server's, not the client's.
    let ip = Some(ctx.addr.ip());
    let (power, mute_reason) = match standing(ctx.server.database.as_ref(), &account, ip) {
        Ok(Standing::Allowed { power, mute_reason }) => (power, mute_reason),
        Ok(Standing::Unknown) => {
            ctx.reply(Packet::LoginRejected {
                reason: format!("Account {} does not exist", account),
            });
            return Ok(Flow::Continue);
        }
        Ok(Standing::Banned(reason)) => {
            info!("Banned account {} refused from {}", account, ctx.addr);
            ctx.reply(Packet::LoginRejected {
                reason: format!("Banned: {}", reason),
            });
            return Ok(Flow::Close("Account is banned".into()));
        }
        Err(e) => {
            error!("Login of {} from {} failed: {}", account, ctx.addr, e);
            ctx.reply(Packet::LoginRejected {
                reason: LOGIN_UNAVAILABLE.into(),
            });
            return Ok(Flow::Continue);
        }
    };

    match ctx.server.registry.claim_account(ctx.slot, ctx.connection_id, &account) {
        Claim::Claimed => {}
        Claim::Taken => {
            ctx.reply(Packet::LoginRejected {
                reason: "Account is already online".into(),
            });
            return Ok(Flow::Continue);
        }
        Claim::Gone => return Err(HandlerError::SessionGone(ctx.slot)),
    }

    let muted = mute_reason.is_some();
    ctx.update(|session| {
        session.power = power;
        session.muted = muted;
        session.mute_reason = mute_reason;
    })?;

    info!("Slot {} logged in as {}", ctx.slot, account);
    ctx.reply(Packet::LoginAccepted { power, muted });
    Ok(Flow::Continue)
}

fn character_select(ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError> {
    let Packet::CharacterSelect { name } = packet else {
        return Ok(Flow::Continue);
    };
    let session = logged_in(ctx, PacketCode::CharacterSelect)?;

    match ctx.server.registry.claim_character(ctx.slot, ctx.connection_id, &name) {
        Claim::Claimed => {}
        Claim::Taken => {
            ctx.reply(Packet::LoginRejected {
                reason: format!("{} is already in the game", name),
            });
            return Ok(Flow::Continue);
        }
        Claim::Gone => return Err(HandlerError::SessionGone(ctx.slot)),
    }

    if session.entity.is_some() {
        ctx.server
            .send_world(WorldCommand::EntityLeft { slot: ctx.slot });
    }
    ctx.server.send_world(WorldCommand::EntityJoined {
        slot: ctx.slot,
        name: name.clone(),
        power: session.power,
    });

    ctx.reply(Packet::CharacterLoaded { name });
    Ok(Flow::Continue)
}

fn chat(ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError> {
    let Packet::Chat { message } = packet else {
        return Ok(Flow::Continue);
    };
    let session = in_game(ctx, PacketCode::Chat)?;

    if session.muted {
        let reason = session.mute_reason.unwrap_or_default();
        ctx.reply(Packet::ChatMessage {
            sender: SERVER_SENDER.into(),
            message: format!("You are muted: {}", reason),
        });
        return Ok(Flow::Continue);
    }

    let sender = session
        .character_name()
        .unwrap_or_default()
        .to_string();
    ctx.server
        .queue_broadcast(Packet::ChatMessage { sender, message }, None);
    Ok(Flow::Continue)
}

fn binary(ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError> {
    let Packet::Binary(data) = packet else {
        return Ok(Flow::Continue);
    };
    in_game(ctx, PacketCode::Binary)?;

    ctx.server.send_world(WorldCommand::ClientData {
        slot: ctx.slot,
        data,
    });
    Ok(Flow::Continue)
}

fn logout(_ctx: &HandlerContext<'_>, _packet: Packet) -> Result<Flow, HandlerError> {
    Ok(Flow::Close("Logged out".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ServerContext, TickInputs};
    use crate::database::{MemoryDatabase, Sanction, UnavailableDatabase};
    use crate::registry::{
        next_connection_id, ConnectionId, NewSession, Outbound, SessionHandle, SessionMailbox,
        SlotId,
    };
    use shared::TransportKind;
    use std::net::SocketAddr;
    use std::sync::Arc;

    struct Harness {
        server: Arc<ServerContext>,
        inputs: TickInputs,
        db: Arc<MemoryDatabase>,
        dispatcher: Dispatcher,
    }

    struct Client {
        slot: SlotId,
        connection_id: ConnectionId,
        addr: SocketAddr,
        handle: SessionHandle,
        mailbox: SessionMailbox,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(MemoryDatabase::with_accounts(["alice", "bob"]));
            let (server, inputs) = ServerContext::new(4, Arc::clone(&db) as Arc<dyn Database>);
            Self {
                server,
                inputs,
                db,
                dispatcher: default_dispatcher().unwrap(),
            }
        }

        fn connect(&self, addr: &str) -> Client {
            let (handle, mailbox) = SessionHandle::new();
            let connection_id = next_connection_id();
            let addr: SocketAddr = addr.parse().unwrap();
            let slot = self
                .server
                .registry
                .allocate(NewSession {
                    connection_id,
                    kind: TransportKind::Stream,
                    addr,
                    key_fingerprint: String::new(),
                    handle: handle.clone(),
                })
                .unwrap();
            Client {
                slot,
                connection_id,
                addr,
                handle,
                mailbox,
            }
        }

        fn send(&self, client: &Client, packet: Packet) -> Result<Flow, DispatchError> {
            let ctx = HandlerContext {
                server: &self.server,
                slot: client.slot,
                connection_id: client.connection_id,
                addr: client.addr,
                handle: &client.handle,
            };
            self.dispatcher.dispatch(&ctx, packet)
        }

        fn enter(&self, client: &Client, account: &str, name: &str) {
            self.send(
                client,
                Packet::Login {
                    account: account.into(),
                },
            )
            .unwrap();
            self.send(client, Packet::CharacterSelect { name: name.into() })
                .unwrap();
        }
    }

    fn replies(client: &mut Client) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(outbound) = client.mailbox.outbox.try_recv() {
            if let Outbound::Packet(packet) = outbound {
                packets.push(packet);
            }
        }
        packets
    }

    #[test]
    fn test_heartbeat_is_acknowledged() {
        let harness = Harness::new();
        let mut client = harness.connect("127.0.0.1:6000");
        harness
            .send(&client, Packet::Heartbeat { timestamp: 77 })
            .unwrap();
        assert_eq!(replies(&mut client), vec![Packet::HeartbeatAck { timestamp: 77 }]);
    }

    #[test]
    fn test_login_and_character_select() {
        let mut harness = Harness::new();
        harness.db.set_player_power("alice", 2).unwrap();
        let mut client = harness.connect("127.0.0.1:6000");

        harness.enter(&client, "alice", "Alyssa");

        assert_eq!(
            replies(&mut client),
            vec![
                Packet::LoginAccepted {
                    power: 2,
                    muted: false
                },
                Packet::CharacterLoaded {
                    name: "Alyssa".into()
                },
            ]
        );
        let session = harness.server.registry.get(client.slot).unwrap();
        assert_eq!(session.account.as_deref(), Some("alice"));
        assert_eq!(session.character_name(), Some("Alyssa"));
        assert_eq!(session.power, 2);
        assert_eq!(
            harness.inputs.world.try_recv().unwrap(),
            WorldCommand::EntityJoined {
                slot: client.slot,
                name: "Alyssa".into(),
                power: 2
            }
        );
    }

    #[test]
    fn test_unknown_account_rejected_without_closing() {
        let harness = Harness::new();
        let mut client = harness.connect("127.0.0.1:6000");
        let flow = harness
            .send(
                &client,
                Packet::Login {
                    account: "mallory".into(),
                },
            )
            .unwrap();

        assert_eq!(flow, Flow::Continue);
        assert!(matches!(
            replies(&mut client).as_slice(),
            [Packet::LoginRejected { .. }]
        ));
        assert!(harness.server.registry.get(client.slot).unwrap().account.is_none());
    }

    #[test]
    fn test_banned_ip_closes_connection() {
        let harness = Harness::new();
        harness
            .db
            .add_ban(Sanction::new(
                "bob",
                60,
                "griefing",
                "Server",
                Some("10.1.1.1".parse().unwrap()),
            ))
            .unwrap();
        let client = harness.connect("10.1.1.1:6000");

        let flow = harness
            .send(
                &client,
                Packet::Login {
                    account: "alice".into(),
                },
            )
            .unwrap();
        assert_eq!(flow, Flow::Close("Account is banned".into()));
    }

    #[test]
    fn test_account_already_online() {
        let harness = Harness::new();
        let first = harness.connect("127.0.0.1:6000");
        let mut second = harness.connect("127.0.0.1:6001");
        harness.enter(&first, "alice", "Alyssa");

        harness
            .send(
                &second,
                Packet::Login {
                    account: "ALICE".into(),
                },
            )
            .unwrap();
        assert_eq!(
            replies(&mut second),
            vec![Packet::LoginRejected {
                reason: "Account is already online".into()
            }]
        );
    }

    #[test]
    fn test_database_outage_rejects_login_without_closing() {
        let (server, _inputs) = ServerContext::new(4, Arc::new(UnavailableDatabase));
        let dispatcher = default_dispatcher().unwrap();
        let (handle, mut mailbox) = SessionHandle::new();
        let connection_id = next_connection_id();
        let addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let slot = server
            .registry
            .allocate(NewSession {
                connection_id,
                kind: TransportKind::Stream,
                addr,
                key_fingerprint: String::new(),
                handle: handle.clone(),
            })
            .unwrap();
        let ctx = HandlerContext {
            server: &server,
            slot,
            connection_id,
            addr,
            handle: &handle,
        };

        let flow = dispatcher
            .dispatch(
                &ctx,
                Packet::Login {
                    account: "alice".into(),
                },
            )
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            mailbox.outbox.try_recv().unwrap(),
            Outbound::Packet(Packet::LoginRejected {
                reason: LOGIN_UNAVAILABLE.into()
            })
        );
        assert!(server.registry.get(slot).unwrap().account.is_none());
    }

    #[test]
    fn test_second_login_is_violation() {
        let harness = Harness::new();
        let client = harness.connect("127.0.0.1:6000");
        let login = Packet::Login {
            account: "alice".into(),
        };
        harness.send(&client, login.clone()).unwrap();
        assert!(matches!(
            harness.send(&client, login),
            Err(DispatchError::Handler {
                source: HandlerError::AlreadyLoggedIn,
                ..
            })
        ));
    }

    #[test]
    fn test_packets_before_login_are_violations() {
        let harness = Harness::new();
        let client = harness.connect("127.0.0.1:6000");

        for packet in [
            Packet::CharacterSelect { name: "x".into() },
            Packet::Chat {
                message: "hi".into(),
            },
            Packet::Binary(vec![1]),
        ] {
            assert!(matches!(
                harness.send(&client, packet),
                Err(DispatchError::Handler {
                    source: HandlerError::NotLoggedIn(_),
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_server_bound_packets_are_unknown() {
        let harness = Harness::new();
        let client = harness.connect("127.0.0.1:6000");
        assert!(matches!(
            harness.send(&client, Packet::Joined { slot: 0 }),
            Err(DispatchError::UnknownPacketCode(PacketCode::Joined))
        ));
    }

    #[test]
    fn test_chat_is_queued_for_broadcast() {
        let mut harness = Harness::new();
        let client = harness.connect("127.0.0.1:6000");
        harness.enter(&client, "alice", "Alyssa");

        harness
            .send(
                &client,
                Packet::Chat {
                    message: "hello".into(),
                },
            )
            .unwrap();
        let queued = harness.inputs.broadcasts.try_recv().unwrap();
        assert_eq!(
            queued.packet,
            Packet::ChatMessage {
                sender: "Alyssa".into(),
                message: "hello".into()
            }
        );
    }

    #[test]
    fn test_muted_chat_gets_private_notice() {
        let mut harness = Harness::new();
        harness
            .db
            .add_mute(Sanction::new("alice", 30, "spamming", "Server", None))
            .unwrap();
        let mut client = harness.connect("127.0.0.1:6000");
        harness.enter(&client, "alice", "Alyssa");
        replies(&mut client);

        harness
            .send(
                &client,
                Packet::Chat {
                    message: "let me talk".into(),
                },
            )
            .unwrap();

        assert!(harness.inputs.broadcasts.try_recv().is_err());
        assert_eq!(
            replies(&mut client),
            vec![Packet::ChatMessage {
                sender: SERVER_SENDER.into(),
                message: "You are muted: spamming".into()
            }]
        );
    }

    #[test]
    fn test_binary_goes_to_simulation() {
        let mut harness = Harness::new();
        let client = harness.connect("127.0.0.1:6000");
        harness.enter(&client, "bob", "Bobby");
        harness.inputs.world.try_recv().unwrap();

        harness.send(&client, Packet::Binary(vec![4, 5, 6])).unwrap();
        assert_eq!(
            harness.inputs.world.try_recv().unwrap(),
            WorldCommand::ClientData {
                slot: client.slot,
                data: vec![4, 5, 6]
            }
        );
    }

    #[test]
    fn test_logout_closes() {
        let harness = Harness::new();
        let client = harness.connect("127.0.0.1:6000");
        assert_eq!(
            harness.send(&client, Packet::Logout).unwrap(),
            Flow::Close("Logged out".into())
        );
    }
}
