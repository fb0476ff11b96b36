//! State shared by connection tasks, the tick loop and the console.

use crate::database::{Character, Database};
use crate::registry::{ClientSession, ConnectionId, SessionRegistry, SlotId};
use crate::tick::TickStats;
use crate::world::{world_channel, WorldCommand, WorldReceiver, WorldSender};
use log::{error, warn};
use shared::Packet;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// A packet waiting for the next tick's broadcast flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub packet: Packet,
    pub exclude: Option<SlotId>,
}

/// Receiving ends owned by the tick loop.
pub struct TickInputs {
    pub world: WorldReceiver,
    pub broadcasts: mpsc::UnboundedReceiver<Broadcast>,
}

pub struct ServerContext {
    pub registry: SessionRegistry,
    pub database: Arc<dyn Database>,
    pub stats: TickStats,
    world: WorldSender,
    broadcasts: mpsc::UnboundedSender<Broadcast>,
    shutdown: watch::Sender<bool>,
}

impl ServerContext {
    pub fn new(capacity: usize, database: Arc<dyn Database>) -> (Arc<Self>, TickInputs) {
        let (world_tx, world_rx) = world_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let context = Arc::new(Self {
            registry: SessionRegistry::new(capacity),
            database,
            stats: TickStats::default(),
            world: world_tx,
            broadcasts: broadcast_tx,
            shutdown: shutdown_tx,
        });

        (
            context,
            TickInputs {
                world: world_rx,
                broadcasts: broadcast_rx,
            },
        )
    }

    /// Queues a broadcast for the next tick.
    pub fn queue_broadcast(&self, packet: Packet, exclude: Option<SlotId>) {
        if self.broadcasts.send(Broadcast { packet, exclude }).is_err() {
            warn!("Tick loop is gone, dropping broadcast");
        }
    }

    /// Hands a command to the simulation without waiting.
    pub fn send_world(&self, command: WorldCommand) -> bool {
        match self.world.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!("Simulation queue full, dropping {:?}", command);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ends a session: asks the connection to close (when `reason` is
    /// given), saves the character and frees the slot, in that order.
    ///
    /// Returns `None` if the slot no longer belongs to `connection_id`.
    pub fn end_session(
        &self,
        slot: SlotId,
        connection_id: ConnectionId,
        reason: Option<&str>,
    ) -> Option<ClientSession> {
        let session = self
            .registry
            .get(slot)
            .filter(|session| session.connection_id == connection_id)?;

        if let Some(reason) = reason {
            session.handle.close(reason);
        }
        self.save_session(&session);

        let removed = self.registry.release(slot, connection_id)?;
        if removed.entity.is_some() {
            self.send_world(WorldCommand::EntityLeft { slot });
        }
        Some(removed)
    }

    /// Persists the character of every active session. Returns how many
    /// were saved.
    pub fn save_all(&self) -> usize {
        self.registry
            .sessions()
            .iter()
            .filter(|session| self.save_session(session))
            .count()
    }

    fn save_session(&self, session: &ClientSession) -> bool {
        let (Some(account), Some(entity)) = (&session.account, &session.entity) else {
            return false;
        };
        let character = Character {
            account: account.clone(),
            name: entity.name.clone(),
        };
        match self.database.save_character(&character) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save character {}: {}", character.name, e);
                false
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use crate::registry::{
        next_connection_id, EntityRef, NewSession, Outbound, SessionHandle, SessionMailbox,
    };
    use shared::TransportKind;

    fn context_with(db: Arc<MemoryDatabase>) -> (Arc<ServerContext>, TickInputs) {
        ServerContext::new(4, db)
    }

    fn join(
        context: &ServerContext,
        character: Option<&str>,
    ) -> (SlotId, ConnectionId, SessionMailbox) {
        let (handle, mailbox) = SessionHandle::new();
        let connection_id = next_connection_id();
        let slot = context
            .registry
            .allocate(NewSession {
                connection_id,
                kind: TransportKind::Stream,
                addr: "127.0.0.1:4000".parse().unwrap(),
                key_fingerprint: String::new(),
                handle,
            })
            .unwrap();
        if let Some(name) = character {
            context.registry.update(slot, connection_id, |s| {
                s.account = Some(name.to_lowercase());
                s.entity = Some(EntityRef { name: name.into() });
            });
        }
        (slot, connection_id, mailbox)
    }

    #[test]
    fn test_end_session_saves_then_releases() {
        let db = Arc::new(MemoryDatabase::new());
        let (context, mut inputs) = context_with(Arc::clone(&db));
        let (slot, conn, mut mailbox) = join(&context, Some("Alice"));

        let removed = context.end_session(slot, conn, Some("Kicked")).unwrap();
        assert_eq!(removed.character_name(), Some("Alice"));
        assert!(context.registry.get(slot).is_none());
        assert!(db.character("alice").unwrap().is_some());
        assert_eq!(
            mailbox.outbox.try_recv().unwrap(),
            Outbound::Close("Kicked".into())
        );
        assert_eq!(
            inputs.world.try_recv().unwrap(),
            WorldCommand::EntityLeft { slot }
        );

        assert!(context.end_session(slot, conn, None).is_none());
    }

    #[test]
    fn test_save_all_skips_sessions_without_character() {
        let db = Arc::new(MemoryDatabase::new());
        let (context, _inputs) = context_with(Arc::clone(&db));
        let _a = join(&context, Some("Alice"));
        let _b = join(&context, None);
        let _c = join(&context, Some("Carol"));

        assert_eq!(context.save_all(), 2);
        assert!(db.character("carol").unwrap().is_some());
    }

    #[test]
    fn test_broadcast_queue() {
        let (context, mut inputs) = context_with(Arc::new(MemoryDatabase::new()));
        context.queue_broadcast(Packet::Logout, Some(1));
        assert_eq!(
            inputs.broadcasts.try_recv().unwrap(),
            Broadcast {
                packet: Packet::Logout,
                exclude: Some(1)
            }
        );
    }

    #[test]
    fn test_shutdown_flag() {
        let (context, _inputs) = context_with(Arc::new(MemoryDatabase::new()));
        let signal = context.shutdown_signal();
        assert!(!context.is_shutting_down());
        context.request_shutdown();
        assert!(context.is_shutting_down());
        assert!(*signal.borrow());
    }
}
