//! Session registry: the authoritative table of connected clients.
//!
//! The registry is a fixed-capacity vector of slots, each `None` or a
//! [`ClientSession`]. Slots are the unit of addressing for handlers, the
//! tick loop and the operator console.
//!
//! ## Locking discipline
//!
//! A single registry-wide `RwLock` guards the table. It is held only for the
//! duration of one lookup or mutation, never across an `.await` and never
//! while doing network or database I/O. Readers get *copies* of sessions
//! ([`SessionRegistry::get`]); mutations go through
//! [`SessionRegistry::update`] with the slot and the connection id, so a
//! stale caller can never touch a slot that has since been reused.
//!
//! Once [`SessionRegistry::release`] returns, no later `get` observes the old
//! session.
//!
//! ## Disconnects
//!
//! Closing a session is cooperative. [`SessionHandle::close`] flags the
//! session and queues a farewell behind anything already in its outbox; the
//! connection's own task writes it, closes the transport and exits.

use crate::error::CapacityExceeded;
use log::{debug, info};
use shared::{Packet, TransportKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Index of a registry slot.
pub type SlotId = u32;

/// Process-unique identifier of one accepted connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Work for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Packet(Packet),
    /// Send `Disconnected { reason }` and close the transport.
    Close(String),
}

/// Cheap, cloneable way to reach a connection from outside its task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbox: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
}

/// The connection task's end of a [`SessionHandle`].
#[derive(Debug)]
pub struct SessionMailbox {
    pub outbox: mpsc::UnboundedReceiver<Outbound>,
}

impl SessionHandle {
    pub fn new() -> (Self, SessionMailbox) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox: outbox_tx,
                closing: Arc::new(AtomicBool::new(false)),
            },
            SessionMailbox { outbox: outbox_rx },
        )
    }

    /// Queues a packet. Returns false if the connection is already gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.outbox.send(Outbound::Packet(packet)).is_ok()
    }

    /// Asks the connection to say goodbye and shut down.
    pub fn close(&self, reason: impl Into<String>) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.outbox.send(Outbound::Close(reason.into()));
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// The game entity a session controls once a character is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub name: String,
}

/// One connected client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Index into the registry; reused once the session ends.
    pub slot: SlotId,
    /// Unique for the life of the process. Tells a reused slot's new
    /// occupant apart from the old one.
    pub connection_id: ConnectionId,
    pub kind: TransportKind,
    /// Remote address, used for address bans and mutes.
    pub addr: SocketAddr,
    /// Set once login completes.
    pub account: Option<String>,
    /// Set once a character is active.
    pub entity: Option<EntityRef>,
    /// Chat from a muted session is refused.
    pub muted: bool,
    pub mute_reason: Option<String>,
    /// Account power level, loaded at login.
    pub power: i32,
    /// Last time a valid packet arrived. Drives the idle timeout.
    pub last_activity: Instant,
    /// Fingerprint of the negotiated session key, for logs.
    pub key_fingerprint: String,
    /// Reaches the connection task that owns this session.
    pub handle: SessionHandle,
}

impl ClientSession {
    pub fn character_name(&self) -> Option<&str> {
        self.entity.as_ref().map(|entity| entity.name.as_str())
    }

    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Outcome of claiming a unique name for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// Another active session holds the name.
    Taken,
    /// The slot no longer belongs to the caller.
    Gone,
}

/// What the connection pipeline knows when it asks for a slot.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub connection_id: ConnectionId,
    pub kind: TransportKind,
    pub addr: SocketAddr,
    pub key_fingerprint: String,
    pub handle: SessionHandle,
}

pub struct SessionRegistry {
    slots: RwLock<Vec<Option<ClientSession>>>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Most sessions the registry will hold at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panicking visitor poisons the lock; the table itself is still
    // consistent because every mutation is a single assignment.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Option<ClientSession>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Option<ClientSession>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a session in the lowest free slot.
    pub fn allocate(&self, new: NewSession) -> Result<SlotId, CapacityExceeded> {
        let mut slots = self.write();

        let index = match slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if slots.len() < self.capacity => {
                slots.push(None);
                slots.len() - 1
            }
            None => {
                return Err(CapacityExceeded {
                    max: self.capacity,
                })
            }
        };

        let slot = index as SlotId;
        slots[index] = Some(ClientSession {
            slot,
            connection_id: new.connection_id,
            kind: new.kind,
            addr: new.addr,
            account: None,
            entity: None,
            muted: false,
            mute_reason: None,
            power: 0,
            last_activity: Instant::now(),
            key_fingerprint: new.key_fingerprint,
            handle: new.handle,
        });
        drop(slots);

        info!(
            "Session {} allocated for {} ({}, connection {})",
            slot, new.addr, new.kind, new.connection_id
        );
        Ok(slot)
    }

    /// Snapshot of the session in `slot`.
    pub fn get(&self, slot: SlotId) -> Option<ClientSession> {
        self.read().get(slot as usize).cloned().flatten()
    }

    /// Mutates the session in `slot` if it still belongs to `connection_id`.
    pub fn update<R>(
        &self,
        slot: SlotId,
        connection_id: ConnectionId,
        f: impl FnOnce(&mut ClientSession) -> R,
    ) -> Option<R> {
        let mut slots = self.write();
        match slots.get_mut(slot as usize) {
            Some(Some(session)) if session.connection_id == connection_id => Some(f(session)),
            _ => None,
        }
    }

    /// Sets the session's account unless another session already holds it.
    /// Check and set happen under one write lock.
    pub fn claim_account(&self, slot: SlotId, connection_id: ConnectionId, account: &str) -> Claim {
        let holds = |session: &ClientSession| {
            session
                .account
                .as_deref()
                .map_or(false, |a| a.eq_ignore_ascii_case(account))
        };
        self.claim(slot, connection_id, holds, |session| {
            session.account = Some(account.to_string());
        })
    }

    /// Attaches a character unless another session is already playing it.
    pub fn claim_character(&self, slot: SlotId, connection_id: ConnectionId, name: &str) -> Claim {
        let holds = |session: &ClientSession| {
            session
                .character_name()
                .map_or(false, |n| n.eq_ignore_ascii_case(name))
        };
        self.claim(slot, connection_id, holds, |session| {
            session.entity = Some(EntityRef {
                name: name.to_string(),
            });
        })
    }

    fn claim(
        &self,
        slot: SlotId,
        connection_id: ConnectionId,
        holds: impl Fn(&ClientSession) -> bool,
        assign: impl FnOnce(&mut ClientSession),
    ) -> Claim {
        let mut slots = self.write();
        let taken = slots
            .iter()
            .flatten()
            .any(|session| session.slot != slot && holds(session));

        match slots.get_mut(slot as usize) {
            Some(Some(session)) if session.connection_id == connection_id => {
                if taken {
                    Claim::Taken
                } else {
                    assign(session);
                    Claim::Claimed
                }
            }
            _ => Claim::Gone,
        }
    }

    /// Marks the session as active now. Returns `false` if the slot no
    /// longer belongs to `connection_id`.
    pub fn touch(&self, slot: SlotId, connection_id: ConnectionId) -> bool {
        self.update(slot, connection_id, |session| {
            session.last_activity = Instant::now();
        })
        .is_some()
    }

    /// Visits every active session under the read lock. The visitor must
    /// not block.
    pub fn for_each(&self, mut visitor: impl FnMut(&ClientSession)) {
        for session in self.read().iter().flatten() {
            visitor(session);
        }
    }

    /// Frees `slot` if it still belongs to `connection_id`, returning the
    /// removed session.
    pub fn release(&self, slot: SlotId, connection_id: ConnectionId) -> Option<ClientSession> {
        let mut slots = self.write();
        let entry = slots.get_mut(slot as usize)?;
        if !matches!(entry, Some(session) if session.connection_id == connection_id) {
            return None;
        }

        let removed = entry.take();
        drop(slots);
        info!("Session {} released (connection {})", slot, connection_id);
        removed
    }

    /// Case-insensitive lookup by active character name.
    pub fn find_by_name(&self, name: &str) -> Option<ClientSession> {
        self.read()
            .iter()
            .flatten()
            .find(|session| {
                session
                    .character_name()
                    .map_or(false, |n| n.eq_ignore_ascii_case(name))
            })
            .cloned()
    }

    /// Case-insensitive lookup by logged-in account.
    pub fn find_by_account(&self, account: &str) -> Option<ClientSession> {
        self.read()
            .iter()
            .flatten()
            .find(|session| {
                session
                    .account
                    .as_deref()
                    .map_or(false, |a| a.eq_ignore_ascii_case(account))
            })
            .cloned()
    }

    /// Queues `packet` for every active session except `exclude` and those
    /// already closing.
    pub fn broadcast(&self, packet: &Packet, exclude: Option<SlotId>) -> usize {
        let mut delivered = 0;
        self.for_each(|session| {
            if Some(session.slot) == exclude || session.handle.is_closing() {
                return;
            }
            if session.handle.send(packet.clone()) {
                delivered += 1;
            }
        });
        debug!("Broadcast {:?} to {} sessions", packet.code(), delivered);
        delivered
    }

    /// Sessions with no activity for longer than `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<(SlotId, ConnectionId)> {
        let now = Instant::now();
        self.read()
            .iter()
            .flatten()
            .filter(|session| session.is_idle(timeout, now))
            .map(|session| (session.slot, session.connection_id))
            .collect()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sessions(&self) -> Vec<ClientSession> {
        self.read().iter().flatten().cloned().collect()
    }
}
