//! Routes decoded packets to handlers by type code.
//!
//! Handlers are registered once at startup, one per code. A connection
//! dispatches its packets one at a time from its own task, so handlers for
//! one connection run in receive order; different connections dispatch
//! concurrently.

use crate::context::ServerContext;
use crate::error::{DispatchError, HandlerError};
use crate::registry::{ClientSession, ConnectionId, SessionHandle, SlotId};
use log::debug;
use shared::{Packet, PacketCode};
use std::collections::HashMap;
use std::net::SocketAddr;

/// What the connection should do after a packet was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Say goodbye with this reason and close.
    Close(String),
}

/// Everything a handler may touch for the session it serves.
pub struct HandlerContext<'a> {
    pub server: &'a ServerContext,
    pub slot: SlotId,
    pub connection_id: ConnectionId,
    pub addr: SocketAddr,
    pub handle: &'a SessionHandle,
}

impl HandlerContext<'_> {
    /// Current snapshot of this connection's session.
    pub fn session(&self) -> Result<ClientSession, HandlerError> {
        self.server
            .registry
            .get(self.slot)
            .filter(|session| session.connection_id == self.connection_id)
            .ok_or(HandlerError::SessionGone(self.slot))
    }

    /// Mutates this connection's session through the registry.
    pub fn update<R>(&self, f: impl FnOnce(&mut ClientSession) -> R) -> Result<R, HandlerError> {
        self.server
            .registry
            .update(self.slot, self.connection_id, f)
            .ok_or(HandlerError::SessionGone(self.slot))
    }

    pub fn reply(&self, packet: Packet) {
        self.handle.send(packet);
    }
}

pub trait PacketHandler: Send + Sync {
    fn handle(&self, ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError>;
}

impl<F> PacketHandler for F
where
    F: Fn(&HandlerContext<'_>, Packet) -> Result<Flow, HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, HandlerError> {
        self(ctx, packet)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<PacketCode, Box<dyn PacketHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `code`. A second registration for the same
    /// code is a configuration error.
    pub fn register<H>(&mut self, code: PacketCode, handler: H) -> Result<(), DispatchError>
    where
        H: PacketHandler + 'static,
    {
        if self.handlers.contains_key(&code) {
            return Err(DispatchError::DuplicateHandler(code));
        }
        self.handlers.insert(code, Box::new(handler));
        Ok(())
    }

    pub fn is_registered(&self, code: PacketCode) -> bool {
        self.handlers.contains_key(&code)
    }

    /// Runs the handler for `packet`. A code without a handler is a
    /// protocol violation.
    pub fn dispatch(&self, ctx: &HandlerContext<'_>, packet: Packet) -> Result<Flow, DispatchError> {
        let code = packet.code();
        let handler = self
            .handlers
            .get(&code)
            .ok_or(DispatchError::UnknownPacketCode(code))?;

        debug!("Slot {} dispatching {:?}", ctx.slot, code);
        handler
            .handle(ctx, packet)
            .map_err(|source| DispatchError::Handler { code, source })
    }
}
