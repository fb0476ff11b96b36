//! Hook into the game simulation.
//!
//! The session layer does not simulate anything itself. It feeds a
//! [`Simulation`] through a bounded command channel that the tick loop
//! drains at the start of every tick, then advances it by one step.

use crate::registry::SlotId;
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of the command channel into the simulation.
pub const WORLD_QUEUE_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldCommand {
    EntityJoined { slot: SlotId, name: String, power: i32 },
    EntityLeft { slot: SlotId },
    /// Opaque game data from a client.
    ClientData { slot: SlotId, data: Vec<u8> },
    Kill { slot: SlotId },
    /// An operator changed the entity's power level.
    PowerChanged { slot: SlotId, power: i32 },
}

pub type WorldSender = mpsc::Sender<WorldCommand>;
pub type WorldReceiver = mpsc::Receiver<WorldCommand>;

pub fn world_channel() -> (WorldSender, WorldReceiver) {
    mpsc::channel(WORLD_QUEUE_LEN)
}

/// The game-logic layer driven by the tick loop.
pub trait Simulation: Send {
    fn apply(&mut self, command: WorldCommand);

    /// Advances the world by exactly one step.
    fn step(&mut self, dt: Duration);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldEntity {
    pub name: String,
    pub power: i32,
    pub alive: bool,
    pub deaths: u32,
    pub bytes_received: u64,
}

/// Minimal simulation: a roster of entities keyed by slot. Killed entities
/// respawn on the next step.
#[derive(Debug, Default)]
pub struct World {
    pub steps: u64,
    pub entities: HashMap<SlotId, WorldEntity>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Simulation for World {
    fn apply(&mut self, command: WorldCommand) {
        match command {
            WorldCommand::EntityJoined { slot, name, power } => {
                info!("Entity {} entered the world in slot {}", name, slot);
                self.entities.insert(
                    slot,
                    WorldEntity {
                        name,
                        power,
                        alive: true,
                        deaths: 0,
                        bytes_received: 0,
                    },
                );
            }
            WorldCommand::EntityLeft { slot } => {
                if let Some(entity) = self.entities.remove(&slot) {
                    info!("Entity {} left the world", entity.name);
                }
            }
            WorldCommand::ClientData { slot, data } => {
                if let Some(entity) = self.entities.get_mut(&slot) {
                    entity.bytes_received += data.len() as u64;
                } else {
                    debug!("Dropping {} bytes for empty slot {}", data.len(), slot);
                }
            }
            WorldCommand::Kill { slot } => {
                if let Some(entity) = self.entities.get_mut(&slot) {
                    entity.alive = false;
                    entity.deaths += 1;
                }
            }
            WorldCommand::PowerChanged { slot, power } => {
                if let Some(entity) = self.entities.get_mut(&slot) {
                    entity.power = power;
                }
            }
        }
    }

    fn step(&mut self, _dt: Duration) {
        self.steps += 1;
        for entity in self.entities.values_mut() {
            entity.alive = true;
        }
    }
}
