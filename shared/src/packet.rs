//! Application packets and their type codes.
//!
//! Every packet is written as a one byte type code followed by its payload.
//! Payloads are bincode encoded, except [`Packet::Binary`] which carries
//! opaque game data verbatim so the frame length doubles as its length.

use crate::error::CodecError;
use bincode::{deserialize, serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wire type codes. The numeric values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketCode {
    HandshakeComplete = 0x00,
    Heartbeat = 0x01,
    HeartbeatAck = 0x02,
    Joined = 0x03,
    Login = 0x10,
    LoginAccepted = 0x11,
    LoginRejected = 0x12,
    CharacterSelect = 0x13,
    CharacterLoaded = 0x14,
    Chat = 0x20,
    ChatMessage = 0x21,
    GlobalMessage = 0x22,
    Binary = 0x30,
    Logout = 0x40,
    Disconnected = 0x41,
}

impl PacketCode {
    pub const ALL: [PacketCode; 15] = [
        PacketCode::HandshakeComplete,
        PacketCode::Heartbeat,
        PacketCode::HeartbeatAck,
        PacketCode::Joined,
        PacketCode::Login,
        PacketCode::LoginAccepted,
        PacketCode::LoginRejected,
        PacketCode::CharacterSelect,
        PacketCode::CharacterLoaded,
        PacketCode::Chat,
        PacketCode::ChatMessage,
        PacketCode::GlobalMessage,
        PacketCode::Binary,
        PacketCode::Logout,
        PacketCode::Disconnected,
    ];

    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u8 == code)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// First encrypted packet from the server, acknowledging the key.
    HandshakeComplete,
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    /// Sent once the connection holds a registry slot.
    Joined {
        slot: u32,
    },
    Login {
        account: String,
    },
    LoginAccepted {
        power: i32,
        muted: bool,
    },
    LoginRejected {
        reason: String,
    },
    CharacterSelect {
        name: String,
    },
    CharacterLoaded {
        name: String,
    },
    Chat {
        message: String,
    },
    ChatMessage {
        sender: String,
        message: String,
    },
    GlobalMessage {
        message: String,
    },
    /// Opaque game data handed to the simulation layer.
    Binary(Vec<u8>),
    Logout,
    Disconnected {
        reason: String,
    },
}

impl Packet {
    pub fn code(&self) -> PacketCode {
        match self {
            Packet::HandshakeComplete => PacketCode::HandshakeComplete,
            Packet::Heartbeat { .. } => PacketCode::Heartbeat,
            Packet::HeartbeatAck { .. } => PacketCode::HeartbeatAck,
            Packet::Joined { .. } => PacketCode::Joined,
            Packet::Login { .. } => PacketCode::Login,
            Packet::LoginAccepted { .. } => PacketCode::LoginAccepted,
            Packet::LoginRejected { .. } => PacketCode::LoginRejected,
            Packet::CharacterSelect { .. } => PacketCode::CharacterSelect,
            Packet::CharacterLoaded { .. } => PacketCode::CharacterLoaded,
            Packet::Chat { .. } => PacketCode::Chat,
            Packet::ChatMessage { .. } => PacketCode::ChatMessage,
            Packet::GlobalMessage { .. } => PacketCode::GlobalMessage,
            Packet::Binary(_) => PacketCode::Binary,
            Packet::Logout => PacketCode::Logout,
            Packet::Disconnected { .. } => PacketCode::Disconnected,
        }
    }

    /// Serializes the packet as `[code][payload]`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let code = self.code().as_u8();
        let payload = match self {
            Packet::HandshakeComplete | Packet::Logout => Vec::new(),
            Packet::Heartbeat { timestamp } | Packet::HeartbeatAck { timestamp } => {
                encode_payload(code, timestamp)?
            }
            Packet::Joined { slot } => encode_payload(code, slot)?,
            Packet::Login { account } => encode_payload(code, account)?,
            Packet::LoginAccepted { power, muted } => encode_payload(code, &(power, muted))?,
            Packet::LoginRejected { reason } | Packet::Disconnected { reason } => {
                encode_payload(code, reason)?
            }
            Packet::CharacterSelect { name } | Packet::CharacterLoaded { name } => {
                encode_payload(code, name)?
            }
            Packet::Chat { message } | Packet::GlobalMessage { message } => {
                encode_payload(code, message)?
            }
            Packet::ChatMessage { sender, message } => encode_payload(code, &(sender, message))?,
            Packet::Binary(data) => data.clone(),
        };

        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(code);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Parses `[code][payload]`. Unknown codes are reported as such rather
    /// than being guessed at.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&raw_code, payload) = bytes.split_first().ok_or(CodecError::EmptyPacket)?;
        let code = PacketCode::from_u8(raw_code).ok_or(CodecError::UnknownPacketCode(raw_code))?;

        let packet = match code {
            PacketCode::HandshakeComplete => {
                expect_empty(raw_code, payload)?;
                Packet::HandshakeComplete
            }
            PacketCode::Logout => {
                expect_empty(raw_code, payload)?;
                Packet::Logout
            }
            PacketCode::Heartbeat => Packet::Heartbeat {
                timestamp: decode_payload(raw_code, payload)?,
            },
            PacketCode::HeartbeatAck => Packet::HeartbeatAck {
                timestamp: decode_payload(raw_code, payload)?,
            },
            PacketCode::Joined => Packet::Joined {
                slot: decode_payload(raw_code, payload)?,
            },
            PacketCode::Login => Packet::Login {
                account: decode_payload(raw_code, payload)?,
            },
            PacketCode::LoginAccepted => {
                let (power, muted) = decode_payload(raw_code, payload)?;
                Packet::LoginAccepted { power, muted }
            }
            PacketCode::LoginRejected => Packet::LoginRejected {
                reason: decode_payload(raw_code, payload)?,
            },
            PacketCode::CharacterSelect => Packet::CharacterSelect {
                name: decode_payload(raw_code, payload)?,
            },
            PacketCode::CharacterLoaded => Packet::CharacterLoaded {
                name: decode_payload(raw_code, payload)?,
            },
            PacketCode::Chat => Packet::Chat {
                message: decode_payload(raw_code, payload)?,
            },
            PacketCode::ChatMessage => {
                let (sender, message) = decode_payload(raw_code, payload)?;
                Packet::ChatMessage { sender, message }
            }
            PacketCode::GlobalMessage => Packet::GlobalMessage {
                message: decode_payload(raw_code, payload)?,
            },
            PacketCode::Binary => Packet::Binary(payload.to_vec()),
            PacketCode::Disconnected => Packet::Disconnected {
                reason: decode_payload(raw_code, payload)?,
            },
        };

        Ok(packet)
    }
}

fn encode_payload<T: Serialize + ?Sized>(code: u8, value: &T) -> Result<Vec<u8>, CodecError> {
    serialize(value).map_err(|e| CodecError::Malformed {
        code,
        reason: e.to_string(),
    })
}

fn decode_payload<T: DeserializeOwned + Serialize>(code: u8, payload: &[u8]) -> Result<T, CodecError> {
    let value: T = deserialize(payload).map_err(|e| CodecError::Malformed {
        code,
        reason: e.to_string(),
    })?;

    // Trailing bytes mean the sender and receiver disagree about the layout.
    let consumed = bincode::serialized_size(&value).map_err(|e| CodecError::Malformed {
        code,
        reason: e.to_string(),
    })?;
    if consumed as usize != payload.len() {
        return Err(CodecError::Malformed {
            code,
            reason: format!("{} trailing bytes", payload.len() - consumed as usize),
        });
    }

    Ok(value)
}

fn expect_empty(code: u8, payload: &[u8]) -> Result<(), CodecError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(CodecError::Malformed {
            code,
            reason: format!("expected no payload, got {} bytes", payload.len()),
        })
    }
}
