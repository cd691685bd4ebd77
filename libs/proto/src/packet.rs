//! Packet and frame types.

use std::fmt;

use bytes::Bytes;

/// Packet id of the modern handshake.
pub const HANDSHAKE_ID: i32 = 0x00;

/// Packet id (and first byte on the wire) of the legacy server list ping.
pub const LEGACY_SERVER_LIST_PING_ID: i32 = 0xFE;

/// Phase of a Minecraft connection.
///
/// Owned by each connection and passed into [`crate::read_packet`]; the
/// legacy ping is only recognised while handshaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Handshaking,
    Status,
    Login,
}

impl ConnectionState {
    /// Map the handshake's `next_state` field to the phase it requests.
    pub fn from_next_state(next_state: i32) -> Option<Self> {
        match next_state {
            1 => Some(Self::Status),
            2 => Some(Self::Login),
            _ => None,
        }
    }
}

/// A single length-prefixed chunk read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub length: usize,
    pub payload: Bytes,
}

/// A decoded packet: frame length, packet id and the rest of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Frame length, 0 for the legacy ping which has none.
    pub length: usize,
    pub packet_id: i32,
    pub payload: PacketPayload,
}

impl Packet {
    pub(crate) fn legacy(ping: LegacyServerListPing) -> Self {
        Self {
            length: 0,
            packet_id: LEGACY_SERVER_LIST_PING_ID,
            payload: PacketPayload::LegacyServerListPing(ping),
        }
    }
}

/// Body of a [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketPayload {
    /// Undecoded bytes following the packet id.
    Raw(Bytes),
    /// The legacy ping is decoded while it is read since it has no framing.
    LegacyServerListPing(LegacyServerListPing),
}

/// First packet of a modern client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    /// The address the player typed, possibly with a NUL-separated suffix
    /// added by modded clients.
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

/// Probe sent by legacy clients to the server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyServerListPing {
    pub protocol_version: u8,
    pub server_address: String,
    pub server_port: u16,
}

const TRIM_LIMIT: usize = 64;

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            PacketPayload::Raw(data) => {
                let shown = &data[..data.len().min(TRIM_LIMIT)];
                write!(
                    f,
                    "Packet[len={}, id={:#04x}, data=",
                    self.length, self.packet_id
                )?;
                for byte in shown {
                    write!(f, "{byte:02X}")?;
                }
                if data.len() > TRIM_LIMIT {
                    f.write_str("...")?;
                }
                f.write_str("]")
            }
            PacketPayload::LegacyServerListPing(ping) => write!(
                f,
                "Packet[len={}, id={:#04x}, legacy_ping={:?}]",
                self.length, self.packet_id, ping
            ),
        }
    }
}
