//! # qumine-proto
//!
//! The slice of the Minecraft wire protocol an ingress needs to route a
//! connection: enough to read the first packet a client sends and pull the
//! hostname out of it.
//!
//! Two shapes are understood:
//!
//! - the modern **Handshake** (packet id `0x00`), carried in a varint
//!   length-prefixed frame;
//! - the **Legacy Server List Ping** (`0xFE`), a fixed-format probe sent by
//!   pre-1.7 clients with no outer length prefix.
//!
//! Nothing past the first packet is decoded. Readers are async and generic
//! over tokio's `AsyncRead`/`AsyncBufRead` so the caller can tee the bytes
//! they consume; payload parsers work on any [`bytes::Buf`].

mod error;
mod legacy;
mod packet;
mod read;
mod varint;

pub use error::DecodeError;
pub use legacy::{read_legacy_ping, LEGACY_PING_HOST_CHANNEL};
pub use packet::{
    ConnectionState, Frame, Handshake, LegacyServerListPing, Packet, PacketPayload,
    HANDSHAKE_ID, LEGACY_SERVER_LIST_PING_ID,
};
pub use read::{
    get_string, put_string, read_frame, read_handshake, read_packet, read_string,
    MAX_FRAME_LENGTH, MAX_ZERO_READS, ZERO_READ_BACKOFF,
};
pub use varint::{get_varint, put_varint, read_varint, MAX_VARINT_LEN};
