//! Legacy (pre-1.7) server list ping.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! FE                      packet id
//! 01                      ping payload
//! FA                      plugin message id
//! u16 + UTF-16BE          channel, always "MC|PingHost" (11 units)
//! u16                     length of the rest
//!   u8                    protocol version
//!   u16 + UTF-16BE        hostname
//!   u32                   port
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::packet::{LegacyServerListPing, LEGACY_SERVER_LIST_PING_ID};
use crate::DecodeError;

/// Plugin channel carrying the host in a legacy ping.
pub const LEGACY_PING_HOST_CHANNEL: &str = "MC|PingHost";

const PING_PAYLOAD: u8 = 0x01;
const PLUGIN_MESSAGE_ID: u8 = 0xFA;

async fn expect_byte<R: AsyncRead + Unpin>(
    source: &mut R,
    expected: u8,
    field: &'static str,
) -> Result<(), DecodeError> {
    let actual = source
        .read_u8()
        .await
        .map_err(|e| DecodeError::legacy(field, e))?;
    if actual != expected {
        return Err(DecodeError::legacy(
            field,
            format!("expected {expected:#04x}, got {actual:#04x}"),
        ));
    }
    Ok(())
}

async fn read_u16<R: AsyncRead + Unpin>(
    source: &mut R,
    field: &'static str,
) -> Result<u16, DecodeError> {
    source
        .read_u16()
        .await
        .map_err(|e| DecodeError::legacy(field, e))
}

async fn read_utf16be<R: AsyncRead + Unpin>(
    source: &mut R,
    units: u16,
    field: &'static str,
) -> Result<String, DecodeError> {
    let mut raw = vec![0u8; usize::from(units) * 2];
    source
        .read_exact(&mut raw)
        .await
        .map_err(|e| DecodeError::legacy(field, e))?;

    let units = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// Read a legacy server list ping, starting at its `0xFE` marker.
///
/// The port is sent as a 32-bit integer and truncated to 16 bits.
pub async fn read_legacy_ping<R: AsyncRead + Unpin>(
    source: &mut R,
) -> Result<LegacyServerListPing, DecodeError> {
    expect_byte(source, LEGACY_SERVER_LIST_PING_ID as u8, "packet_id").await?;
    expect_byte(source, PING_PAYLOAD, "payload").await?;
    expect_byte(source, PLUGIN_MESSAGE_ID, "plugin_message_id").await?;

    let channel_len = read_u16(source, "channel_length").await?;
    if usize::from(channel_len) != LEGACY_PING_HOST_CHANNEL.len() {
        return Err(DecodeError::legacy(
            "channel_length",
            format!(
                "expected {}, got {channel_len}",
                LEGACY_PING_HOST_CHANNEL.len()
            ),
        ));
    }
    let channel = read_utf16be(source, channel_len, "channel").await?;
    if channel != LEGACY_PING_HOST_CHANNEL {
        return Err(DecodeError::legacy(
            "channel",
            format!("expected {LEGACY_PING_HOST_CHANNEL}, got {channel}"),
        ));
    }

    let remaining = read_u16(source, "remaining_length").await?;
    let mut region = source.take(u64::from(remaining));

    let protocol_version = region
        .read_u8()
        .await
        .map_err(|e| DecodeError::legacy("protocol_version", e))?;
    let address_len = read_u16(&mut region, "server_address_length").await?;
    let server_address = read_utf16be(&mut region, address_len, "server_address").await?;
    let server_port = region
        .read_u32()
        .await
        .map_err(|e| DecodeError::legacy("server_port", e))?;

    Ok(LegacyServerListPing {
        protocol_version,
        server_address,
        server_port: server_port as u16,
    })
}
