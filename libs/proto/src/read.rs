//! Frame, string and handshake readers.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::legacy::read_legacy_ping;
use crate::packet::{ConnectionState, Frame, Handshake, Packet, PacketPayload};
use crate::varint::{get_varint, put_varint, read_varint};
use crate::{DecodeError, LEGACY_SERVER_LIST_PING_ID};

/// Largest frame the protocol allows (a 3-byte varint length).
pub const MAX_FRAME_LENGTH: usize = 2_097_151;

/// Pause between reads that returned no data.
pub const ZERO_READ_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive empty reads tolerated before a frame is abandoned.
pub const MAX_ZERO_READS: u32 = 10;

fn check_length(length: i32) -> Result<usize, DecodeError> {
    let length = usize::try_from(length).map_err(|_| DecodeError::NegativeLength(length))?;
    if length > MAX_FRAME_LENGTH {
        return Err(DecodeError::FrameTooLarge {
            length,
            max: MAX_FRAME_LENGTH,
        });
    }
    Ok(length)
}

/// Read a varint length-prefixed string from an async source.
///
/// The prefix counts bytes, not characters. Invalid UTF-8 is replaced
/// rather than rejected; the address is only ever used as a lookup key.
pub async fn read_string<R: AsyncRead + Unpin>(source: &mut R) -> Result<String, DecodeError> {
    let length = check_length(read_varint(source).await?)?;
    let mut raw = vec![0u8; length];
    source.read_exact(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read a varint length-prefixed string from an in-memory buffer.
pub fn get_string<B: Buf>(buf: &mut B) -> Result<String, DecodeError> {
    let length = check_length(get_varint(buf)?)?;
    if buf.remaining() < length {
        return Err(DecodeError::UnexpectedEof);
    }
    let raw = buf.copy_to_bytes(length);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Append a varint length-prefixed UTF-8 string.
pub fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    put_varint(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// Read one length-prefixed frame.
///
/// Short reads are retried until the payload is complete. A read that
/// returns nothing is retried after [`ZERO_READ_BACKOFF`], at most
/// [`MAX_ZERO_READS`] times in a row.
pub async fn read_frame<R: AsyncRead + Unpin>(source: &mut R) -> Result<Frame, DecodeError> {
    let length = check_length(read_varint(source).await?)?;
    trace!(length, "read frame length");

    let mut payload = vec![0u8; length];
    let mut total = 0;
    let mut zero_reads = 0;

    while total < length {
        let n = source.read(&mut payload[total..]).await?;
        if n == 0 {
            zero_reads += 1;
            if zero_reads > MAX_ZERO_READS {
                return Err(DecodeError::UnexpectedEof);
            }
            trace!(total, length, zero_reads, "empty read while filling frame");
            tokio::time::sleep(ZERO_READ_BACKOFF).await;
            continue;
        }
        zero_reads = 0;
        total += n;
        trace!(total, length, "read frame content");
    }

    Ok(Frame {
        length,
        payload: Bytes::from(payload),
    })
}

fn handshake_field(field: &'static str) -> impl FnOnce(DecodeError) -> DecodeError {
    move |source| DecodeError::DecodeHandshakeFailed {
        field,
        source: Box::new(source),
    }
}

/// Decode a handshake from the payload that follows its packet id.
///
/// Fields in wire order: protocol version (varint), server address
/// (string), server port (big-endian u16), next state (varint).
pub fn read_handshake<B: Buf>(mut payload: B) -> Result<Handshake, DecodeError> {
    let protocol_version = get_varint(&mut payload).map_err(handshake_field("protocol_version"))?;
    let server_address = get_string(&mut payload).map_err(handshake_field("server_address"))?;
    if payload.remaining() < 2 {
        return Err(handshake_field("server_port")(DecodeError::UnexpectedEof));
    }
    let server_port = payload.get_u16();
    let next_state = get_varint(&mut payload).map_err(handshake_field("next_state"))?;

    Ok(Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

/// Read the next packet.
///
/// While handshaking the first byte is peeked without being consumed: a
/// legacy ping starts with `0xFE` and has no length prefix, so it would be
/// misread as a frame. Everything else is read as a frame whose payload
/// starts with the packet id; the remainder is returned undecoded.
pub async fn read_packet<R: AsyncBufRead + Unpin>(
    source: &mut R,
    state: ConnectionState,
) -> Result<Packet, DecodeError> {
    if state == ConnectionState::Handshaking {
        let peeked = source.fill_buf().await?;
        let Some(&first) = peeked.first() else {
            return Err(DecodeError::UnexpectedEof);
        };
        if i32::from(first) == LEGACY_SERVER_LIST_PING_ID {
            let ping = read_legacy_ping(source).await?;
            return Ok(Packet::legacy(ping));
        }
    }

    let frame = read_frame(source).await?;
    let mut payload = frame.payload;
    let packet_id = get_varint(&mut payload)?;
    let packet = Packet {
        length: frame.length,
        packet_id,
        payload: PacketPayload::Raw(payload),
    };
    trace!(%packet, "read packet");

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HANDSHAKE_ID, LegacyServerListPing};
    use bytes::BytesMut;
    use std::io;
    use tokio::io::BufReader;

    fn handshake_payload(protocol: i32, address: &str, port: u16, next_state: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, protocol);
        put_string(&mut buf, address);
        buf.put_u16(port);
        put_varint(&mut buf, next_state);
        buf
    }

    fn framed(packet_id: i32, body: &[u8]) -> Vec<u8> {
        let mut inner = BytesMut::new();
        put_varint(&mut inner, packet_id);
        inner.put_slice(body);
        let mut out = BytesMut::new();
        put_varint(&mut out, inner.len() as i32);
        out.put_slice(&inner);
        out.to_vec()
    }

    #[test]
    fn test_read_handshake_fields() {
        let payload = handshake_payload(47, "play.test", 25565, 2);
        let handshake = read_handshake(payload.freeze()).unwrap();
        assert_eq!(
            handshake,
            Handshake {
                protocol_version: 47,
                server_address: "play.test".to_string(),
                server_port: 25565,
                next_state: 2,
            }
        );
    }

    #[test]
    fn test_read_handshake_keeps_nul_suffix() {
        let payload = handshake_payload(340, "Play.Test\0FML\0", 25565, 2);
        let handshake = read_handshake(&payload[..]).unwrap();
        assert_eq!(handshake.server_address, "Play.Test\0FML\0");
    }

    #[test]
    fn test_read_handshake_truncated_port() {
        let mut payload = BytesMut::new();
        put_varint(&mut payload, 47);
        put_string(&mut payload, "play.test");
        payload.put_u8(0x63);

        match read_handshake(payload.freeze()) {
            Err(DecodeError::DecodeHandshakeFailed { field, .. }) => assert_eq!(field, "server_port"),
            other => panic!("Expected DecodeHandshakeFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_read_handshake_missing_next_state() {
        let mut payload = BytesMut::new();
        put_varint(&mut payload, 47);
        put_string(&mut payload, "play.test");
        payload.put_u16(25565);

        match read_handshake(payload.freeze()) {
            Err(DecodeError::DecodeHandshakeFailed { field, source }) => {
                assert_eq!(field, "next_state");
                assert!(source.is_eof());
            }
            other => panic!("Expected DecodeHandshakeFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_read_handshake_string_overruns_payload() {
        let mut payload = BytesMut::new();
        put_varint(&mut payload, 47);
        put_varint(&mut payload, 40);
        payload.put_slice(b"short");

        match read_handshake(payload.freeze()) {
            Err(DecodeError::DecodeHandshakeFailed { field, .. }) => {
                assert_eq!(field, "server_address")
            }
            other => panic!("Expected DecodeHandshakeFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_string_lossy() {
        let mut source: &[u8] = &[0x03, b'a', 0xFF, b'b'];
        assert_eq!(read_string(&mut source).await.unwrap(), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn test_read_frame_across_short_reads() {
        let mut source = tokio_test::io::Builder::new()
            .read(&[0x05, 0x00])
            .wait(Duration::from_millis(5))
            .read(&[0x01, 0x02])
            .read(&[0x03, 0x04])
            .build();

        let frame = read_frame(&mut source).await.unwrap();
        assert_eq!(frame.length, 5);
        assert_eq!(&frame.payload[..], &[0x00, 0x01, 0x02, 0x03, 0x04]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_gives_up_after_empty_reads() {
        let mut source: &[u8] = &[0x03, 0x00];
        let started = tokio::time::Instant::now();

        let err = read_frame(&mut source).await.unwrap_err();
        assert!(err.is_eof());
        assert!(started.elapsed() >= ZERO_READ_BACKOFF * MAX_ZERO_READS);
    }

    #[tokio::test]
    async fn test_read_frame_propagates_io_error() {
        let mut source = tokio_test::io::Builder::new()
            .read(&[0x04, 0x00])
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        match read_frame(&mut source).await {
            Err(DecodeError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let mut header = BytesMut::new();
        put_varint(&mut header, (MAX_FRAME_LENGTH + 1) as i32);
        let mut source = &header[..];

        assert!(matches!(
            read_frame(&mut source).await,
            Err(DecodeError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_negative_length() {
        let mut header = BytesMut::new();
        put_varint(&mut header, -1);
        let mut source = &header[..];

        assert!(matches!(
            read_frame(&mut source).await,
            Err(DecodeError::NegativeLength(-1))
        ));
    }

    #[tokio::test]
    async fn test_read_packet_handshake() {
        let payload = handshake_payload(763, "mc.example.com", 25565, 1);
        let mut wire = framed(HANDSHAKE_ID, &payload);
        wire.extend_from_slice(&[0x01, 0x00]);

        let mut source = BufReader::new(&wire[..]);
        let packet = read_packet(&mut source, ConnectionState::Handshaking)
            .await
            .unwrap();

        assert_eq!(packet.packet_id, HANDSHAKE_ID);
        assert_eq!(packet.length, payload.len() + 1);
        let PacketPayload::Raw(raw) = packet.payload else {
            panic!("Expected raw payload");
        };
        let handshake = read_handshake(raw).unwrap();
        assert_eq!(handshake.server_address, "mc.example.com");
        assert_eq!(handshake.next_state, 1);

        // The status request that followed stays unread.
        let mut rest = Vec::new();
        source.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_read_packet_other_id() {
        let wire = framed(0x2A, &[0xDE, 0xAD]);
        let mut source = BufReader::new(&wire[..]);
        let packet = read_packet(&mut source, ConnectionState::Handshaking)
            .await
            .unwrap();

        assert_eq!(packet.packet_id, 0x2A);
        assert_eq!(packet.payload, PacketPayload::Raw(Bytes::from_static(&[0xDE, 0xAD])));
    }

    #[tokio::test]
    async fn test_read_packet_empty_stream() {
        let mut source = BufReader::new(&[][..]);
        let err = read_packet(&mut source, ConnectionState::Handshaking)
            .await
            .unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_packet_legacy_marker_outside_handshake_is_framed() {
        // 0xFE as the first byte of a frame length: only legal during
        // handshaking as a legacy ping, otherwise it is a varint.
        let wire = [0xFE, 0x00];
        let mut source = BufReader::new(&wire[..]);
        let err = read_packet(&mut source, ConnectionState::Login)
            .await
            .unwrap_err();
        assert!(!err.is_legacy_ping());
    }

    #[tokio::test]
    async fn test_read_packet_dispatches_legacy_ping() {
        let wire = crate::legacy::tests::legacy_ping_bytes(74, "legacy.test", 25565);
        let mut source = BufReader::new(&wire[..]);
        let packet = read_packet(&mut source, ConnectionState::Handshaking)
            .await
            .unwrap();

        assert_eq!(packet.packet_id, LEGACY_SERVER_LIST_PING_ID);
        assert_eq!(packet.length, 0);
        assert_eq!(
            packet.payload,
            PacketPayload::LegacyServerListPing(LegacyServerListPing {
                protocol_version: 74,
                server_address: "legacy.test".to_string(),
                server_port: 25565,
            })
        );
    }
}
