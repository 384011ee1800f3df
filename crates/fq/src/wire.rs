//! Frame codec for the fq wire protocol.
//!
//! Both channels speak big-endian binary. A connection announces its
//! mode with a 4-byte preamble, after which the command channel carries
//! 16-bit opcodes with opcode-specific bodies and the data channel
//! carries routed message frames. Strings and keys are 16-bit
//! length-prefixed; message payloads use a 32-bit length.
//!
//! Encoders build owned [`Bytes`] frames; decoders read from any
//! `AsyncRead`, so tests parse straight out of byte slices.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FqError;

/// Preamble announcing a command-channel connection.
pub const CMD_MODE: u32 = 0xcc50_cafe;
/// Preamble announcing a data-channel connection.
pub const DATA_MODE: u32 = 0xcc50_face;

pub const OP_ERROR: u16 = 0xeeee;
pub const OP_AUTH: u16 = 0xaaaa;
pub const OP_AUTH_RESP: u16 = 0xaa00;
pub const OP_HBREQ: u16 = 0x4848;
pub const OP_HB: u16 = 0xbea7;
pub const OP_BINDREQ: u16 = 0xb170;
pub const OP_BIND: u16 = 0xb171;
pub const OP_STATUSREQ: u16 = 0xc7a7;
pub const OP_STATUS: u16 = 0x57a7;

/// Auth method selector: plain source/password.
pub const AUTH_PLAIN: u16 = 0;

const MAX_SHORT: usize = u16::MAX as usize;
/// Upper bound on a data-channel payload; anything larger is treated as
/// a framing desync rather than a legitimate message.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A decoded command-channel frame pushed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdFrame {
    /// Successful authentication; carries the session key the data
    /// channel attaches with.
    AuthResp(Bytes),
    /// Broker-reported error text.
    Error(String),
    /// Acknowledgment of a bind request, with the assigned route id.
    Bind(u32),
    /// Counter snapshot answering a status request. A zero-length key
    /// terminates the pair list on the wire.
    Status(HashMap<String, u64>),
    /// Liveness heartbeat.
    Heartbeat,
}

pub fn mode_preamble(mode: u32) -> [u8; 4] {
    mode.to_be_bytes()
}

fn put_short(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), FqError> {
    if bytes.len() > MAX_SHORT {
        return Err(FqError::Protocol(format!(
            "field of {} bytes exceeds the 16-bit wire limit",
            bytes.len()
        )));
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

/// Plain authentication command: source (user/queue) and password.
pub fn auth_plain(source: &str, password: &str) -> Result<Bytes, FqError> {
    let mut buf = BytesMut::with_capacity(8 + source.len() + password.len());
    buf.put_u16(OP_AUTH);
    buf.put_u16(AUTH_PLAIN);
    put_short(&mut buf, source.as_bytes())?;
    put_short(&mut buf, password.as_bytes())?;
    Ok(buf.freeze())
}

/// Asks the broker to expect heartbeats every `interval_ms`.
pub fn heartbeat_request(interval_ms: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(OP_HBREQ);
    buf.put_u16(interval_ms);
    buf.freeze()
}

/// A bare heartbeat frame.
pub fn heartbeat() -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16(OP_HB);
    buf.freeze()
}

/// Registers a binding of `exchange` filtered by `program`. With
/// `peer_mode` false the broker delivers peer traffic only, which is
/// the right setting for a client that never publishes.
pub fn bind_request(exchange: &str, program: &str, peer_mode: bool) -> Result<Bytes, FqError> {
    let mut buf = BytesMut::with_capacity(8 + exchange.len() + program.len());
    buf.put_u16(OP_BINDREQ);
    buf.put_u16(peer_mode as u16);
    put_short(&mut buf, exchange.as_bytes())?;
    put_short(&mut buf, program.as_bytes())?;
    Ok(buf.freeze())
}

/// Requests a counter snapshot.
pub fn status_request() -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16(OP_STATUSREQ);
    buf.freeze()
}

/// Attaches a data-channel connection to the session identified by
/// `key` (sent immediately after the [`DATA_MODE`] preamble).
pub fn data_attach(key: &[u8]) -> Result<Bytes, FqError> {
    let mut buf = BytesMut::with_capacity(2 + key.len());
    put_short(&mut buf, key)?;
    Ok(buf.freeze())
}

async fn read_short<R>(r: &mut R) -> Result<Bytes, FqError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn read_short_string<R>(r: &mut R) -> Result<String, FqError>
where
    R: AsyncRead + Unpin,
{
    let raw = read_short(r).await?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| FqError::Protocol("string field is not utf-8".into()))
}

/// Reads one broker-pushed frame from the command channel.
pub async fn read_cmd_frame<R>(r: &mut R) -> Result<CmdFrame, FqError>
where
    R: AsyncRead + Unpin,
{
    let opcode = r.read_u16().await?;
    match opcode {
        OP_AUTH_RESP => Ok(CmdFrame::AuthResp(read_short(r).await?)),
        OP_ERROR => Ok(CmdFrame::Error(read_short_string(r).await?)),
        OP_BIND => Ok(CmdFrame::Bind(r.read_u32().await?)),
        OP_HB => Ok(CmdFrame::Heartbeat),
        OP_STATUS => {
            let mut counters = HashMap::new();
            loop {
                let klen = r.read_u16().await? as usize;
                if klen == 0 {
                    break;
                }
                let mut key = vec![0u8; klen];
                r.read_exact(&mut key).await?;
                let key = String::from_utf8(key)
                    .map_err(|_| FqError::Protocol("status key is not utf-8".into()))?;
                let value = r.read_u32().await? as u64;
                counters.insert(key, value);
            }
            Ok(CmdFrame::Status(counters))
        }
        other => Err(FqError::Protocol(format!(
            "unknown command opcode {other:#06x}"
        ))),
    }
}

/// Reads one routed message from the data channel: route, then a
/// 32-bit-length payload.
pub async fn read_data_message<R>(r: &mut R) -> Result<(String, Bytes), FqError>
where
    R: AsyncRead + Unpin,
{
    let route = read_short_string(r).await?;
    let len = r.read_u32().await? as usize;
    if len > MAX_PAYLOAD {
        return Err(FqError::Protocol(format!(
            "data payload of {len} bytes exceeds the frame limit"
        )));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((route, Bytes::from(payload)))
}

// ---------------------------------------------------------------------
// Broker-side framing, used by the loopback tests to emulate a broker.
// ---------------------------------------------------------------------

/// A client-issued command as seen by the broker side of the wire.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientCmd {
    Auth { source: String, password: String },
    HeartbeatRequest(u16),
    Bind {
        exchange: String,
        program: String,
        peer_mode: bool,
    },
    StatusRequest,
    Heartbeat,
}

#[cfg(test)]
pub(crate) async fn read_client_command<R>(r: &mut R) -> Result<ClientCmd, FqError>
where
    R: AsyncRead + Unpin,
{
    let opcode = r.read_u16().await?;
    match opcode {
        OP_AUTH => {
            let method = r.read_u16().await?;
            if method != AUTH_PLAIN {
                return Err(FqError::Protocol(format!("unknown auth method {method}")));
            }
            Ok(ClientCmd::Auth {
                source: read_short_string(r).await?,
                password: read_short_string(r).await?,
            })
        }
        OP_HBREQ => Ok(ClientCmd::HeartbeatRequest(r.read_u16().await?)),
        OP_BINDREQ => {
            let peer_mode = r.read_u16().await? != 0;
            Ok(ClientCmd::Bind {
                exchange: read_short_string(r).await?,
                program: read_short_string(r).await?,
                peer_mode,
            })
        }
        OP_STATUSREQ => Ok(ClientCmd::StatusRequest),
        OP_HB => Ok(ClientCmd::Heartbeat),
        other => Err(FqError::Protocol(format!(
            "unknown client opcode {other:#06x}"
        ))),
    }
}

#[cfg(test)]
pub(crate) fn auth_response(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(OP_AUTH_RESP);
    put_short(&mut buf, key).expect("key fits");
    buf.freeze()
}

#[cfg(test)]
pub(crate) fn error_frame(message: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(OP_ERROR);
    put_short(&mut buf, message.as_bytes()).expect("message fits");
    buf.freeze()
}

#[cfg(test)]
pub(crate) fn bind_ack(route: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(OP_BIND);
    buf.put_u32(route);
    buf.freeze()
}

#[cfg(test)]
pub(crate) fn status_report(counters: &[(&str, u64)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(OP_STATUS);
    for (key, value) in counters {
        put_short(&mut buf, key.as_bytes()).expect("key fits");
        buf.put_u32(*value as u32);
    }
    buf.put_u16(0);
    buf.freeze()
}

#[cfg(test)]
pub(crate) fn data_message(route: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    put_short(&mut buf, route.as_bytes()).expect("route fits");
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auth_command_round_trips() {
        let frame = auth_plain("relay", "secret").unwrap();
        let mut rd = &frame[..];
        let cmd = read_client_command(&mut rd).await.unwrap();
        assert_eq!(
            cmd,
            ClientCmd::Auth {
                source: "relay".into(),
                password: "secret".into(),
            }
        );
        assert!(rd.is_empty());
    }

    #[tokio::test]
    async fn bind_command_carries_flags_and_strings() {
        let frame = bind_request("logging", "prefix:\"x.\"", false).unwrap();
        let mut rd = &frame[..];
        match read_client_command(&mut rd).await.unwrap() {
            ClientCmd::Bind {
                exchange,
                program,
                peer_mode,
            } => {
                assert_eq!(exchange, "logging");
                assert_eq!(program, "prefix:\"x.\"");
                assert!(!peer_mode);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_frame_terminates_on_zero_key() {
        let frame = status_report(&[("no_route", 3), ("routed", 12)]);
        let mut rd = &frame[..];
        match read_cmd_frame(&mut rd).await.unwrap() {
            CmdFrame::Status(counters) => {
                assert_eq!(counters.len(), 2);
                assert_eq!(counters["no_route"], 3);
                assert_eq!(counters["routed"], 12);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rd.is_empty());
    }

    #[tokio::test]
    async fn empty_status_frame_decodes_to_empty_map() {
        let frame = status_report(&[]);
        let mut rd = &frame[..];
        match read_cmd_frame(&mut rd).await.unwrap() {
            CmdFrame::Status(counters) => assert!(counters.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_message_round_trips() {
        let frame = data_message("scribe.zipkin.span", b"payload bytes");
        let mut rd = &frame[..];
        let (route, payload) = read_data_message(&mut rd).await.unwrap();
        assert_eq!(route, "scribe.zipkin.span");
        assert_eq!(&payload[..], b"payload bytes");
    }

    #[tokio::test]
    async fn unknown_opcode_is_a_protocol_error() {
        let bytes = [0x12u8, 0x34];
        let mut rd = &bytes[..];
        let err = read_cmd_frame(&mut rd).await.unwrap_err();
        assert!(matches!(err, FqError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        // opcode says status, but the key bytes are missing
        let bytes = [
            (OP_STATUS >> 8) as u8,
            (OP_STATUS & 0xff) as u8,
            0x00,
            0x04,
            b'a',
        ];
        let mut rd = &bytes[..];
        let err = read_cmd_frame(&mut rd).await.unwrap_err();
        assert!(matches!(err, FqError::Io(_)));
    }

    #[test]
    fn oversized_field_rejected_on_encode() {
        let big = "x".repeat(MAX_SHORT + 1);
        let err = bind_request(&big, "prog", false).unwrap_err();
        assert!(matches!(err, FqError::Protocol(_)));
    }
}
