//! Scribe transport: framed Thrift strict-binary `Log` calls.
//!
//! The wire format is the framed transport (4-byte length prefix)
//! around a strict-binary call of `Log(list<LogEntry>)`, where each
//! entry is a struct of two strings, category and message. Only the
//! pieces of the protocol that call needs are implemented here.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{LogRecord, RelayError, SinkConnector, SinkTransport};

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

const MSG_CALL: u32 = 1;
const MSG_REPLY: u32 = 2;
const MSG_EXCEPTION: u32 = 3;

const TYPE_STOP: u8 = 0;
const TYPE_I32: u8 = 8;
const TYPE_STRING: u8 = 11;
const TYPE_STRUCT: u8 = 12;
const TYPE_LIST: u8 = 15;

const METHOD: &str = "Log";

const RESULT_OK: i32 = 0;
const RESULT_TRY_LATER: i32 = 1;

const MAX_REPLY: usize = 1024 * 1024;

/// Dials a Scribe receiver.
pub struct ScribeConnector {
    host: String,
    port: u16,
}

impl ScribeConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl SinkConnector for ScribeConnector {
    type Transport = ScribeTransport;

    async fn open(&self) -> Result<ScribeTransport, RelayError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        debug!(host = %self.host, port = self.port, "scribe connection established");
        Ok(ScribeTransport { stream, seq: 0 })
    }
}

/// One open Scribe connection.
pub struct ScribeTransport {
    stream: TcpStream,
    seq: i32,
}

#[async_trait]
impl SinkTransport for ScribeTransport {
    async fn append(&mut self, records: &[LogRecord]) -> Result<(), RelayError> {
        self.seq = self.seq.wrapping_add(1);
        let frame = encode_log_call(self.seq, records);
        self.stream.write_all(&frame).await?;

        let len = self.stream.read_u32().await? as usize;
        if len > MAX_REPLY {
            return Err(RelayError::Protocol(format!(
                "reply frame of {len} bytes exceeds the limit"
            )));
        }
        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply).await?;

        match decode_log_reply(Bytes::from(reply))? {
            RESULT_OK => Ok(()),
            RESULT_TRY_LATER => {
                warn!("scribe asked to retry later");
                Ok(())
            }
            other => {
                warn!(code = other, "scribe returned an unknown result code");
                Ok(())
            }
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Builds a framed `Log` call for one batch.
fn encode_log_call(seq: i32, records: &[LogRecord]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(VERSION_1 | MSG_CALL);
    put_string(&mut body, METHOD);
    body.put_i32(seq);

    // argument struct: field 1 is the entry list
    body.put_u8(TYPE_LIST);
    body.put_i16(1);
    body.put_u8(TYPE_STRUCT);
    body.put_i32(records.len() as i32);
    for record in records {
        body.put_u8(TYPE_STRING);
        body.put_i16(1);
        put_string(&mut body, &record.category);
        body.put_u8(TYPE_STRING);
        body.put_i16(2);
        put_string(&mut body, &record.message);
        body.put_u8(TYPE_STOP);
    }
    body.put_u8(TYPE_STOP);

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    frame.freeze()
}

fn need(buf: &Bytes, bytes: usize) -> Result<(), RelayError> {
    if buf.remaining() < bytes {
        return Err(RelayError::Protocol("truncated reply".into()));
    }
    Ok(())
}

/// Parses the result code out of a `Log` reply body.
fn decode_log_reply(mut buf: Bytes) -> Result<i32, RelayError> {
    need(&buf, 4)?;
    let word = buf.get_u32();
    if word & VERSION_MASK != VERSION_1 {
        return Err(RelayError::Protocol(format!(
            "bad reply version word {word:#010x}"
        )));
    }
    let mtype = word & !VERSION_MASK;
    if mtype == MSG_EXCEPTION {
        return Err(RelayError::Protocol("scribe raised an exception".into()));
    }
    if mtype != MSG_REPLY {
        return Err(RelayError::Protocol(format!(
            "unexpected message type {mtype}"
        )));
    }

    need(&buf, 4)?;
    let name_len = buf.get_u32() as usize;
    need(&buf, name_len)?;
    let name = buf.split_to(name_len);
    if &name[..] != METHOD.as_bytes() {
        return Err(RelayError::Protocol("reply names a different method".into()));
    }
    need(&buf, 4)?;
    let _seq = buf.get_i32();

    // result struct: field 0, i32 success code
    need(&buf, 1)?;
    let ftype = buf.get_u8();
    if ftype != TYPE_I32 {
        return Err(RelayError::Protocol(format!(
            "unexpected result field type {ftype}"
        )));
    }
    need(&buf, 2)?;
    let fid = buf.get_i16();
    if fid != 0 {
        return Err(RelayError::Protocol(format!(
            "unexpected result field id {fid}"
        )));
    }
    need(&buf, 4)?;
    Ok(buf.get_i32())
}
