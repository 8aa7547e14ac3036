//! The `RespValue` tagged union and its asynchronous writer.
//!
//! Mirrors the parser in `parser.rs`: every variant here has a matching
//! branch in `Parser::read_value`, and `write_async` is the exact inverse of
//! that branch.

use std::sync::Arc;

use async_recursion::async_recursion;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::error::{RdisError, RdisResult};

const CRLF: &[u8; 2] = b"\r\n";

/// A format tag for `VerbatimString`, always exactly 3 ASCII bytes (e.g. `txt`, `mkd`).
pub type VerbatimFormat = [u8; 3];

/// Typed RESP2/RESP3 value. Bulk payloads are raw bytes end to end — never a
/// lossy `String` conversion — so arbitrary binary values round-trip intact.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(Bytes),
    SimpleError(Bytes),
    Integer(i64),
    /// `None` encodes the RESP2 `$-1\r\n` null bulk string.
    BulkString(Option<Bytes>),
    Array(Vec<RespValue>),
    Bool(bool),
    Double(f64),
    /// Decimal digits, stored verbatim (sign optional, no validation beyond framing).
    BigNumber(Bytes),
    BulkError(Bytes),
    VerbatimString(VerbatimFormat, Bytes),
    /// Insertion order is preserved because it matters for wire re-encoding.
    Map(Vec<(RespValue, RespValue)>),
    Attributes(Vec<(RespValue, RespValue)>),
    Set(Vec<RespValue>),
    Push(Vec<RespValue>),
    Null,
    NullArray,
    /// Suppresses a reply entirely (client is now blocked). Never written to the wire.
    NoResponse,
}

impl RespValue {
    pub fn ok() -> RespValue {
        RespValue::SimpleString(Bytes::from_static(b"OK"))
    }

    pub fn simple(s: impl Into<Vec<u8>>) -> RespValue {
        RespValue::SimpleString(Bytes::from(s.into()))
    }

    pub fn error(s: impl Into<Vec<u8>>) -> RespValue {
        RespValue::SimpleError(Bytes::from(s.into()))
    }

    pub fn bulk(b: impl Into<Vec<u8>>) -> RespValue {
        RespValue::BulkString(Some(Bytes::from(b.into())))
    }

    pub fn int(i: i64) -> RespValue {
        RespValue::Integer(i)
    }

    /// Best-effort bytes view for commands that want to treat a scalar reply
    /// as a key or argument (used by the command parser on client-sent values,
    /// never on server responses).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(Some(b)) => Some(b),
            RespValue::SimpleString(b) => Some(b),
            RespValue::BulkError(b) => Some(b),
            RespValue::BigNumber(b) => Some(b),
            _ => None,
        }
    }

    /// Recursively writes this value to `writer`, flushing only when `flush`
    /// is set — a connection draining a pipeline of several frames flushes
    /// once after the last one.
    #[async_recursion]
    pub async fn write_async<W>(&self, writer: &mut W, flush: bool) -> RdisResult<()>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        {
            match self {
                RespValue::SimpleString(s) => {
                    writer.write_u8(b'+').await?;
                    writer.write_all(s).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::SimpleError(s) => {
                    writer.write_u8(b'-').await?;
                    writer.write_all(s).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::Integer(i) => {
                    writer.write_u8(b':').await?;
                    writer.write_all(i.to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::BulkString(None) => {
                    writer.write_all(b"$-1").await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::BulkString(Some(b)) => {
                    writer.write_u8(b'$').await?;
                    writer.write_all(b.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    writer.write_all(b).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::Array(items) => {
                    writer.write_u8(b'*').await?;
                    writer.write_all(items.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    for item in items {
                        item.write_async(writer, false).await?;
                    }
                }
                RespValue::Bool(b) => {
                    writer.write_u8(b'#').await?;
                    writer.write_u8(if *b { b't' } else { b'f' }).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::Double(d) => {
                    if !d.is_finite() {
                        return Err(RdisError::Protocol(
                            "cannot write a non-finite double".into(),
                        ));
                    }
                    writer.write_u8(b',').await?;
                    writer.write_all(format_double(*d).as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::BigNumber(digits) => {
                    writer.write_u8(b'(').await?;
                    writer.write_all(digits).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::BulkError(b) => {
                    writer.write_u8(b'!').await?;
                    writer.write_all(b.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    writer.write_all(b).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::VerbatimString(fmt, b) => {
                    writer.write_u8(b'=').await?;
                    writer
                        .write_all((b.len() + 4).to_string().as_bytes())
                        .await?;
                    writer.write_all(CRLF).await?;
                    writer.write_all(fmt).await?;
                    writer.write_u8(b':').await?;
                    writer.write_all(b).await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::Map(pairs) => {
                    writer.write_u8(b'%').await?;
                    writer.write_all(pairs.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    for (k, v) in pairs {
                        k.write_async(writer, false).await?;
                        v.write_async(writer, false).await?;
                    }
                }
                RespValue::Attributes(pairs) => {
                    writer.write_u8(b'|').await?;
                    writer.write_all(pairs.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    for (k, v) in pairs {
                        k.write_async(writer, false).await?;
                        v.write_async(writer, false).await?;
                    }
                }
                RespValue::Set(items) => {
                    writer.write_u8(b'~').await?;
                    writer.write_all(items.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    for item in items {
                        item.write_async(writer, false).await?;
                    }
                }
                RespValue::Push(items) => {
                    writer.write_u8(b'>').await?;
                    writer.write_all(items.len().to_string().as_bytes()).await?;
                    writer.write_all(CRLF).await?;
                    for item in items {
                        item.write_async(writer, false).await?;
                    }
                }
                RespValue::Null => {
                    // Legacy RESP2 null bulk string, not the RESP3 `_\r\n` marker,
                    // kept for compatibility with RESP2-only clients.
                    writer.write_all(b"$-1").await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::NullArray => {
                    writer.write_all(b"*-1").await?;
                    writer.write_all(CRLF).await?;
                }
                RespValue::NoResponse => {}
            }
        }
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }
}

fn format_double(d: f64) -> String {
    if d == d.trunc() && d.abs() < 1e17 {
        format!("{}", d as i64)
    } else {
        format!("{}", d)
    }
}

/// A batch of values to write to one connection, produced by a single parsed
/// client request (which may itself have been a pipeline of several frames).
pub type ResponseBatch = Vec<RespValue>;

/// Shared, cheaply-clonable handle to a value stored once but referenced from
/// several aggregate replies (list pops fan out a single pushed element to at
/// most one waiter, but list contents themselves are cloned per read).
pub type SharedBytes = Arc<Bytes>;
