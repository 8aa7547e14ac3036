//! A depth/size-bounded, incremental RESP2/RESP3 parser.
//!
//! `nom` handles the leaf token parsing (decimal lengths, signs); the
//! overall recursive descent is driven by hand so every recursive call
//! carries a depth counter and every length-prefixed read is checked
//! against its bound before being believed.

use bytes::{Buf, Bytes, BytesMut};
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, opt};
use nom::sequence::tuple;

use super::error::{RdisError, RdisResult};
use super::resp::RespValue;

/// Header/token lines (decimal lengths, signs, single-char bodies) are never
/// legitimately longer than this; a longer one before any CRLF is malformed,
/// not merely "not yet complete".
const MAX_HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_depth: usize,
    pub max_collection_size: usize,
    pub max_string_length: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        ParserLimits {
            max_depth: 1000,
            max_collection_size: 1_000_000,
            max_string_length: 512 * 1024 * 1024,
        }
    }
}

/// Buffers incoming bytes and yields complete `RespValue` frames. One
/// instance per connection: owns a `BytesMut` and re-polls the socket
/// when a frame is incomplete.
pub struct Parser {
    buf: BytesMut,
    limits: ParserLimits,
}

impl Parser {
    pub fn new(limits: ParserLimits) -> Parser {
        Parser {
            buf: BytesMut::with_capacity(4096),
            limits,
        }
    }

    /// Direct access to the read buffer so the connection's reader task can
    /// fill it from the socket with `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Attempts to parse one frame out of the buffered bytes. Returns `Ok(None)`
    /// when more bytes are needed; the already-buffered prefix is left intact.
    pub fn try_parse(&mut self) -> RdisResult<Option<RespValue>> {
        match parse_value(&self.buf, 0, &self.limits)? {
            None => Ok(None),
            Some((value, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
        }
    }
}

fn find_crlf_bounded(buf: &[u8], bound: usize) -> RdisResult<Option<usize>> {
    let scan_len = buf.len().min(bound.saturating_add(1));
    for (i, b) in buf[..scan_len].iter().enumerate() {
        if *b == b'\r' {
            return match buf.get(i + 1) {
                Some(b'\n') => Ok(Some(i)),
                Some(_) => Err(RdisError::Protocol("CR not followed by LF".into())),
                None => Ok(None),
            };
        }
    }
    if buf.len() > bound {
        Err(RdisError::Protocol("line exceeds maximum length".into()))
    } else {
        Ok(None)
    }
}

fn line_frame(
    rest: &[u8],
    bound: usize,
    make: impl FnOnce(&[u8]) -> RdisResult<RespValue>,
) -> RdisResult<Option<(RespValue, usize)>> {
    match find_crlf_bounded(rest, bound)? {
        None => Ok(None),
        Some(idx) => Ok(Some((make(&rest[..idx])?, idx + 2))),
    }
}

fn read_count_header(rest: &[u8]) -> RdisResult<Option<(i64, usize)>> {
    match find_crlf_bounded(rest, MAX_HEADER_LEN)? {
        None => Ok(None),
        Some(idx) => Ok(Some((parse_i64(&rest[..idx])?, idx + 2))),
    }
}

fn parse_i64(bytes: &[u8]) -> RdisResult<i64> {
    let parsed = all_consuming(tuple((opt(char('-')), digit1)))(bytes);
    match parsed {
        Ok((_, (minus, digits))) => {
            let s = std::str::from_utf8(digits)
                .map_err(|_| RdisError::Protocol("invalid integer".into()))?;
            let n: i64 = s
                .parse()
                .map_err(|_| RdisError::Protocol("invalid integer".into()))?;
            Ok(if minus.is_some() { -n } else { n })
        }
        Err(_) => Err(RdisError::Protocol("invalid integer".into())),
    }
}

fn parse_f64(bytes: &[u8]) -> RdisResult<f64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d: &f64| d.is_finite())
        .ok_or_else(|| RdisError::Protocol("invalid double".into()))
}

/// Parses one value starting at `buf[0]` (the type marker). Returns the
/// value plus the number of bytes of `buf` it consumed, or `None` if `buf`
/// doesn't yet contain a complete frame.
fn parse_value(
    buf: &[u8],
    depth: usize,
    limits: &ParserLimits,
) -> RdisResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if depth > limits.max_depth {
        return Err(RdisError::Protocol(format!(
            "max depth {} exceeded",
            limits.max_depth
        )));
    }
    let marker = buf[0];
    let rest = &buf[1..];
    let result = match marker {
        b'+' => line_frame(rest, limits.max_string_length, |l| {
            Ok(RespValue::SimpleString(Bytes::copy_from_slice(l)))
        }),
        b'-' => line_frame(rest, limits.max_string_length, |l| {
            Ok(RespValue::SimpleError(Bytes::copy_from_slice(l)))
        }),
        b'(' => line_frame(rest, limits.max_string_length, |l| {
            Ok(RespValue::BigNumber(Bytes::copy_from_slice(l)))
        }),
        b':' => line_frame(rest, MAX_HEADER_LEN, |l| Ok(RespValue::Integer(parse_i64(l)?))),
        b',' => line_frame(rest, MAX_HEADER_LEN, |l| Ok(RespValue::Double(parse_f64(l)?))),
        b'#' => line_frame(rest, MAX_HEADER_LEN, |l| match l {
            b"t" => Ok(RespValue::Bool(true)),
            b"f" => Ok(RespValue::Bool(false)),
            _ => Err(RdisError::Protocol("invalid boolean literal".into())),
        }),
        b'_' => line_frame(rest, MAX_HEADER_LEN, |l| {
            if l.is_empty() {
                Ok(RespValue::Null)
            } else {
                Err(RdisError::Protocol("malformed null".into()))
            }
        }),
        b'$' => parse_bulk(rest, limits),
        b'!' => parse_bulk_error(rest, limits),
        b'=' => parse_verbatim(rest, limits),
        b'*' => parse_array(rest, depth, limits),
        b'~' => parse_flat_aggregate(rest, depth, limits, 1).map(|o| o.map(|(v, n)| (RespValue::Set(v), n))),
        b'>' => parse_flat_aggregate(rest, depth, limits, 1).map(|o| o.map(|(v, n)| (RespValue::Push(v), n))),
        b'%' => parse_flat_aggregate(rest, depth, limits, 2)
            .map(|o| o.map(|(v, n)| (RespValue::Map(into_pairs(v)), n))),
        b'|' => parse_flat_aggregate(rest, depth, limits, 2)
            .map(|o| o.map(|(v, n)| (RespValue::Attributes(into_pairs(v)), n))),
        _ => {
            if depth == 0 {
                return parse_inline(buf, limits);
            }
            Err(RdisError::Protocol(format!(
                "unknown RESP type byte {:#x}",
                marker
            )))
        }
    }?;
    Ok(result.map(|(value, consumed)| (value, consumed + 1)))
}

fn into_pairs(flat: Vec<RespValue>) -> Vec<(RespValue, RespValue)> {
    let mut pairs = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    pairs
}

fn parse_bulk(rest: &[u8], limits: &ParserLimits) -> RdisResult<Option<(RespValue, usize)>> {
    match read_count_header(rest)? {
        None => Ok(None),
        Some((len, header_consumed)) => {
            if len == -1 {
                return Ok(Some((RespValue::BulkString(None), header_consumed)));
            }
            if len < -1 {
                return Err(RdisError::Protocol("negative bulk string length".into()));
            }
            let n = len as usize;
            if n > limits.max_string_length {
                return Err(RdisError::Protocol(
                    "bulk string exceeds max string length".into(),
                ));
            }
            let total = header_consumed + n + 2;
            if rest.len() < total {
                return Ok(None);
            }
            if &rest[header_consumed + n..total] != b"\r\n" {
                return Err(RdisError::Protocol(
                    "missing CRLF after bulk string body".into(),
                ));
            }
            let data = Bytes::copy_from_slice(&rest[header_consumed..header_consumed + n]);
            Ok(Some((RespValue::BulkString(Some(data)), total)))
        }
    }
}

fn parse_bulk_error(rest: &[u8], limits: &ParserLimits) -> RdisResult<Option<(RespValue, usize)>> {
    match read_count_header(rest)? {
        None => Ok(None),
        Some((len, header_consumed)) => {
            if len < 0 {
                return Err(RdisError::Protocol("negative bulk error length".into()));
            }
            let n = len as usize;
            if n > limits.max_string_length {
                return Err(RdisError::Protocol(
                    "bulk error exceeds max string length".into(),
                ));
            }
            let total = header_consumed + n + 2;
            if rest.len() < total {
                return Ok(None);
            }
            if &rest[header_consumed + n..total] != b"\r\n" {
                return Err(RdisError::Protocol(
                    "missing CRLF after bulk error body".into(),
                ));
            }
            let data = Bytes::copy_from_slice(&rest[header_consumed..header_consumed + n]);
            Ok(Some((RespValue::BulkError(data), total)))
        }
    }
}

fn parse_verbatim(rest: &[u8], limits: &ParserLimits) -> RdisResult<Option<(RespValue, usize)>> {
    match read_count_header(rest)? {
        None => Ok(None),
        Some((len, header_consumed)) => {
            if len < 4 {
                return Err(RdisError::Protocol(
                    "verbatim string length too short for a format tag".into(),
                ));
            }
            let n = len as usize;
            if n > limits.max_string_length {
                return Err(RdisError::Protocol(
                    "verbatim string exceeds max string length".into(),
                ));
            }
            let total = header_consumed + n + 2;
            if rest.len() < total {
                return Ok(None);
            }
            let body = &rest[header_consumed..header_consumed + n];
            if body[3] != b':' {
                return Err(RdisError::Protocol(
                    "malformed verbatim string format tag".into(),
                ));
            }
            if &rest[header_consumed + n..total] != b"\r\n" {
                return Err(RdisError::Protocol(
                    "missing CRLF after verbatim string body".into(),
                ));
            }
            let mut fmt = [0u8; 3];
            fmt.copy_from_slice(&body[0..3]);
            let payload = Bytes::copy_from_slice(&body[4..]);
            Ok(Some((RespValue::VerbatimString(fmt, payload), total)))
        }
    }
}

fn parse_array(
    rest: &[u8],
    depth: usize,
    limits: &ParserLimits,
) -> RdisResult<Option<(RespValue, usize)>> {
    match read_count_header(rest)? {
        None => Ok(None),
        Some((-1, header_consumed)) => Ok(Some((RespValue::NullArray, header_consumed))),
        Some((count, _)) if count < -1 => Err(RdisError::Protocol("negative array length".into())),
        Some(_) => parse_flat_aggregate(rest, depth, limits, 1)
            .map(|o| o.map(|(v, n)| (RespValue::Array(v), n))),
    }
}

/// Parses a count header followed by `count * item_multiplier` sub-values.
/// `count` itself (not the multiplied total) is what's checked against
/// `max_collection_size` — a map's element count is its pair count, not its
/// field count.
fn parse_flat_aggregate(
    rest: &[u8],
    depth: usize,
    limits: &ParserLimits,
    item_multiplier: usize,
) -> RdisResult<Option<(Vec<RespValue>, usize)>> {
    match read_count_header(rest)? {
        None => Ok(None),
        Some((count, header_consumed)) => {
            if count < 0 {
                return Err(RdisError::Protocol("negative aggregate count".into()));
            }
            let declared = count as usize;
            if declared > limits.max_collection_size {
                return Err(RdisError::Protocol(format!(
                    "aggregate count {} exceeds max collection size {}",
                    declared, limits.max_collection_size
                )));
            }
            let total_items = declared * item_multiplier;
            let mut items = Vec::with_capacity(total_items);
            let mut offset = header_consumed;
            for _ in 0..total_items {
                match parse_value(&rest[offset..], depth + 1, limits)? {
                    None => return Ok(None),
                    Some((value, consumed)) => {
                        items.push(value);
                        offset += consumed;
                    }
                }
            }
            Ok(Some((items, offset)))
        }
    }
}

/// Lenient top-level fallback for plain-text clients: a line with no type
/// marker is split on spaces and treated as a command array of bulk
/// strings. Only reachable at `depth == 0` — never inside an aggregate.
fn parse_inline(buf: &[u8], limits: &ParserLimits) -> RdisResult<Option<(RespValue, usize)>> {
    match find_crlf_bounded(buf, limits.max_string_length)? {
        None => Ok(None),
        Some(idx) => {
            let line = &buf[..idx];
            let tokens: Vec<&[u8]> = line
                .split(|b| *b == b' ')
                .filter(|tok| !tok.is_empty())
                .collect();
            if tokens.is_empty() {
                return Err(RdisError::Protocol("empty inline command".into()));
            }
            if tokens.len() > limits.max_collection_size {
                return Err(RdisError::Protocol(
                    "inline command exceeds max collection size".into(),
                ));
            }
            let items = tokens
                .into_iter()
                .map(|t| RespValue::BulkString(Some(Bytes::copy_from_slice(t))))
                .collect();
            Ok(Some((RespValue::Array(items), idx + 2)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(mut input: &[u8]) -> Vec<RespValue> {
        let limits = ParserLimits::default();
        let mut out = Vec::new();
        while !input.is_empty() {
            match parse_value(input, 0, &limits).unwrap() {
                Some((v, consumed)) => {
                    out.push(v);
                    input = &input[consumed..];
                }
                None => break,
            }
        }
        out
    }

    #[test]
    fn parses_simple_string() {
        let v = parse_all(b"+OK\r\n");
        assert_eq!(v, vec![RespValue::simple("OK")]);
    }

    #[test]
    fn parses_bulk_string() {
        let v = parse_all(b"$5\r\nhello\r\n");
        assert_eq!(v, vec![RespValue::bulk("hello")]);
    }

    #[test]
    fn parses_null_bulk_string() {
        let v = parse_all(b"$-1\r\n");
        assert_eq!(v, vec![RespValue::BulkString(None)]);
    }

    #[test]
    fn parses_integer_and_negative_integer() {
        assert_eq!(parse_all(b":299\r\n"), vec![RespValue::Integer(299)]);
        assert_eq!(parse_all(b":-299\r\n"), vec![RespValue::Integer(-299)]);
    }

    #[test]
    fn parses_array() {
        let v = parse_all(b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n");
        assert_eq!(
            v,
            vec![RespValue::Array(vec![
                RespValue::bulk("hello"),
                RespValue::bulk("world")
            ])]
        );
    }

    #[test]
    fn parses_empty_array() {
        assert_eq!(parse_all(b"*0\r\n"), vec![RespValue::Array(vec![])]);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let limits = ParserLimits::default();
        assert_eq!(parse_value(b"$5\r\nhel", 0, &limits).unwrap(), None);
        assert_eq!(parse_value(b"*2\r\n$1\r\na\r\n", 0, &limits).unwrap(), None);
    }

    #[test]
    fn cr_without_lf_is_fatal() {
        let limits = ParserLimits::default();
        assert!(parse_value(b"+OK\rX", 0, &limits).is_err());
    }

    #[test]
    fn unknown_marker_is_fatal_when_nested() {
        let limits = ParserLimits::default();
        assert!(parse_value(b"*1\r\n^nope\r\n", 0, &limits).is_err());
    }

    #[test]
    fn rejects_collection_size_over_limit() {
        let limits = ParserLimits {
            max_collection_size: 2,
            ..ParserLimits::default()
        };
        let err = parse_value(b"*3\r\n:1\r\n:2\r\n:3\r\n", 0, &limits).unwrap_err();
        assert!(matches!(err, RdisError::Protocol(_)));
    }

    #[test]
    fn rejects_string_length_over_limit() {
        let limits = ParserLimits {
            max_string_length: 4,
            ..ParserLimits::default()
        };
        let err = parse_value(b"$10\r\n0123456789\r\n", 0, &limits).unwrap_err();
        assert!(matches!(err, RdisError::Protocol(_)));
    }

    #[test]
    fn rejects_depth_over_limit() {
        let limits = ParserLimits {
            max_depth: 1,
            ..ParserLimits::default()
        };
        let err = parse_value(b"*1\r\n*1\r\n*1\r\n:1\r\n", 0, &limits).unwrap_err();
        assert!(matches!(err, RdisError::Protocol(_)));
    }

    #[test]
    fn parses_map_as_ordered_pairs() {
        let v = parse_all(b"%1\r\n$1\r\nk\r\n:1\r\n");
        assert_eq!(
            v,
            vec![RespValue::Map(vec![(RespValue::bulk("k"), RespValue::Integer(1))])]
        );
    }

    #[test]
    fn parses_bool_double_and_null() {
        assert_eq!(parse_all(b"#t\r\n"), vec![RespValue::Bool(true)]);
        assert_eq!(parse_all(b"#f\r\n"), vec![RespValue::Bool(false)]);
        assert_eq!(parse_all(b",3.5\r\n"), vec![RespValue::Double(3.5)]);
        assert_eq!(parse_all(b"_\r\n"), vec![RespValue::Null]);
    }

    #[test]
    fn parses_verbatim_string() {
        let v = parse_all(b"=6\r\ntxt:hi\r\n");
        assert_eq!(
            v,
            vec![RespValue::VerbatimString(*b"txt", Bytes::from_static(b"hi"))]
        );
    }

    #[test]
    fn parses_lenient_inline_command() {
        let v = parse_all(b"PING\r\n");
        assert_eq!(v, vec![RespValue::Array(vec![RespValue::bulk("PING")])]);
    }

    #[test]
    fn parses_pipelined_frames_in_one_buffer() {
        let v = parse_all(b"+OK\r\n:1\r\n");
        assert_eq!(v, vec![RespValue::simple("OK"), RespValue::Integer(1)]);
    }
}
