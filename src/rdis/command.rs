//! Turns a parsed RESP array into a typed `Command`, validating arity and
//! argument shape up front so `executor.rs` never has to guess what it was
//! handed.
//!
//! A large command surface (strings, lists, streams, pub/sub, transactions)
//! makes one inline dispatch-and-execute function unworkable, so parsing is
//! split out into its own pass here, matching directly on `&[RESP]` shapes
//! the way a slice-of-bulk-strings dispatcher would.

use bytes::Bytes;

use super::error::{RdisError, RdisResult};
use super::resp::RespValue;

#[derive(Debug, Clone)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Get(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        expire: Option<std::time::Duration>,
    },
    Incr(Bytes),
    Type(Bytes),
    RPush(Bytes, Vec<Bytes>),
    LPush(Bytes, Vec<Bytes>),
    LPop(Bytes, Option<i64>),
    RPop(Bytes, Option<i64>),
    LLen(Bytes),
    LRange(Bytes, i64, i64),
    BLPop {
        keys: Vec<Bytes>,
        timeout_secs: f64,
    },
    XAdd {
        key: Bytes,
        id_spec: String,
        fields: Vec<(Bytes, Bytes)>,
    },
    XRange {
        key: Bytes,
        start: String,
        end: String,
    },
    XRead {
        block_ms: Option<u64>,
        streams: Vec<(Bytes, String)>,
    },
    Multi,
    Exec,
    Discard,
    Subscribe(Vec<Bytes>),
    Unsubscribe(Vec<Bytes>),
    Publish(Bytes, Bytes),
}

/// One frame's worth of reader output: either a successfully parsed command
/// or the text of a command-level parse error. Both variants travel through
/// the same ordered channel to the executor so a bad frame pipelined between
/// two good ones still replies in submission order (spec §8 "Per-connection
/// response order") instead of jumping the queue straight to the socket.
#[derive(Debug, Clone)]
pub enum ParsedItem {
    Command(Command),
    Error(String),
}

/// Flattens a RESP request into the bulk-string arguments a command needs,
/// rejecting anything that isn't the top-level array-of-bulk-strings shape
/// RESP clients actually send.
fn as_args(value: &RespValue) -> RdisResult<Vec<Bytes>> {
    match value {
        RespValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_bytes() {
                    Some(b) => out.push(Bytes::copy_from_slice(b)),
                    None => {
                        return Err(RdisError::Parse(
                            "expected a bulk string argument".into(),
                        ))
                    }
                }
            }
            Ok(out)
        }
        other => match other.as_bytes() {
            Some(b) => Ok(vec![Bytes::copy_from_slice(b)]),
            None => Err(RdisError::Parse("unexpected request shape".into())),
        },
    }
}

fn upper(b: &[u8]) -> Vec<u8> {
    b.to_ascii_uppercase()
}

fn parse_i64_arg(name: &str, b: &Bytes) -> RdisResult<i64> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RdisError::Arg(format!("value is not an integer or out of range ({name})")))
}

fn parse_f64_arg(name: &str, b: &Bytes) -> RdisResult<f64> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| RdisError::Arg(format!("timeout is not a float or out of range ({name})")))
}

pub fn parse_command(value: &RespValue) -> RdisResult<Command> {
    let args = as_args(value)?;
    let (head, rest) = args
        .split_first()
        .ok_or_else(|| RdisError::Parse("empty command".into()))?;
    let rest = rest.to_vec();

    match upper(head).as_slice() {
        b"PING" => match rest.len() {
            0 => Ok(Command::Ping(None)),
            1 => Ok(Command::Ping(Some(rest[0].clone()))),
            _ => arity_error("PING"),
        },
        b"ECHO" => match rest.as_slice() {
            [msg] => Ok(Command::Echo(msg.clone())),
            _ => arity_error("ECHO"),
        },
        b"GET" => match rest.as_slice() {
            [key] => Ok(Command::Get(key.clone())),
            _ => arity_error("GET"),
        },
        b"SET" => parse_set(rest),
        b"INCR" => match rest.as_slice() {
            [key] => Ok(Command::Incr(key.clone())),
            _ => arity_error("INCR"),
        },
        b"TYPE" => match rest.as_slice() {
            [key] => Ok(Command::Type(key.clone())),
            _ => arity_error("TYPE"),
        },
        b"RPUSH" => parse_push(rest, true),
        b"LPUSH" => parse_push(rest, false),
        b"LPOP" => parse_pop(rest),
        b"RPOP" => parse_pop(rest).map(|c| match c {
            Command::LPop(k, n) => Command::RPop(k, n),
            other => other,
        }),
        b"LLEN" => match rest.as_slice() {
            [key] => Ok(Command::LLen(key.clone())),
            _ => arity_error("LLEN"),
        },
        b"LRANGE" => match rest.as_slice() {
            [key, start, end] => Ok(Command::LRange(
                key.clone(),
                parse_i64_arg("start", start)?,
                parse_i64_arg("end", end)?,
            )),
            _ => arity_error("LRANGE"),
        },
        b"BLPOP" => parse_blpop(rest),
        b"XADD" => parse_xadd(rest),
        b"XRANGE" => match rest.as_slice() {
            [key, start, end] => Ok(Command::XRange {
                key: key.clone(),
                start: to_utf8(start)?,
                end: to_utf8(end)?,
            }),
            _ => arity_error("XRANGE"),
        },
        b"XREAD" => parse_xread(rest),
        b"MULTI" => Ok(Command::Multi),
        b"EXEC" => Ok(Command::Exec),
        b"DISCARD" => Ok(Command::Discard),
        b"SUBSCRIBE" => {
            if rest.is_empty() {
                return arity_error("SUBSCRIBE");
            }
            Ok(Command::Subscribe(rest))
        }
        b"UNSUBSCRIBE" => Ok(Command::Unsubscribe(rest)),
        b"PUBLISH" => match rest.as_slice() {
            [channel, message] => Ok(Command::Publish(channel.clone(), message.clone())),
            _ => arity_error("PUBLISH"),
        },
        other => Err(RdisError::Parse(format!(
            "unknown command '{}'",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn arity_error<T>(cmd: &str) -> RdisResult<T> {
    Err(RdisError::Arg(format!(
        "wrong number of arguments for '{}' command",
        cmd.to_ascii_lowercase()
    )))
}

fn to_utf8(b: &Bytes) -> RdisResult<String> {
    std::str::from_utf8(b)
        .map(|s| s.to_owned())
        .map_err(|_| RdisError::Arg("argument must be valid UTF-8".into()))
}

/// `SET key value [EX seconds | PX milliseconds]` — each option has its own
/// arity, so the scanner must advance by the option's own width rather than
/// a flat step of two.
fn parse_set(rest: Vec<Bytes>) -> RdisResult<Command> {
    if rest.len() < 2 {
        return arity_error("SET");
    }
    let key = rest[0].clone();
    let value = rest[1].clone();
    let mut expire = None;
    let mut i = 2;
    while i < rest.len() {
        match upper(&rest[i]).as_slice() {
            b"EX" => {
                let secs = rest
                    .get(i + 1)
                    .ok_or_else(|| RdisError::Arg("syntax error".into()))?;
                let secs = parse_i64_arg("EX", secs)?;
                if secs <= 0 {
                    return Err(RdisError::Arg("invalid expire time in 'set' command".into()));
                }
                expire = Some(std::time::Duration::from_secs(secs as u64));
                i += 2;
            }
            b"PX" => {
                let ms = rest
                    .get(i + 1)
                    .ok_or_else(|| RdisError::Arg("syntax error".into()))?;
                let ms = parse_i64_arg("PX", ms)?;
                if ms <= 0 {
                    return Err(RdisError::Arg("invalid expire time in 'set' command".into()));
                }
                expire = Some(std::time::Duration::from_millis(ms as u64));
                i += 2;
            }
            _ => return Err(RdisError::Arg("syntax error".into())),
        }
    }
    Ok(Command::Set { key, value, expire })
}

fn parse_push(rest: Vec<Bytes>, right: bool) -> RdisResult<Command> {
    if rest.len() < 2 {
        return arity_error(if right { "RPUSH" } else { "LPUSH" });
    }
    let key = rest[0].clone();
    let values = rest[1..].to_vec();
    if right {
        Ok(Command::RPush(key, values))
    } else {
        Ok(Command::LPush(key, values))
    }
}

fn parse_pop(rest: Vec<Bytes>) -> RdisResult<Command> {
    match rest.as_slice() {
        [key] => Ok(Command::LPop(key.clone(), None)),
        [key, count] => Ok(Command::LPop(key.clone(), Some(parse_i64_arg("count", count)?))),
        _ => arity_error("LPOP"),
    }
}

/// `BLPOP key [key ...] timeout` — the last argument is always the timeout.
fn parse_blpop(rest: Vec<Bytes>) -> RdisResult<Command> {
    if rest.len() < 2 {
        return arity_error("BLPOP");
    }
    let (timeout, keys) = rest.split_last().unwrap();
    let timeout_secs = parse_f64_arg("timeout", timeout)?;
    if timeout_secs < 0.0 {
        return Err(RdisError::Arg("timeout is negative".into()));
    }
    Ok(Command::BLPop {
        keys: keys.to_vec(),
        timeout_secs,
    })
}

/// `XADD key ID field value [field value ...]` — fields must come in pairs.
fn parse_xadd(rest: Vec<Bytes>) -> RdisResult<Command> {
    if rest.len() < 4 || (rest.len() - 2) % 2 != 0 {
        return Err(RdisError::Arg("wrong number of arguments for 'xadd' command".into()));
    }
    let key = rest[0].clone();
    let id_spec = to_utf8(&rest[1])?;
    let mut fields = Vec::with_capacity((rest.len() - 2) / 2);
    let mut i = 2;
    while i < rest.len() {
        fields.push((rest[i].clone(), rest[i + 1].clone()));
        i += 2;
    }
    Ok(Command::XAdd {
        key,
        id_spec,
        fields,
    })
}

/// `XREAD [BLOCK milliseconds] STREAMS key [key ...] id [id ...]` — the
/// `STREAMS` keyword is the split point between the key list and the id
/// list, which must be the same length.
fn parse_xread(rest: Vec<Bytes>) -> RdisResult<Command> {
    let mut block_ms = None;
    let mut i = 0;
    if i < rest.len() && upper(&rest[i]) == b"BLOCK" {
        let ms = rest
            .get(i + 1)
            .ok_or_else(|| RdisError::Arg("syntax error".into()))?;
        block_ms = Some(parse_i64_arg("BLOCK", ms)? as u64);
        i += 2;
    }
    if i >= rest.len() || upper(&rest[i]) != b"STREAMS" {
        return Err(RdisError::Arg("syntax error".into()));
    }
    i += 1;
    let remaining = &rest[i..];
    if remaining.is_empty() || remaining.len() % 2 != 0 {
        return Err(RdisError::Arg(
            "Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified."
                .into(),
        ));
    }
    let n = remaining.len() / 2;
    let mut streams = Vec::with_capacity(n);
    for k in 0..n {
        let key = remaining[k].clone();
        let id = to_utf8(&remaining[n + k])?;
        streams.push((key, id));
    }
    Ok(Command::XRead { block_ms, streams })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(parts: &[&str]) -> RespValue {
        RespValue::Array(parts.iter().map(|p| RespValue::bulk(p.as_bytes())).collect())
    }

    #[test]
    fn parses_ping_with_and_without_message() {
        assert!(matches!(
            parse_command(&arr(&["PING"])).unwrap(),
            Command::Ping(None)
        ));
        assert!(matches!(
            parse_command(&arr(&["PING", "hi"])).unwrap(),
            Command::Ping(Some(_))
        ));
    }

    #[test]
    fn set_parses_ex_option() {
        let cmd = parse_command(&arr(&["SET", "k", "v", "EX", "10"])).unwrap();
        match cmd {
            Command::Set { expire, .. } => {
                assert_eq!(expire, Some(std::time::Duration::from_secs(10)))
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn set_rejects_unknown_option() {
        assert!(parse_command(&arr(&["SET", "k", "v", "NX"])).is_err());
    }

    #[test]
    fn xadd_requires_paired_fields() {
        assert!(parse_command(&arr(&["XADD", "s", "*", "field"])).is_err());
        assert!(parse_command(&arr(&["XADD", "s", "*", "field", "value"])).is_ok());
    }

    #[test]
    fn xread_splits_streams_keyword_into_balanced_halves() {
        let cmd = parse_command(&arr(&["XREAD", "STREAMS", "a", "b", "0", "0"])).unwrap();
        match cmd {
            Command::XRead { streams, block_ms } => {
                assert_eq!(block_ms, None);
                assert_eq!(streams.len(), 2);
                assert_eq!(streams[0].1, "0");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn xread_rejects_unbalanced_streams() {
        assert!(parse_command(&arr(&["XREAD", "STREAMS", "a", "b", "0"])).is_err());
    }

    #[test]
    fn blpop_last_argument_is_timeout() {
        let cmd = parse_command(&arr(&["BLPOP", "a", "b", "1.5"])).unwrap();
        match cmd {
            Command::BLPop { keys, timeout_secs } => {
                assert_eq!(keys.len(), 2);
                assert!((timeout_secs - 1.5).abs() < f64::EPSILON);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_is_a_parse_error() {
        assert!(parse_command(&arr(&["NOTACOMMAND"])).is_err());
    }
}
