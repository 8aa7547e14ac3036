//! The flat key/value store: scalars with lazy expiry, plus lists.
//!
//! A plain `HashMap` the single executor task owns outright, no locking.
//! One deadline per entry, checked lazily on read rather than an active
//! sweeper.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::error::{RdisError, RdisResult};
use super::resp::RespValue;

#[derive(Debug, Clone)]
pub enum StoredValue {
    Scalar(RespValue),
    List(VecDeque<Bytes>),
    /// No command in the surface populates this; kept so `TYPE` and the
    /// generic store contract stay complete if a future command needs it.
    Set(Vec<Bytes>),
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoredValue::Scalar(_) => "string",
            StoredValue::List(_) => "array",
            StoredValue::Set(_) => "set",
        }
    }
}

struct Entry {
    value: StoredValue,
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct SetParams {
    pub expiry: Option<Duration>,
}

pub struct Store {
    entries: HashMap<Bytes, Entry>,
}

impl Store {
    pub fn new() -> Store {
        Store {
            entries: HashMap::with_capacity(4096),
        }
    }

    fn is_live(entry: &Entry, now: Instant) -> bool {
        entry.deadline.map_or(true, |d| d >= now)
    }

    /// Removes `key` if it is present but expired. Every other accessor
    /// calls this first, which is the only expiry mechanism in the system.
    fn evict_if_expired(&mut self, key: &[u8]) {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .map_or(false, |e| !Self::is_live(e, now));
        if expired {
            self.entries.remove(key);
        }
    }

    pub fn type_name(&mut self, key: &[u8]) -> &'static str {
        self.evict_if_expired(key);
        self.entries.get(key).map_or("none", |e| e.value.type_name())
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.evict_if_expired(key);
        self.entries.contains_key(key)
    }

    /// `GET`: absent/expired/list/set all surface distinctly to the caller
    /// (the executor turns list/set into `WRONGTYPE`, absent into `Null`).
    pub fn get_scalar(&mut self, key: &[u8]) -> RdisResult<Option<RespValue>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::Scalar(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(RdisError::Type("value is not a string".into())),
        }
    }

    pub fn set_scalar(&mut self, key: Bytes, value: RespValue, params: SetParams) {
        let deadline = params.expiry.map(|d| Instant::now() + d);
        self.entries.insert(key, Entry {
            value: StoredValue::Scalar(value),
            deadline,
        });
    }

    /// `INCR`: absent key starts at 1; a bulk/simple string that parses as a
    /// base-10 integer is incremented and re-stored as a bulk string,
    /// matching the source rather than introducing a distinct integer
    /// representation (see DESIGN.md).
    pub fn incr(&mut self, key: &[u8]) -> RdisResult<i64> {
        self.evict_if_expired(key);
        let next = match self.entries.get(key) {
            None => 1,
            Some(Entry {
                value: StoredValue::Scalar(v),
                ..
            }) => {
                let text = v
                    .as_bytes()
                    .ok_or_else(|| {
                        RdisError::Arg("value is not an integer or out of range".into())
                    })?;
                let s = std::str::from_utf8(text)
                    .map_err(|_| RdisError::Arg("value is not an integer or out of range".into()))?;
                let n: i64 = s
                    .parse()
                    .map_err(|_| RdisError::Arg("value is not an integer or out of range".into()))?;
                n.checked_add(1)
                    .ok_or_else(|| RdisError::Arg("value is not an integer or out of range".into()))?
            }
            Some(_) => return Err(RdisError::Type("value is not a string".into())),
        };
        let deadline = self.entries.get(key).and_then(|e| e.deadline);
        self.entries.insert(
            key.to_vec().into(),
            Entry {
                value: StoredValue::Scalar(RespValue::bulk(next.to_string())),
                deadline,
            },
        );
        Ok(next)
    }

    fn list_mut(&mut self, key: &[u8]) -> RdisResult<Option<&mut VecDeque<Bytes>>> {
        self.evict_if_expired(key);
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: StoredValue::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => Err(RdisError::Type("value is not a list".into())),
        }
    }

    fn list_or_create(&mut self, key: &Bytes) -> RdisResult<&mut VecDeque<Bytes>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(Entry {
                value: StoredValue::List(_),
                ..
            })
            | None => {}
            Some(_) => return Err(RdisError::Type("value is not a list".into())),
        }
        let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
            value: StoredValue::List(VecDeque::new()),
            deadline: None,
        });
        match &mut entry.value {
            StoredValue::List(l) => Ok(l),
            _ => unreachable!("checked above"),
        }
    }

    /// Appends in argument order; returns the list's new length.
    pub fn rpush(&mut self, key: Bytes, values: Vec<Bytes>) -> RdisResult<usize> {
        let list = self.list_or_create(&key)?;
        list.extend(values);
        Ok(list.len())
    }

    /// Prepends in argument order, so `LPUSH k a b` leaves the list `[b, a, ...]`.
    pub fn lpush(&mut self, key: Bytes, values: Vec<Bytes>) -> RdisResult<usize> {
        let list = self.list_or_create(&key)?;
        for v in values {
            list.push_front(v);
        }
        Ok(list.len())
    }

    pub fn llen(&mut self, key: &[u8]) -> RdisResult<usize> {
        Ok(self.list_mut(key)?.map_or(0, |l| l.len()))
    }

    pub fn lpop_front(&mut self, key: &[u8]) -> RdisResult<Option<Bytes>> {
        Ok(self.list_mut(key)?.and_then(|l| l.pop_front()))
    }

    /// `count == 1` pops one element (`None` if the list is absent/empty);
    /// `count > 1` pops that many, or returns `None` if `count` exceeds the
    /// list's length or is non-positive — see DESIGN.md for why this departs
    /// from standard Redis's shorter-array behavior.
    pub fn lpop_count(&mut self, key: &[u8], count: i64) -> RdisResult<Option<Vec<Bytes>>> {
        pop_count(self.list_mut(key)?, count, true)
    }

    pub fn rpop_count(&mut self, key: &[u8], count: i64) -> RdisResult<Option<Vec<Bytes>>> {
        pop_count(self.list_mut(key)?, count, false)
    }

    /// Standard Redis index semantics: negative indices count from the end,
    /// `end` is inclusive, and both bounds clamp into `[0, len)`.
    pub fn lrange(&mut self, key: &[u8], start: i64, end: i64) -> RdisResult<Vec<Bytes>> {
        let list = match self.list_mut(key)? {
            None => return Ok(Vec::new()),
            Some(l) => l,
        };
        let len = list.len() as i64;
        if len == 0 {
            return Ok(Vec::new());
        }
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let start = norm(start).min(len - 1).max(0);
        let end = norm(end).min(len - 1);
        if end < start {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((end - start + 1) as usize)
            .cloned()
            .collect())
    }
}

fn pop_count(
    list: Option<&mut VecDeque<Bytes>>,
    count: i64,
    from_front: bool,
) -> RdisResult<Option<Vec<Bytes>>> {
    let list = match list {
        None => return Ok(None),
        Some(l) => l,
    };
    if count <= 0 || count as usize > list.len() {
        return Ok(None);
    }
    let n = count as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let v = if from_front {
            list.pop_front()
        } else {
            list.pop_back()
        };
        out.push(v.expect("length checked above"));
    }
    Ok(Some(out))
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}
