//! The single executor task: owns every mutable piece of server state and
//! is the only place that ever mutates it.
//!
//! Replies are pushed to a per-connection outbound queue rather than a
//! paired oneshot, so a command issued by client A (XADD, RPUSH) can wake a
//! reply destined for client B. The loop multiplexes a timer against the
//! request channel to expire blocked waiters, capped at 100ms.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::blocked::{BlockedRegistry, ClientId, WaitKind};
use super::command::{Command, ParsedItem};
use super::error::RdisError;
use super::pubsub::PubSub;
use super::resp::RespValue;
use super::store::{SetParams, Store};
use super::streams::{parse_range_bound, Stream, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Standard,
    Multi,
    Subscribed,
}

struct ClientState {
    outbound: mpsc::UnboundedSender<RespValue>,
    mode: Mode,
    multi_queue: Vec<Command>,
    /// Set while the client is blocked on `XREAD BLOCK`: the exact
    /// `(key, thresholdId)` pairs it's waiting to see new entries past.
    /// `"$"` is resolved to the stream's current max id at block time, not
    /// wake time.
    pending_xread: Option<Vec<(Bytes, StreamId)>>,
}

pub enum EngineMessage {
    Connect(ClientId, mpsc::UnboundedSender<RespValue>),
    Disconnect(ClientId),
    Commands(ClientId, Vec<ParsedItem>),
}

pub struct Executor {
    store: Store,
    streams: HashMap<Bytes, Stream>,
    blocked: BlockedRegistry,
    pubsub: PubSub,
    clients: HashMap<ClientId, ClientState>,
    inbound: mpsc::Receiver<EngineMessage>,
}

impl Executor {
    pub fn new(inbound: mpsc::Receiver<EngineMessage>) -> Executor {
        Executor {
            store: Store::new(),
            streams: HashMap::new(),
            blocked: BlockedRegistry::new(),
            pubsub: PubSub::new(),
            clients: HashMap::new(),
            inbound,
        }
    }

    pub async fn run(mut self) {
        loop {
            let now = Instant::now();
            let cap = now + Duration::from_millis(100);
            let wake_at = self.blocked.earliest_timeout().map(|t| t.min(cap)).unwrap_or(cap);

            tokio::select! {
                msg = self.inbound.recv() => {
                    match msg {
                        Some(EngineMessage::Connect(id, tx)) => {
                            self.clients.insert(
                                id,
                                ClientState {
                                    outbound: tx,
                                    mode: Mode::Standard,
                                    multi_queue: Vec::new(),
                                    pending_xread: None,
                                },
                            );
                        }
                        Some(EngineMessage::Disconnect(id)) => {
                            self.blocked.unblock(id);
                            self.pubsub.unsubscribe_all(id);
                            self.clients.remove(&id);
                        }
                        Some(EngineMessage::Commands(id, items)) => {
                            for item in items {
                                match item {
                                    ParsedItem::Command(cmd) => self.handle_one(id, cmd),
                                    ParsedItem::Error(msg) => self.send_to(id, RespValue::error(msg)),
                                }
                            }
                        }
                        None => return,
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            self.expire_waiters();
        }
    }

    fn expire_waiters(&mut self) {
        let expired = self.blocked.expire_before(Instant::now());
        for (client, kind) in expired {
            if let Some(state) = self.clients.get_mut(&client) {
                state.pending_xread = None;
            }
            let reply = match kind {
                WaitKind::ListPop => RespValue::NullArray,
                WaitKind::StreamRead => RespValue::NullArray,
            };
            debug!("waiter {} expired ({:?})", client, kind);
            self.send_to(client, reply);
        }
    }

    fn send_to(&self, client: ClientId, value: RespValue) {
        if let Some(state) = self.clients.get(&client) {
            if state.outbound.send(value).is_err() {
                warn!("dropped reply for client {}: outbound channel closed", client);
            }
        }
    }

    /// Runs one command for `client`, catching a panic from command
    /// execution so a bug in one command can't take the whole server down —
    /// executor state from before the panicking call stays whatever it was
    /// left as, which is why every mutator here is written to leave state
    /// consistent after any early return.
    fn handle_one(&mut self, client: ClientId, cmd: Command) {
        let in_multi = matches!(
            self.clients.get(&client).map(|c| c.mode),
            Some(Mode::Multi)
        ) && !matches!(cmd, Command::Multi | Command::Exec | Command::Discard);

        if in_multi {
            if let Some(state) = self.clients.get_mut(&client) {
                state.multi_queue.push(cmd);
            }
            self.send_to(client, RespValue::simple("QUEUED"));
            return;
        }

        let subscribed = matches!(
            self.clients.get(&client).map(|c| c.mode),
            Some(Mode::Subscribed)
        );
        if subscribed
            && !matches!(
                cmd,
                Command::Subscribe(_) | Command::Unsubscribe(_) | Command::Ping(_)
            )
        {
            self.send_to(
                client,
                RespValue::error(
                    "ERR only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING allowed in this context",
                ),
            );
            return;
        }

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.execute(client, cmd)));
        match result {
            Ok(reply) => {
                if !matches!(reply, RespValue::NoResponse) {
                    self.send_to(client, reply);
                }
            }
            Err(_) => {
                error!("command execution panicked for client {}", client);
                self.send_to(client, RespValue::error("ERR internal error"));
            }
        }
    }

    fn execute(&mut self, client: ClientId, cmd: Command) -> RespValue {
        match cmd {
            Command::Ping(msg) => {
                let subscribed = matches!(
                    self.clients.get(&client).map(|c| c.mode),
                    Some(Mode::Subscribed)
                );
                if subscribed {
                    // RESP2/RESP3 clients in Subscribed mode get the
                    // two-element pub/sub-style PING reply, not a bare PONG.
                    let echoed = msg.map_or(RespValue::bulk(""), |m| RespValue::BulkString(Some(m)));
                    RespValue::Array(vec![RespValue::bulk("pong"), echoed])
                } else {
                    match msg {
                        Some(m) => RespValue::BulkString(Some(m)),
                        None => RespValue::simple("PONG"),
                    }
                }
            }
            Command::Echo(msg) => RespValue::BulkString(Some(msg)),
            Command::Get(key) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                match self.store.get_scalar(&key) {
                    Ok(Some(v)) => v,
                    Ok(None) => RespValue::Null,
                    Err(e) => err_reply(e),
                }
            }
            Command::Set { key, value, expire } => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                self.store.set_scalar(
                    key,
                    RespValue::BulkString(Some(value)),
                    SetParams { expiry: expire },
                );
                RespValue::ok()
            }
            Command::Incr(key) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                match self.store.incr(&key) {
                    Ok(v) => RespValue::Integer(v),
                    Err(e) => err_reply(e),
                }
            }
            Command::Type(key) => {
                if self.streams.contains_key(&key) {
                    RespValue::simple("stream")
                } else {
                    RespValue::simple(self.store.type_name(&key))
                }
            }
            Command::RPush(key, values) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                match self.store.rpush(key.clone(), values) {
                    Ok(n) => {
                        self.wake_list_waiters_after_push(&key);
                        RespValue::Integer(n as i64)
                    }
                    Err(e) => err_reply(e),
                }
            }
            Command::LPush(key, values) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                match self.store.lpush(key.clone(), values) {
                    Ok(n) => {
                        self.wake_list_waiters_after_push(&key);
                        RespValue::Integer(n as i64)
                    }
                    Err(e) => err_reply(e),
                }
            }
            Command::LPop(key, count) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                pop_reply(self.store.lpop_count(&key, count.unwrap_or(1)), count)
            }
            Command::RPop(key, count) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                pop_reply(self.store.rpop_count(&key, count.unwrap_or(1)), count)
            }
            Command::LLen(key) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                match self.store.llen(&key) {
                    Ok(n) => RespValue::Integer(n as i64),
                    Err(e) => err_reply(e),
                }
            }
            Command::LRange(key, start, end) => {
                if self.streams.contains_key(&key) {
                    return wrongtype_err();
                }
                match self.store.lrange(&key, start, end) {
                    Ok(items) => RespValue::Array(
                        items
                            .into_iter()
                            .map(|b| RespValue::BulkString(Some(b)))
                            .collect(),
                    ),
                    Err(e) => err_reply(e),
                }
            }
            Command::BLPop { keys, timeout_secs } => {
                if keys.iter().any(|k| self.streams.contains_key(k)) {
                    return wrongtype_err();
                }
                self.blpop(client, keys, timeout_secs)
            }
            Command::XAdd { key, id_spec, fields } => {
                if self.store.exists(&key) {
                    return wrongtype_err();
                }
                self.xadd(client, key, id_spec, fields)
            }
            Command::XRange { key, start, end } => {
                if self.store.exists(&key) {
                    return wrongtype_err();
                }
                self.xrange(&key, &start, &end)
            }
            Command::XRead { block_ms, streams } => {
                if streams.iter().any(|(key, _)| self.store.exists(key)) {
                    return wrongtype_err();
                }
                self.xread(client, block_ms, streams)
            }
            Command::Multi => {
                if let Some(state) = self.clients.get_mut(&client) {
                    if state.mode == Mode::Multi {
                        return RespValue::error("ERR MULTI calls can not be nested");
                    }
                    state.mode = Mode::Multi;
                    state.multi_queue.clear();
                }
                RespValue::ok()
            }
            Command::Exec => self.exec(client),
            Command::Discard => {
                match self.clients.get_mut(&client) {
                    Some(state) if state.mode == Mode::Multi => {
                        state.mode = Mode::Standard;
                        state.multi_queue.clear();
                        RespValue::ok()
                    }
                    _ => RespValue::error("ERR DISCARD without MULTI"),
                }
            }
            Command::Subscribe(channels) => self.subscribe(client, channels),
            Command::Unsubscribe(channels) => self.unsubscribe(client, channels),
            Command::Publish(channel, message) => {
                let subs = self.pubsub.subscribers(&channel);
                let count = subs.len();
                for sub in subs {
                    let push = RespValue::Push(vec![
                        RespValue::bulk("message"),
                        RespValue::BulkString(Some(channel.clone())),
                        RespValue::BulkString(Some(message.clone())),
                    ]);
                    self.send_to(sub, push);
                }
                RespValue::Integer(count as i64)
            }
        }
    }

    /// After a push to `key`, hands the list's front elements to FIFO-queued
    /// waiters one at a time until either the queue or the list runs dry —
    /// BLPOP always consumes from the list head regardless of which end was
    /// just pushed.
    ///
    /// Pops the value before touching the waiter queue: `next_client_for_key`
    /// removes the candidate from the per-key FIFO unconditionally, so
    /// calling it first and then finding no data would strand that waiter —
    /// dequeued from the FIFO but still "blocked" in `client_to_keys`, never
    /// to be retried by a later push.
    fn wake_list_waiters_after_push(&mut self, key: &Bytes) {
        loop {
            match self.store.lpop_front(key) {
                Ok(Some(value)) => match self.blocked.next_client_for_key(key) {
                    Some((client, WaitKind::ListPop)) => {
                        self.blocked.unblock(client);
                        self.send_to(
                            client,
                            RespValue::Array(vec![
                                RespValue::BulkString(Some(key.clone())),
                                RespValue::BulkString(Some(value)),
                            ]),
                        );
                    }
                    Some((client, WaitKind::StreamRead)) => {
                        // Shouldn't happen: lists and streams don't share keys
                        // in this registry by construction, but don't lose
                        // the value if it does.
                        self.blocked.unblock(client);
                        let _ = self.store.lpush(key.clone(), vec![value]);
                        break;
                    }
                    None => {
                        let _ = self.store.lpush(key.clone(), vec![value]);
                        break;
                    }
                },
                _ => break,
            }
        }
    }

    fn blpop(&mut self, client: ClientId, keys: Vec<Bytes>, timeout_secs: f64) -> RespValue {
        for key in &keys {
            match self.store.lpop_front(key) {
                Ok(Some(value)) => {
                    return RespValue::Array(vec![
                        RespValue::BulkString(Some(key.clone())),
                        RespValue::BulkString(Some(value)),
                    ])
                }
                Ok(None) => {}
                Err(e) => return err_reply(e),
            }
        }
        let deadline = if timeout_secs == 0.0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs_f64(timeout_secs))
        };
        self.blocked.block(client, keys, WaitKind::ListPop, deadline);
        RespValue::NoResponse
    }

    /// A rejected ID (`0-0`, non-monotonic, malformed) must leave a
    /// previously-absent key absent, not a phantom empty stream — so a fresh
    /// key's stream is built and validated off to the side, and only spliced
    /// into `self.streams` once the insert is known to succeed. An already
    /// existing stream is mutated in place, since `resolve_and_insert` never
    /// touches `entries`/`last_inserted` before its own validation passes.
    fn xadd(&mut self, client: ClientId, key: Bytes, id_spec: String, fields: Vec<(Bytes, Bytes)>) -> RespValue {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let _ = client;
        if let Some(stream) = self.streams.get_mut(&key) {
            return match stream.resolve_and_insert(&id_spec, fields, now_ms) {
                Ok(id) => {
                    self.wake_stream_waiters(&key);
                    RespValue::bulk(id.to_wire_string())
                }
                Err(e) => err_reply(e),
            };
        }
        let mut stream = Stream::new();
        match stream.resolve_and_insert(&id_spec, fields, now_ms) {
            Ok(id) => {
                self.streams.insert(key.clone(), stream);
                self.wake_stream_waiters(&key);
                RespValue::bulk(id.to_wire_string())
            }
            Err(e) => err_reply(e),
        }
    }

    fn xrange(&mut self, key: &[u8], start: &str, end: &str) -> RespValue {
        let start_id = match parse_range_bound(start, true) {
            Ok(id) => id,
            Err(e) => return err_reply(e),
        };
        let end_id = match parse_range_bound(end, false) {
            Ok(id) => id,
            Err(e) => return err_reply(e),
        };
        let entries = match self.streams.get(key) {
            Some(stream) => stream.range(start_id, end_id, false),
            None => Vec::new(),
        };
        RespValue::Array(
            entries
                .into_iter()
                .map(|entry| {
                    RespValue::Array(vec![
                        RespValue::bulk(entry.id.to_wire_string()),
                        RespValue::Array(
                            entry
                                .fields
                                .into_iter()
                                .flat_map(|(k, v)| {
                                    vec![
                                        RespValue::BulkString(Some(k)),
                                        RespValue::BulkString(Some(v)),
                                    ]
                                })
                                .collect(),
                        ),
                    ])
                })
                .collect(),
        )
    }

    fn xread(&mut self, client: ClientId, block_ms: Option<u64>, streams: Vec<(Bytes, String)>) -> RespValue {
        let mut thresholds = Vec::with_capacity(streams.len());
        for (key, id_spec) in &streams {
            let threshold = if id_spec == "$" {
                self.streams.get(key).map(|s| s.max_id()).unwrap_or(StreamId::ZERO)
            } else {
                match parse_range_bound(id_spec, true) {
                    Ok(id) => id,
                    Err(e) => return err_reply(e),
                }
            };
            thresholds.push((key.clone(), threshold));
        }

        if let Some(reply) = self.collect_xread_results(&thresholds) {
            return reply;
        }

        match block_ms {
            None => RespValue::NullArray,
            Some(ms) => {
                let deadline = if ms == 0 {
                    None
                } else {
                    Some(Instant::now() + Duration::from_millis(ms))
                };
                let keys: Vec<Bytes> = thresholds.iter().map(|(k, _)| k.clone()).collect();
                self.blocked.block(client, keys, WaitKind::StreamRead, deadline);
                if let Some(state) = self.clients.get_mut(&client) {
                    state.pending_xread = Some(thresholds);
                }
                RespValue::NoResponse
            }
        }
    }

    fn collect_xread_results(&self, thresholds: &[(Bytes, StreamId)]) -> Option<RespValue> {
        let mut per_stream = Vec::new();
        for (key, threshold) in thresholds {
            if let Some(stream) = self.streams.get(key) {
                let entries = stream.range(*threshold, StreamId::MAX, true);
                if !entries.is_empty() {
                    per_stream.push(RespValue::Array(vec![
                        RespValue::BulkString(Some(key.clone())),
                        RespValue::Array(
                            entries
                                .into_iter()
                                .map(|entry| {
                                    RespValue::Array(vec![
                                        RespValue::bulk(entry.id.to_wire_string()),
                                        RespValue::Array(
                                            entry
                                                .fields
                                                .into_iter()
                                                .flat_map(|(k, v)| {
                                                    vec![
                                                        RespValue::BulkString(Some(k)),
                                                        RespValue::BulkString(Some(v)),
                                                    ]
                                                })
                                                .collect(),
                                        ),
                                    ])
                                })
                                .collect(),
                        ),
                    ]));
                }
            }
        }
        if per_stream.is_empty() {
            None
        } else {
            Some(RespValue::Array(per_stream))
        }
    }

    /// After an XADD, every client blocked on `key` whose threshold is now
    /// satisfied gets its full reply and is unblocked — unlike list pops,
    /// several readers can all be satisfied by the same new entry.
    fn wake_stream_waiters(&mut self, key: &[u8]) {
        let candidates: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, state)| {
                state
                    .pending_xread
                    .as_ref()
                    .map(|pairs| pairs.iter().any(|(k, _)| k.as_ref() == key))
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for client in candidates {
            let thresholds = match self.clients.get(&client).and_then(|s| s.pending_xread.clone()) {
                Some(t) => t,
                None => continue,
            };
            if let Some(reply) = self.collect_xread_results(&thresholds) {
                self.blocked.unblock(client);
                if let Some(state) = self.clients.get_mut(&client) {
                    state.pending_xread = None;
                }
                self.send_to(client, reply);
            }
        }
    }

    fn exec(&mut self, client: ClientId) -> RespValue {
        let queued = match self.clients.get_mut(&client) {
            Some(state) if state.mode == Mode::Multi => {
                state.mode = Mode::Standard;
                std::mem::take(&mut state.multi_queue)
            }
            _ => return RespValue::error("ERR EXEC without MULTI"),
        };
        let replies = queued.into_iter().map(|cmd| self.execute(client, cmd)).collect();
        RespValue::Array(replies)
    }

    fn subscribe(&mut self, client: ClientId, channels: Vec<Bytes>) -> RespValue {
        if let Some(state) = self.clients.get_mut(&client) {
            state.mode = Mode::Subscribed;
        }
        for channel in &channels {
            self.pubsub.subscribe(client, channel.clone());
            let sub_count = self.pubsub.subscriptions_of(client);
            self.send_to(
                client,
                RespValue::Push(vec![
                    RespValue::bulk("subscribe"),
                    RespValue::BulkString(Some(channel.clone())),
                    RespValue::Integer(sub_count as i64),
                ]),
            );
        }
        RespValue::NoResponse
    }

    fn unsubscribe(&mut self, client: ClientId, channels: Vec<Bytes>) -> RespValue {
        let targets = if channels.is_empty() {
            self.pubsub.channels_of(client)
        } else {
            channels
        };
        for channel in &targets {
            self.pubsub.unsubscribe(client, channel);
            let sub_count = self.pubsub.subscriptions_of(client);
            self.send_to(
                client,
                RespValue::Push(vec![
                    RespValue::bulk("unsubscribe"),
                    RespValue::BulkString(Some(channel.clone())),
                    RespValue::Integer(sub_count as i64),
                ]),
            );
        }
        if self.pubsub.subscriptions_of(client) == 0 {
            if let Some(state) = self.clients.get_mut(&client) {
                state.mode = Mode::Standard;
            }
        }
        RespValue::NoResponse
    }
}

fn err_reply(e: RdisError) -> RespValue {
    RespValue::error(e.resp_message())
}

fn wrongtype_err() -> RespValue {
    RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

/// Both the single-element and the counted overflow case resolve to plain
/// `Null`, never `NullArray` — that's reserved for blocking timeouts.
fn pop_reply(result: Result<Option<Vec<Bytes>>, RdisError>, count: Option<i64>) -> RespValue {
    match result {
        Ok(Some(mut items)) => {
            if count.is_none() {
                items.pop().map_or(RespValue::Null, |b| RespValue::BulkString(Some(b)))
            } else {
                RespValue::Array(items.into_iter().map(|b| RespValue::BulkString(Some(b))).collect())
            }
        }
        Ok(None) => RespValue::Null,
        Err(e) => err_reply(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an `Executor` with one registered client in `Standard` mode
    /// and hands back its id plus an outbound receiver so tests can both
    /// drive `execute` directly and inspect anything pushed out-of-band.
    fn test_executor() -> (Executor, ClientId, mpsc::UnboundedReceiver<RespValue>) {
        let (_tx, rx) = mpsc::channel(16);
        let mut executor = Executor::new(rx);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = 1;
        executor.clients.insert(
            client,
            ClientState {
                outbound: out_tx,
                mode: Mode::Standard,
                multi_queue: Vec::new(),
                pending_xread: None,
            },
        );
        (executor, client, out_rx)
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    /// Registers an additional client (beyond the one `test_executor` sets
    /// up) and hands back its outbound receiver.
    fn register_client(executor: &mut Executor, client: ClientId) -> mpsc::UnboundedReceiver<RespValue> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        executor.clients.insert(
            client,
            ClientState {
                outbound: out_tx,
                mode: Mode::Standard,
                multi_queue: Vec::new(),
                pending_xread: None,
            },
        );
        out_rx
    }

    #[test]
    fn lpop_overflow_is_null_not_null_array() {
        let (mut executor, client, _out) = test_executor();
        executor.store.rpush(key("l"), vec![key("a")]).unwrap();
        let reply = executor.execute(client, Command::LPop(key("l"), Some(5)));
        assert_eq!(reply, RespValue::Null);
    }

    #[test]
    fn lpop_zero_count_is_null() {
        let (mut executor, client, _out) = test_executor();
        executor.store.rpush(key("l"), vec![key("a")]).unwrap();
        let reply = executor.execute(client, Command::LPop(key("l"), Some(0)));
        assert_eq!(reply, RespValue::Null);
    }

    #[test]
    fn ping_in_subscribed_mode_returns_pong_array() {
        let (mut executor, client, _out) = test_executor();
        executor.clients.get_mut(&client).unwrap().mode = Mode::Subscribed;
        let reply = executor.execute(client, Command::Ping(None));
        assert_eq!(
            reply,
            RespValue::Array(vec![RespValue::bulk("pong"), RespValue::bulk("")])
        );
        let reply = executor.execute(client, Command::Ping(Some(key("hi"))));
        assert_eq!(
            reply,
            RespValue::Array(vec![RespValue::bulk("pong"), RespValue::bulk("hi")])
        );
    }

    #[test]
    fn ping_outside_subscribed_mode_is_plain_pong() {
        let (mut executor, client, _out) = test_executor();
        let reply = executor.execute(client, Command::Ping(None));
        assert_eq!(reply, RespValue::simple("PONG"));
    }

    #[test]
    fn type_reports_stream_for_a_stream_key() {
        let (mut executor, client, _out) = test_executor();
        executor.execute(
            client,
            Command::XAdd {
                key: key("s"),
                id_spec: "1-1".into(),
                fields: vec![(key("f"), key("v"))],
            },
        );
        let reply = executor.execute(client, Command::Type(key("s")));
        assert_eq!(reply, RespValue::simple("stream"));
    }

    #[test]
    fn get_on_a_stream_key_is_wrongtype() {
        let (mut executor, client, _out) = test_executor();
        executor.execute(
            client,
            Command::XAdd {
                key: key("s"),
                id_spec: "1-1".into(),
                fields: vec![(key("f"), key("v"))],
            },
        );
        let reply = executor.execute(client, Command::Get(key("s")));
        match reply {
            RespValue::SimpleError(msg) => assert!(msg.starts_with(b"WRONGTYPE")),
            other => panic!("expected WRONGTYPE, got {:?}", other),
        }
    }

    #[test]
    fn xadd_on_a_string_key_is_wrongtype() {
        let (mut executor, client, _out) = test_executor();
        executor.execute(
            client,
            Command::Set {
                key: key("k"),
                value: key("v"),
                expire: None,
            },
        );
        let reply = executor.execute(
            client,
            Command::XAdd {
                key: key("k"),
                id_spec: "1-1".into(),
                fields: vec![(key("f"), key("v"))],
            },
        );
        match reply {
            RespValue::SimpleError(msg) => assert!(msg.starts_with(b"WRONGTYPE")),
            other => panic!("expected WRONGTYPE, got {:?}", other),
        }
    }

    #[test]
    fn xadd_rejected_id_on_a_new_key_leaves_no_phantom_stream() {
        let (mut executor, client, _out) = test_executor();
        let reply = executor.execute(
            client,
            Command::XAdd {
                key: key("s"),
                id_spec: "0-0".into(),
                fields: vec![(key("f"), key("v"))],
            },
        );
        match reply {
            RespValue::SimpleError(_) => {}
            other => panic!("expected an error for id 0-0, got {:?}", other),
        }
        let reply = executor.execute(client, Command::Type(key("s")));
        assert_eq!(reply, RespValue::simple("none"));
        let reply = executor.execute(
            client,
            Command::Set {
                key: key("s"),
                value: key("v"),
                expire: None,
            },
        );
        assert!(!matches!(reply, RespValue::SimpleError(_)), "a key an earlier XADD failed on must still be usable as a string: {:?}", reply);
    }

    #[test]
    fn xadd_rejected_id_on_an_existing_stream_leaves_it_untouched() {
        let (mut executor, client, _out) = test_executor();
        executor.execute(
            client,
            Command::XAdd {
                key: key("s"),
                id_spec: "5-5".into(),
                fields: vec![(key("f"), key("v"))],
            },
        );
        let reply = executor.execute(
            client,
            Command::XAdd {
                key: key("s"),
                id_spec: "1-1".into(),
                fields: vec![(key("f"), key("v"))],
            },
        );
        match reply {
            RespValue::SimpleError(_) => {}
            other => panic!("expected a non-monotonic id error, got {:?}", other),
        }
        let reply = executor.execute(client, Command::Type(key("s")));
        assert_eq!(reply, RespValue::simple("stream"));
    }

    #[test]
    fn subscribe_reply_count_is_this_clients_own_subscriptions_not_the_channels() {
        let (mut executor, client_a, mut out_a) = test_executor();
        let client_b = 2;
        let mut out_b = register_client(&mut executor, client_b);

        executor.execute(client_a, Command::Subscribe(vec![key("news")]));
        let reply = out_a.try_recv().expect("subscribe ack for client_a");
        assert_eq!(
            reply,
            RespValue::Push(vec![
                RespValue::bulk("subscribe"),
                RespValue::BulkString(Some(key("news"))),
                RespValue::Integer(1),
            ])
        );

        executor.execute(client_b, Command::Subscribe(vec![key("news")]));
        let reply = out_b.try_recv().expect("subscribe ack for client_b");
        assert_eq!(
            reply,
            RespValue::Push(vec![
                RespValue::bulk("subscribe"),
                RespValue::BulkString(Some(key("news"))),
                RespValue::Integer(1),
            ]),
            "client_b is on exactly one channel, even though the channel now has two subscribers"
        );
    }

    #[test]
    fn bare_unsubscribe_reports_decrementing_per_channel_counts() {
        let (mut executor, client, mut out) = test_executor();
        executor.execute(client, Command::Subscribe(vec![key("a"), key("b")]));
        out.try_recv().unwrap();
        out.try_recv().unwrap();

        executor.execute(client, Command::Unsubscribe(vec![]));
        let mut counts: Vec<i64> = (0..2)
            .map(|_| match out.try_recv().unwrap() {
                RespValue::Push(items) => match items[2] {
                    RespValue::Integer(n) => n,
                    ref other => panic!("expected an Integer subCount, got {:?}", other),
                },
                other => panic!("expected a Push reply, got {:?}", other),
            })
            .collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![0, 1]);
    }

    #[test]
    fn blpop_against_a_string_key_is_wrongtype_not_a_permanent_block() {
        let (mut executor, client, _out) = test_executor();
        executor.execute(
            client,
            Command::Set {
                key: key("k"),
                value: key("v"),
                expire: None,
            },
        );
        let reply = executor.execute(
            client,
            Command::BLPop {
                keys: vec![key("k")],
                timeout_secs: 0.0,
            },
        );
        match reply {
            RespValue::SimpleError(msg) => assert!(msg.starts_with(b"WRONGTYPE")),
            other => panic!("expected WRONGTYPE, got {:?}", other),
        }
        assert!(!executor.blocked.is_blocked(client));
    }

    #[test]
    fn blpop_immediate_pop_from_populated_list() {
        let (mut executor, client, _out) = test_executor();
        executor.store.rpush(key("q"), vec![key("x")]).unwrap();
        let reply = executor.execute(
            client,
            Command::BLPop {
                keys: vec![key("q")],
                timeout_secs: 0.0,
            },
        );
        assert_eq!(
            reply,
            RespValue::Array(vec![
                RespValue::BulkString(Some(key("q"))),
                RespValue::BulkString(Some(key("x")))
            ])
        );
    }

    #[test]
    fn second_waiter_survives_a_push_that_only_satisfies_the_first() {
        let (mut executor, client_a, mut out_a) = test_executor();
        let client_b = 2;
        let mut out_b = register_client(&mut executor, client_b);

        executor.blocked.block(client_a, vec![key("q")], WaitKind::ListPop, None);
        executor.blocked.block(client_b, vec![key("q")], WaitKind::ListPop, None);

        executor.store.rpush(key("q"), vec![key("one")]).unwrap();
        executor.wake_list_waiters_after_push(&key("q"));

        assert_eq!(
            out_a.try_recv().unwrap(),
            RespValue::Array(vec![
                RespValue::BulkString(Some(key("q"))),
                RespValue::BulkString(Some(key("one"))),
            ])
        );
        assert!(out_b.try_recv().is_err());
        assert!(executor.blocked.is_blocked(client_b));

        executor.store.rpush(key("q"), vec![key("two")]).unwrap();
        executor.wake_list_waiters_after_push(&key("q"));

        assert_eq!(
            out_b.try_recv().unwrap(),
            RespValue::Array(vec![
                RespValue::BulkString(Some(key("q"))),
                RespValue::BulkString(Some(key("two"))),
            ])
        );
    }

    #[test]
    fn multi_exec_collects_replies_in_order() {
        let (mut executor, client, _out) = test_executor();
        executor.execute(client, Command::Multi);
        executor.handle_one(client, Command::Set { key: key("a"), value: key("1"), expire: None });
        executor.handle_one(client, Command::Incr(key("a")));
        let reply = executor.execute(client, Command::Exec);
        assert_eq!(
            reply,
            RespValue::Array(vec![RespValue::ok(), RespValue::Integer(2)])
        );
    }
}
