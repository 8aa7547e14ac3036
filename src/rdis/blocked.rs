//! The blocking-waiter registry: tracks clients parked on `BLPOP`/`XREAD
//! BLOCK` until a key they're waiting on gets data, or their deadline
//! passes.
//!
//! FIFO per-key queues, a reverse index from client to the keys it's
//! waiting on, and a timeout min-heap for deadline expiry.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use tokio::time::Instant;

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    ListPop,
    StreamRead,
}

struct TimeoutEntry {
    deadline: Instant,
    client: ClientId,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimeoutEntry {}
impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts highest.
        other.deadline.cmp(&self.deadline)
    }
}

/// A client waiting on one or more keys, with the deadline it will be woken
/// unconditionally regardless of data arriving (`None` means block forever).
struct Waiter {
    client: ClientId,
    keys: Vec<Bytes>,
    kind: WaitKind,
    deadline: Option<Instant>,
}

/// Registry invariants:
/// - B1: every client id in a per-key FIFO also appears in `client_to_keys`.
/// - B2: every key in `client_to_keys[client]` has that client somewhere in
///   its per-key FIFO (possibly behind a tombstone).
/// - B3: the timeout heap may contain stale entries for already-unblocked
///   clients; `expire_before` checks liveness via `waiters` before acting,
///   which is the tombstone behavior — removal from `waiters` is the single
///   source of truth, not cleanup of the heap or FIFOs.
#[derive(Default)]
pub struct BlockedRegistry {
    per_key: HashMap<Bytes, VecDeque<ClientId>>,
    client_to_keys: HashMap<ClientId, HashSet<Bytes>>,
    waiters: HashMap<ClientId, Waiter>,
    timeouts: BinaryHeap<TimeoutEntry>,
}

impl BlockedRegistry {
    pub fn new() -> BlockedRegistry {
        BlockedRegistry::default()
    }

    /// Registers `client` as blocked on `keys` until one produces data or
    /// `deadline` passes (`None` = block forever).
    pub fn block(
        &mut self,
        client: ClientId,
        keys: Vec<Bytes>,
        kind: WaitKind,
        deadline: Option<Instant>,
    ) {
        for key in &keys {
            self.per_key.entry(key.clone()).or_default().push_back(client);
        }
        self.client_to_keys
            .entry(client)
            .or_default()
            .extend(keys.iter().cloned());
        if let Some(deadline) = deadline {
            self.timeouts.push(TimeoutEntry { deadline, client });
        }
        self.waiters.insert(
            client,
            Waiter {
                client,
                keys,
                kind,
                deadline,
            },
        );
    }

    /// Pops the first live waiter queued on `key`, skipping tombstoned
    /// (already-unblocked) entries left behind in the FIFO. Returns the
    /// client id and what it was waiting for; does not remove the waiter's
    /// interest in its *other* keys — callers that satisfy the wait must
    /// call `unblock` to fully clear it.
    pub fn next_client_for_key(&mut self, key: &[u8]) -> Option<(ClientId, WaitKind)> {
        let queue = self.per_key.get_mut(key)?;
        while let Some(candidate) = queue.pop_front() {
            if let Some(waiter) = self.waiters.get(&candidate) {
                let kind = waiter.kind;
                return Some((candidate, kind));
            }
            // Tombstoned: already unblocked via another key or a timeout. Skip.
        }
        None
    }

    /// Fully removes `client` from the registry: its per-key FIFO entries
    /// become tombstones (left in place, skipped lazily by
    /// `next_client_for_key`), `client_to_keys` is dropped, and the waiter
    /// record is removed. Returns the keys it had been waiting on.
    pub fn unblock(&mut self, client: ClientId) -> Vec<Bytes> {
        self.waiters.remove(&client);
        match self.client_to_keys.remove(&client) {
            Some(keys) => keys.into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn is_blocked(&self, client: ClientId) -> bool {
        self.waiters.contains_key(&client)
    }

    /// The soonest deadline still live in the heap, after discarding stale
    /// entries for clients that have already been unblocked by other means.
    pub fn earliest_timeout(&mut self) -> Option<Instant> {
        while let Some(top) = self.timeouts.peek() {
            if self.waiters.contains_key(&top.client) {
                return Some(top.deadline);
            }
            self.timeouts.pop();
        }
        None
    }

    /// Unblocks and returns every client whose deadline is at or before
    /// `now`, skipping stale heap entries for clients already unblocked.
    /// Each entry carries the `WaitKind` it was registered with, so the
    /// caller can pick the right timeout reply shape.
    pub fn expire_before(&mut self, now: Instant) -> Vec<(ClientId, WaitKind)> {
        let mut expired = Vec::new();
        while let Some(top) = self.timeouts.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.timeouts.pop().unwrap();
            if let Some(waiter) = self.waiters.get(&entry.client) {
                let kind = waiter.kind;
                self.unblock(entry.client);
                expired.push((entry.client, kind));
            }
        }
        expired
    }

    pub fn waiting_keys(&self, client: ClientId) -> Option<&HashSet<Bytes>> {
        self.client_to_keys.get(&client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn next_client_for_key_returns_fifo_order() {
        let mut r = BlockedRegistry::new();
        r.block(1, vec![key("a")], WaitKind::ListPop, None);
        r.block(2, vec![key("a")], WaitKind::ListPop, None);
        let (first, _) = r.next_client_for_key(b"a").unwrap();
        assert_eq!(first, 1);
        r.unblock(1);
        let (second, _) = r.next_client_for_key(b"a").unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unblock_clears_waiter_across_all_its_keys() {
        let mut r = BlockedRegistry::new();
        r.block(1, vec![key("a"), key("b")], WaitKind::ListPop, None);
        r.unblock(1);
        assert!(r.next_client_for_key(b"a").is_none());
        assert!(r.next_client_for_key(b"b").is_none());
        assert!(!r.is_blocked(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tombstoned_entry_is_skipped_not_returned() {
        let mut r = BlockedRegistry::new();
        r.block(1, vec![key("a")], WaitKind::ListPop, None);
        r.block(2, vec![key("a")], WaitKind::ListPop, None);
        r.unblock(1);
        let (woken, _) = r.next_client_for_key(b"a").unwrap();
        assert_eq!(woken, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_before_wakes_only_due_clients() {
        let mut r = BlockedRegistry::new();
        let now = Instant::now();
        r.block(1, vec![key("a")], WaitKind::ListPop, Some(now + Duration::from_millis(10)));
        r.block(2, vec![key("a")], WaitKind::ListPop, Some(now + Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(20)).await;
        let expired = r.expire_before(Instant::now());
        assert_eq!(expired, vec![(1, WaitKind::ListPop)]);
        assert!(r.is_blocked(2));
        assert!(!r.is_blocked(1));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_timeout_skips_already_unblocked() {
        let mut r = BlockedRegistry::new();
        let now = Instant::now();
        r.block(1, vec![key("a")], WaitKind::ListPop, Some(now + Duration::from_millis(5)));
        r.block(2, vec![key("b")], WaitKind::ListPop, Some(now + Duration::from_millis(50)));
        r.unblock(1);
        assert_eq!(r.earliest_timeout(), Some(now + Duration::from_millis(50)));
    }
}
