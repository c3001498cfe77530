//! Storage adapter shared by every relay service.
//!
//! [`Store`] is the narrow key/value contract the services persist through:
//! hashes for entity records, sets for presence and membership indices, lists
//! for capped history, string keys with TTL for the token index, and publish
//! for presence events. [`MemoryStore`] implements it in-process;
//! [`RetryingStore`] wraps any implementation and retries transient failures.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Field map of a stored hash.
pub type Fields = BTreeMap<String, String>;

/// Capacity of the in-process pub/sub channel.
const PUBLISH_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached. Worth retrying.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of a different type.
    #[error("wrong type for key {key}: expected {expected}")]
    WrongType {
        /// Key that was accessed.
        key: String,
        /// Type the operation needed.
        expected: &'static str,
    },
}

impl StoreError {
    /// Whether the operation may succeed if repeated.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Key/value store with hash, set, list, TTL, and publish primitives.
///
/// List indices follow Redis conventions: negative values count from the
/// tail, `-1` being the last element, and ranges are inclusive.
pub trait Store: Send + Sync + 'static {
    /// Returns all fields of a hash, or an empty map if the key is absent.
    fn hash_get_all(&self, key: &str)
    -> impl Future<Output = Result<Fields, StoreError>> + Send;

    /// Sets the given fields on a hash, creating it if needed.
    fn hash_set(
        &self,
        key: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Creates the hash with `fields` only if the key does not exist.
    ///
    /// Returns `true` if this call created it. Atomic with respect to other
    /// callers racing on the same key.
    fn hash_set_if_absent(
        &self,
        key: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Whether the key exists (and has not expired).
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Reads a string key.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Writes a string key, clearing any TTL.
    fn set(&self, key: &str, value: String)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Writes a string key that expires after `ttl`.
    fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Resets the TTL of an existing key. Returns `false` if the key is absent.
    fn expire(&self, key: &str, ttl: Duration)
    -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Adds a member to a set. Returns `true` if it was not already present.
    fn set_add(&self, key: &str, member: &str)
    -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Removes a member from a set. Returns `true` if it was present.
    fn set_remove(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Returns the members of a set in sorted order.
    fn set_members(&self, key: &str)
    -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Appends to the tail of a list, returning the new length.
    fn list_push(
        &self,
        key: &str,
        value: String,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Keeps only the elements in `start..=stop`.
    fn list_trim(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns the elements in `start..=stop`, head to tail.
    fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Returns the length of a list, zero if absent.
    fn list_len(&self, key: &str) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Publishes a payload on a channel, returning the number of receivers.
    fn publish(
        &self,
        channel: &str,
        payload: String,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// A payload delivered through [`Store::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Channel name.
    pub channel: String,
    /// Published payload.
    pub payload: String,
}

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(Fields),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`Store`] with lazy TTL expiry.
///
/// Thread-safe via a single [`Mutex`]; every operation is one short critical
/// section, which also makes [`Store::hash_set_if_absent`] atomic. Expired
/// keys are dropped when read, and every TTL write sweeps the whole map so
/// keys that are never read again do not accumulate. Expiry is measured on
/// [`tokio::time::Instant`] so paused-time tests can drive it.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<Published>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUBLISH_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to everything published on any channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.events.subscribe()
    }

    /// Returns the remaining TTL of a key, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    if entries
        .get(key)
        .is_some_and(|e| e.is_expired(Instant::now()))
    {
        entries.remove(key);
    }
}

fn sweep_expired(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now));
    let swept = before - entries.len();
    if swept > 0 {
        tracing::debug!(swept, "expired keys swept");
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut Fields, StoreError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Hash(Fields::new())));
    match &mut entry.value {
        Value::Hash(fields) => Ok(fields),
        _ => Err(wrong_type(key, "hash")),
    }
}

fn set_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut BTreeSet<String>, StoreError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
    match &mut entry.value {
        Value::Set(set) => Ok(set),
        _ => Err(wrong_type(key, "set")),
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StoreError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(wrong_type(key, "list")),
    }
}

/// Resolves an inclusive Redis-style range against a list length.
///
/// Returns `None` when the range selects nothing.
fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

impl Store for MemoryStore {
    async fn hash_get_all(&self, key: &str) -> Result<Fields, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Fields::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn hash_set(&self, key: &str, fields: Fields) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        hash_mut(&mut entries, key)?.extend(fields);
        Ok(())
    }

    async fn hash_set_if_absent(&self, key: &str, fields: Fields) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(Value::Hash(fields)));
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        Ok(entries.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(Value::Str(value)));
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        sweep_expired(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        Ok(entries.get_mut(key).is_some_and(|entry| {
            entry.expires_at = Some(Instant::now() + ttl);
            true
        }))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        Ok(set_mut(&mut entries, key)?.insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        let set = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Value::Set(set)) => set,
            Some(_) => return Err(wrong_type(key, "set")),
        };
        let removed = set.remove(member);
        if set.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn list_push(&self, key: &str, value: String) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        let list = list_mut(&mut entries, key)?;
        list.push_back(value);
        Ok(list.len())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        let list = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Value::List(list)) => list,
            Some(_) => return Err(wrong_type(key, "list")),
        };
        if let Some((from, to)) = resolve_range(start, stop, list.len()) {
            list.truncate(to + 1);
            list.drain(..from);
        } else {
            entries.remove(key);
        }
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(resolve_range(start, stop, list.len())
                .map(|(from, to)| list.range(from..=to).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let published = Published {
            channel: channel.to_string(),
            payload,
        };
        // No subscribers is not an error for pub/sub.
        Ok(self.events.send(published).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Default pause before the first retry; later retries wait proportionally longer.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Wraps a [`Store`] and retries operations that fail with a transient error.
///
/// Non-transient errors (such as [`StoreError::WrongType`]) are returned on
/// the first attempt. After `attempts` retries the last error is returned.
pub struct RetryingStore<S> {
    inner: S,
    attempts: u32,
    backoff: Duration,
}

impl<S: Store> RetryingStore<S> {
    /// Wraps `inner`, retrying transient failures up to `attempts` times.
    #[must_use]
    pub const fn new(inner: S, attempts: u32) -> Self {
        Self {
            inner,
            attempts,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Overrides the base backoff between retries.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    attempt += 1;
                    tracing::warn!(op, attempt, error = %e, "transient storage failure, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                result => return result,
            }
        }
    }
}

impl<S: Store> Store for RetryingStore<S> {
    async fn hash_get_all(&self, key: &str) -> Result<Fields, StoreError> {
        let inner = &self.inner;
        self.retry("hash_get_all", move || inner.hash_get_all(key))
            .await
    }

    async fn hash_set(&self, key: &str, fields: Fields) -> Result<(), StoreError> {
        let inner = &self.inner;
        self.retry("hash_set", move || inner.hash_set(key, fields.clone()))
            .await
    }

    async fn hash_set_if_absent(&self, key: &str, fields: Fields) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.retry("hash_set_if_absent", move || {
            inner.hash_set_if_absent(key, fields.clone())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.retry("exists", move || inner.exists(key)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = &self.inner;
        self.retry("get", move || inner.get(key)).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let inner = &self.inner;
        self.retry("set", move || inner.set(key, value.clone())).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let inner = &self.inner;
        self.retry("set_with_ttl", move || {
            inner.set_with_ttl(key, value.clone(), ttl)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.retry("expire", move || inner.expire(key, ttl)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.retry("set_add", move || inner.set_add(key, member)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.retry("set_remove", move || inner.set_remove(key, member))
            .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = &self.inner;
        self.retry("set_members", move || inner.set_members(key)).await
    }

    async fn list_push(&self, key: &str, value: String) -> Result<usize, StoreError> {
        let inner = &self.inner;
        self.retry("list_push", move || inner.list_push(key, value.clone()))
            .await
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let inner = &self.inner;
        self.retry("list_trim", move || inner.list_trim(key, start, stop))
            .await
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let inner = &self.inner;
        self.retry("list_range", move || inner.list_range(key, start, stop))
            .await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = &self.inner;
        self.retry("list_len", move || inner.list_len(key)).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let inner = &self.inner;
        self.retry("publish", move || inner.publish(channel, payload.clone()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// [`MemoryStore`] that suspends before every operation.
///
/// With no delay each call yields once, so concurrent callers on one task
/// interleave at every store round-trip. Writes to hash keys are counted per
/// key.
#[cfg(test)]
pub(crate) struct PausingStore {
    pub(crate) inner: MemoryStore,
    delay: Duration,
    hash_writes: Mutex<HashMap<String, u32>>,
}

#[cfg(test)]
impl PausingStore {
    pub(crate) fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            hash_writes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of hash writes that reached `key`.
    pub(crate) fn hash_writes(&self, key: &str) -> u32 {
        self.hash_writes.lock().get(key).copied().unwrap_or(0)
    }

    async fn pause(&self) {
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn count_hash_write(&self, key: &str) {
        *self.hash_writes.lock().entry(key.to_string()).or_default() += 1;
    }
}

#[cfg(test)]
impl Store for PausingStore {
    async fn hash_get_all(&self, key: &str) -> Result<Fields, StoreError> {
        self.pause().await;
        self.inner.hash_get_all(key).await
    }

    async fn hash_set(&self, key: &str, fields: Fields) -> Result<(), StoreError> {
        self.pause().await;
        self.count_hash_write(key);
        self.inner.hash_set(key, fields).await
    }

    async fn hash_set_if_absent(&self, key: &str, fields: Fields) -> Result<bool, StoreError> {
        self.pause().await;
        let created = self.inner.hash_set_if_absent(key, fields).await?;
        if created {
            self.count_hash_write(key);
        }
        Ok(created)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.pause().await;
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.pause().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.pause().await;
        self.inner.set(key, value).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.pause().await;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.pause().await;
        self.inner.expire(key, ttl).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.pause().await;
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.pause().await;
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.pause().await;
        self.inner.set_members(key).await
    }

    async fn list_push(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.pause().await;
        self.inner.list_push(key, value).await
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.pause().await;
        self.inner.list_trim(key, start, stop).await
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.pause().await;
        self.inner.list_range(key, start, stop).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.pause().await;
        self.inner.list_len(key).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        self.pause().await;
        self.inner.publish(channel, payload).await
    }
}
