//! In-process coordination store.
//!
//! `MemoryStore` keeps the whole keyspace behind a single async mutex, so a
//! script holding the lock observes and mutates the namespace atomically,
//! exactly like a server-side script would. Keys carry optional absolute
//! expiry times and are evicted lazily on access, using the store's
//! [`Clock`]. Channel messages published by a script are delivered after it
//! finishes, still under the lock, so subscribers see them in commit order.
//!
//! # Examples
//!
//! ```rust
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use beehive::store::{CoordinationStore, MemoryStore, MockClock};
//! use chrono::Duration;
//!
//! let clock = MockClock::new();
//! let store = MemoryStore::with_clock(clock.clone());
//!
//! let before = store.time().await?;
//! clock.advance(Duration::seconds(5));
//! assert_eq!(store.time().await? - before, 5_000);
//! # Ok(())
//! # }
//! ```

use super::{CoordinationStore, Keyspace};
use crate::{
    Result,
    engine::{self, Reply, Script, ScriptContext},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::trace;

/// Mock clock for controlling store time in tests.
///
/// ```rust
/// use beehive::store::MockClock;
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::minutes(30));
/// assert_eq!((clock.now() - start).num_minutes(), 30);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at the current time.
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the mock time by the given duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Time source of a store.
#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    Mock(MockClock),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Mock(clock) => clock.now(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Sorted set score with a total order.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set: ordered by score, ties broken by member.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let added = match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                false
            }
            None => true,
        };
        self.order.insert((Score(score), member.to_string()));
        added
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn rank(&self, member: &str) -> Option<usize> {
        let score = *self.scores.get(member)?;
        Some(self.order.range(..(Score(score), member.to_string())).count())
    }

    fn range_by_score(&self, min: f64, max: f64, limit: Option<usize>) -> Vec<(String, f64)> {
        self.order
            .range((Score(min), String::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// The namespace, one map per value type.
#[derive(Debug, Default)]
struct Data {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, SortedSet>,
    lists: HashMap<String, Vec<String>>,
    expiries: HashMap<String, i64>,
}

impl Data {
    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.sets.contains_key(key)
            || self.zsets.contains_key(key)
            || self.lists.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiries.remove(key);
        let removed = [
            self.strings.remove(key).is_some(),
            self.hashes.remove(key).is_some(),
            self.sets.remove(key).is_some(),
            self.zsets.remove(key).is_some(),
            self.lists.remove(key).is_some(),
        ];
        removed.contains(&true)
    }

    /// Drop `key` if its expiry time has passed.
    fn evict(&mut self, key: &str, now: i64) {
        if self.expiries.get(key).is_some_and(|at| *at <= now) {
            trace!("Evicting expired key {}", key);
            self.remove(key);
        }
    }

    fn evict_all(&mut self, now: i64) {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }
}

struct MemoryState {
    data: Data,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// A script's exclusive view of the namespace.
pub(crate) struct MemoryKeyspace<'a> {
    data: &'a mut Data,
    now: i64,
    outbox: Vec<(String, String)>,
}

impl<'a> MemoryKeyspace<'a> {
    fn new(data: &'a mut Data, now: i64) -> Self {
        Self {
            data,
            now,
            outbox: Vec::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        self.data.evict(key, self.now);
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = self.data.hashes.get(key).is_some_and(|h| h.is_empty())
            || self.data.sets.get(key).is_some_and(|s| s.is_empty())
            || self.data.zsets.get(key).is_some_and(|z| z.is_empty());
        if empty {
            self.data.remove(key);
        }
    }
}

impl Keyspace for MemoryKeyspace<'_> {
    fn get(&mut self, key: &str) -> Option<String> {
        self.touch(key);
        self.data.strings.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.data.remove(key);
        self.data.strings.insert(key.to_string(), value);
    }

    fn del(&mut self, key: &str) -> bool {
        self.touch(key);
        self.data.remove(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.touch(key);
        self.data.contains(key)
    }

    fn pexpire_at(&mut self, key: &str, at_ms: i64) -> bool {
        self.touch(key);
        if !self.data.contains(key) {
            return false;
        }
        self.data.expiries.insert(key.to_string(), at_ms);
        self.touch(key);
        true
    }

    fn hget(&mut self, key: &str, field: &str) -> Option<String> {
        self.touch(key);
        self.data.hashes.get(key)?.get(field).cloned()
    }

    fn hset(&mut self, key: &str, field: &str, value: String) {
        self.touch(key);
        self.data
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    fn hgetall(&mut self, key: &str) -> HashMap<String, String> {
        self.touch(key);
        self.data.hashes.get(key).cloned().unwrap_or_default()
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        self.touch(key);
        let removed = self
            .data
            .hashes
            .get_mut(key)
            .is_some_and(|hash| hash.remove(field).is_some());
        self.drop_if_empty(key);
        removed
    }

    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        self.data
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        let removed = self
            .data
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member));
        self.drop_if_empty(key);
        removed
    }

    fn smembers(&mut self, key: &str) -> Vec<String> {
        self.touch(key);
        self.data
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn sismember(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        self.data
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member))
    }

    fn scard(&mut self, key: &str) -> usize {
        self.touch(key);
        self.data.sets.get(key).map_or(0, |set| set.len())
    }

    fn sinter(&mut self, keys: &[String]) -> Vec<String> {
        let Some((first, rest)) = keys.split_first() else {
            return Vec::new();
        };
        let mut members = self.smembers(first);
        for key in rest {
            self.touch(key);
            let Some(set) = self.data.sets.get(key) else {
                return Vec::new();
            };
            members.retain(|member| set.contains(member));
        }
        members
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> bool {
        self.touch(key);
        self.data
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member, score)
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        self.touch(key);
        let removed = self
            .data
            .zsets
            .get_mut(key)
            .is_some_and(|zset| zset.remove(member));
        self.drop_if_empty(key);
        removed
    }

    fn zscore(&mut self, key: &str, member: &str) -> Option<f64> {
        self.touch(key);
        self.data.zsets.get(key)?.scores.get(member).copied()
    }

    fn zcard(&mut self, key: &str) -> usize {
        self.touch(key);
        self.data.zsets.get(key).map_or(0, |zset| zset.scores.len())
    }

    fn zrank(&mut self, key: &str, member: &str) -> Option<usize> {
        self.touch(key);
        self.data.zsets.get(key)?.rank(member)
    }

    fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Vec<(String, f64)> {
        self.touch(key);
        self.data
            .zsets
            .get(key)
            .map(|zset| zset.range_by_score(min, max, limit))
            .unwrap_or_default()
    }

    fn zrange(&mut self, key: &str, count: usize) -> Vec<String> {
        self.touch(key);
        self.data
            .zsets
            .get(key)
            .map(|zset| {
                zset.order
                    .iter()
                    .take(count)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn rpush(&mut self, key: &str, value: String) -> usize {
        self.touch(key);
        let list = self.data.lists.entry(key.to_string()).or_default();
        list.push(value);
        list.len()
    }

    fn lrange(&mut self, key: &str) -> Vec<String> {
        self.touch(key);
        self.data.lists.get(key).cloned().unwrap_or_default()
    }

    fn publish(&mut self, channel: &str, message: String) {
        self.outbox.push((channel.to_string(), message));
    }
}

/// In-process implementation of [`CoordinationStore`].
pub struct MemoryStore {
    state: AsyncMutex<MemoryState>,
    clock: Clock,
    channel_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock_source(Clock::System)
    }

    /// Create a store whose time is driven by a [`MockClock`].
    pub fn with_clock(clock: MockClock) -> Self {
        Self::with_clock_source(Clock::Mock(clock))
    }

    fn with_clock_source(clock: Clock) -> Self {
        Self {
            state: AsyncMutex::new(MemoryState {
                data: Data::default(),
                channels: HashMap::new(),
            }),
            clock,
            channel_capacity: 1024,
        }
    }

    /// Buffer size of each channel; slow subscribers beyond it observe a lag.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Number of live keys, after evicting everything past its expiry.
    pub async fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        state.data.evict_all(now);
        let data = &state.data;
        data.strings.len() + data.hashes.len() + data.sets.len() + data.zsets.len() + data.lists.len()
    }

    /// Run `f` with exclusive access to the keyspace.
    pub(crate) async fn with_keyspace<T>(&self, f: impl FnOnce(&mut dyn Keyspace) -> T) -> T {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let MemoryState { data, channels } = &mut *state;
        let mut keyspace = MemoryKeyspace::new(data, now);
        let value = f(&mut keyspace);
        let outbox = std::mem::take(&mut keyspace.outbox);
        for (channel, message) in outbox {
            deliver(channels, &channel, message);
        }
        value
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(
    channels: &mut HashMap<String, broadcast::Sender<String>>,
    channel: &str,
    message: String,
) -> usize {
    let Some(sender) = channels.get(channel) else {
        return 0;
    };
    match sender.send(message) {
        Ok(receivers) => receivers,
        Err(_) => {
            // every subscriber is gone
            channels.remove(channel);
            0
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn time(&self) -> Result<i64> {
        Ok(self.clock.now_millis())
    }

    async fn eval(&self, ctx: ScriptContext, script: Script) -> Result<Reply> {
        self.with_keyspace(|keyspace| engine::execute(keyspace, &ctx, script))
            .await
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize> {
        let mut state = self.state.lock().await;
        Ok(deliver(&mut state.channels, channel, message))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let mut state = self.state.lock().await;
        let capacity = self.channel_capacity;
        let sender = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(sender.subscribe())
    }

    async fn sinter(&self, keys: &[String]) -> Result<Vec<String>> {
        Ok(self.with_keyspace(|keyspace| keyspace.sinter(keys)).await)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.with_keyspace(|keyspace| keyspace.zcard(key)).await)
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>> {
        Ok(self
            .with_keyspace(|keyspace| keyspace.zrank(key, member))
            .await)
    }
}
