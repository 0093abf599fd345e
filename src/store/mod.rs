//! Coordination store abstraction.
//!
//! The scheduler keeps all shared state in a coordination store: a keyed
//! namespace of strings, hashes, sets, sorted sets and lists, with pub/sub
//! channels and server-side scripts that execute atomically. This module
//! defines the two seams to such a store:
//!
//! - [`CoordinationStore`] is what hives talk to. It runs a whole engine
//!   [`Script`] as one atomic unit, fans out channel messages and answers a
//!   handful of read-only queries.
//! - [`Keyspace`] is what scripts run against. It exposes the primitive
//!   key operations of the store; an implementation guarantees that nothing
//!   else touches the namespace while a script holds it.
//!
//! [`memory::MemoryStore`] implements both in-process. It is shared between
//! any number of hives in one process, which is how the test suite simulates
//! a cluster.

use crate::{
    Result,
    engine::{Reply, Script, ScriptContext},
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::{Clock, MemoryStore, MockClock};

/// Operations the scheduler needs from its coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Store time in milliseconds since the Unix epoch.
    ///
    /// Hives read it before every script so all of them agree on "now".
    async fn time(&self) -> Result<i64>;

    /// Execute a script atomically and flush the messages it published.
    async fn eval(&self, ctx: ScriptContext, script: Script) -> Result<Reply>;

    /// Publish on a channel, returning the number of receivers.
    async fn publish(&self, channel: &str, message: String) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;

    /// Members common to every given set.
    async fn sinter(&self, keys: &[String]) -> Result<Vec<String>>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Zero-based position of `member` in a sorted set.
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>>;
}

/// Primitive key operations available to scripts.
///
/// Reads take `&mut self` because implementations evict expired keys lazily.
/// Published messages are buffered and only delivered once the script
/// finishes.
pub trait Keyspace {
    fn get(&mut self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
    fn del(&mut self, key: &str) -> bool;
    fn exists(&mut self, key: &str) -> bool;
    /// Expire `key` at an absolute time in milliseconds.
    fn pexpire_at(&mut self, key: &str, at_ms: i64) -> bool;

    fn hget(&mut self, key: &str, field: &str) -> Option<String>;
    fn hset(&mut self, key: &str, field: &str, value: String);
    fn hgetall(&mut self, key: &str) -> HashMap<String, String>;
    fn hdel(&mut self, key: &str, field: &str) -> bool;

    fn sadd(&mut self, key: &str, member: &str) -> bool;
    fn srem(&mut self, key: &str, member: &str) -> bool;
    /// Members in lexicographic order.
    fn smembers(&mut self, key: &str) -> Vec<String>;
    fn sismember(&mut self, key: &str, member: &str) -> bool;
    fn scard(&mut self, key: &str) -> usize;
    fn sinter(&mut self, keys: &[String]) -> Vec<String>;

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> bool;
    fn zrem(&mut self, key: &str, member: &str) -> bool;
    fn zscore(&mut self, key: &str, member: &str) -> Option<f64>;
    fn zcard(&mut self, key: &str) -> usize;
    fn zrank(&mut self, key: &str, member: &str) -> Option<usize>;
    /// Members with `min <= score <= max` in ascending order, at most `limit`.
    fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Vec<(String, f64)>;
    /// Up to `count` members from the lowest score upwards.
    fn zrange(&mut self, key: &str, count: usize) -> Vec<String>;

    fn rpush(&mut self, key: &str, value: String) -> usize;
    fn lrange(&mut self, key: &str) -> Vec<String>;

    fn publish(&mut self, channel: &str, message: String);
}
