//! Backing store port.
//!
//! Every auxiliary service talks to a shared remote key-value/list store
//! through [`KvStore`]. Values cross this boundary as opaque bytes; callers
//! JSON-encode them first.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreResult;
use crate::registry::Component;

pub use memory::{InMemoryConnector, InMemoryStore};
#[cfg(feature = "redis")]
pub use self::redis::{RedisConnector, RedisStore};

/// Key-value and list primitives the services rely on.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Liveness round-trip.
    async fn ping(&self) -> StoreResult<()>;

    /// Read a value. `Ok(None)` means the key is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a value without expiry.
    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Write a value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Delete keys in one batch. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Resolve keys matching a Redis glob pattern.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Push onto the head of a list.
    async fn lpush(&self, list: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Push onto the tail of a list (the end `brpop` consumes from).
    async fn rpush(&self, list: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Pop from the tail of a list, waiting up to `timeout` for an element.
    ///
    /// Returns `Ok(None)` when the wait elapses with the list still empty.
    async fn brpop(&self, list: &str, timeout: Duration) -> StoreResult<Option<Vec<u8>>>;

    async fn llen(&self, list: &str) -> StoreResult<u64>;

    /// Remove every occurrence of `value`. Returns how many were removed.
    async fn lrem(&self, list: &str, value: &[u8]) -> StoreResult<u64>;

    /// Elements between `start` and `stop` inclusive; negative indexes count
    /// from the tail (`-1` is the last element).
    async fn lrange(&self, list: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>>;
}

/// Opens store handles for each component during registry initialization.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, component: Component) -> StoreResult<Arc<dyn KvStore>>;
}

/// Redis-style glob: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    match_from(&p, &c)
}

fn match_from(p: &[char], c: &[char]) -> bool {
    let Some((&head, rest)) = p.split_first() else {
        return c.is_empty();
    };
    match head {
        '*' => {
            let rest = &rest[rest.iter().take_while(|&&ch| ch == '*').count()..];
            (0..=c.len()).any(|skip| match_from(rest, &c[skip..]))
        }
        '?' => !c.is_empty() && match_from(rest, &c[1..]),
        '[' => match c.split_first() {
            Some((&ch, tail)) => {
                let (matched, after) = match_class(rest, ch);
                matched && match_from(after, tail)
            }
            None => false,
        },
        '\\' if !rest.is_empty() => c.first() == Some(&rest[0]) && match_from(&rest[1..], &c[1..]),
        literal => c.first() == Some(&literal) && match_from(rest, &c[1..]),
    }
}

/// Match `ch` against the class body following `[`. Returns the verdict and
/// the pattern after the closing `]`.
fn match_class(p: &[char], ch: char) -> (bool, &[char]) {
    let (negate, mut i) = match p.first() {
        Some('^') => (true, 1),
        _ => (false, 0),
    };
    let mut matched = false;

    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == ch;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] { (p[i], p[i + 2]) } else { (p[i + 2], p[i]) };
            matched |= (lo..=hi).contains(&ch);
            i += 3;
        } else {
            matched |= p[i] == ch;
            i += 1;
        }
    }

    // An unterminated class runs to the end of the pattern.
    let rest = if i < p.len() { &p[i + 1..] } else { &p[p.len()..] };
    (matched != negate, rest)
}
