//! In-process store backend.
//!
//! Mirrors the subset of Redis semantics the gateway relies on, including
//! lazy key expiry. Only shared within one process, so it is suitable for
//! single-node runs and tests.

use super::{KvStore, StoreFuture};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use switchboard_core::{SbError, SbResult};
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A process-local [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch a live entry, dropping it first if it has expired.
    fn live<'m>(map: &'m mut HashMap<String, Entry>, key: &str) -> Option<&'m mut Entry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn wrong_type(key: &str) -> SbError {
        SbError::Store(format!("WRONGTYPE operation against key {key}"))
    }

    fn incr_by(&self, key: &str, delta: i64, ttl_on_create: Option<Duration>) -> SbResult<i64> {
        let mut map = self.lock();
        let next = match Self::live(&mut map, key) {
            Some(entry) => {
                let Value::Str(s) = &entry.value else {
                    return Err(Self::wrong_type(key));
                };
                let current: i64 = s
                    .parse()
                    .map_err(|_| SbError::Store(format!("value at {key} is not an integer")))?;
                let next = current + delta;
                entry.value = Value::Str(next.to_string());
                next
            }
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(delta.to_string()),
                        expires_at: None,
                    },
                );
                delta
            }
        };

        if next == 1 {
            if let (Some(ttl), Some(entry)) = (ttl_on_create, map.get_mut(key)) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        if next <= 0 {
            map.remove(key);
        }
        Ok(next)
    }
}

fn normalize_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut map = self.lock();
            match Self::live(&mut map, key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Ok(Some(s.clone())),
                Some(_) => Err(Self::wrong_type(key)),
                None => Ok(None),
            }
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.lock().insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn incr_with_expiry<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, i64> {
        Box::pin(async move { self.incr_by(key, 1, Some(ttl)) })
    }

    fn decr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move { self.incr_by(key, -1, None) })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let mut map = self.lock();
            let now = Instant::now();
            Ok(Self::live(&mut map, key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        })
    }

    fn list_push_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut map = self.lock();
            let expires_at = Some(Instant::now() + ttl);
            match Self::live(&mut map, key) {
                Some(entry) => {
                    let Value::List(list) = &mut entry.value else {
                        return Err(Self::wrong_type(key));
                    };
                    list.push_back(value);
                    entry.expires_at = expires_at;
                    Ok(list.len() as u64)
                }
                None => {
                    map.insert(
                        key.to_string(),
                        Entry {
                            value: Value::List(VecDeque::from([value])),
                            expires_at,
                        },
                    );
                    Ok(1)
                }
            }
        })
    }

    fn list_range<'a>(
        &'a self,
        key: &'a str,
        start: isize,
        stop: isize,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut map = self.lock();
            match Self::live(&mut map, key) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => Ok(match normalize_range(list.len(), start, stop) {
                    Some((from, to)) => list.range(from..=to).cloned().collect(),
                    None => Vec::new(),
                }),
                Some(_) => Err(Self::wrong_type(key)),
                None => Ok(Vec::new()),
            }
        })
    }

    fn list_take<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut map = self.lock();
            if let Some(entry) = Self::live(&mut map, key) {
                if !matches!(entry.value, Value::List(_)) {
                    return Err(Self::wrong_type(key));
                }
            }
            match map.remove(key) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => Ok(list.into_iter().collect()),
                _ => Ok(Vec::new()),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut map = self.lock();
            let existed = Self::live(&mut map, key).is_some();
            map.remove(key);
            Ok(existed)
        })
    }
}
