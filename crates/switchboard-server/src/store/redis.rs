//! Redis store backend.
//!
//! Uses a multiplexed [`ConnectionManager`] that reconnects on its own.
//! Read-modify-write operations run as Lua scripts or MULTI pipelines so they
//! stay atomic across gateway processes.

use super::{KvStore, StoreFuture};
use ::redis::aio::ConnectionManager;
use ::redis::{RedisError, Script};
use std::time::Duration;
use switchboard_core::{SbError, SbResult};
use tracing::info;

/// INCR, arming the TTL only when the counter was just created.
const INCR_WITH_EXPIRY: &str = r"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
";

/// DECR, deleting the counter once it reaches zero.
const DECR_OR_DELETE: &str = r"
local v = redis.call('DECR', KEYS[1])
if v <= 0 then
  redis.call('DEL', KEYS[1])
end
return v
";

fn store_err(e: RedisError) -> SbError {
    SbError::Store(e.to_string())
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// A [`KvStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    incr_script: Script,
    decr_script: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> SbResult<Self> {
        let client = ::redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        info!(url, "connected to redis");
        Ok(Self {
            conn,
            incr_script: Script::new(INCR_WITH_EXPIRY),
            decr_script: Script::new(DECR_OR_DELETE),
        })
    }
}

impl KvStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            ::redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .map_err(store_err)
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(store_err)
        })
    }

    fn incr_with_expiry<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            self.incr_script
                .key(key)
                .arg(millis(ttl))
                .invoke_async::<_, i64>(&mut conn)
                .await
                .map_err(store_err)
        })
    }

    fn decr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            self.decr_script
                .key(key)
                .invoke_async::<_, i64>(&mut conn)
                .await
                .map_err(store_err)
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // -2: key absent, -1: no expiry.
            let ms: i64 = ::redis::cmd("PTTL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
        })
    }

    fn list_push_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let (len, _armed): (u64, i64) = ::redis::pipe()
                .atomic()
                .cmd("RPUSH")
                .arg(key)
                .arg(value)
                .cmd("PEXPIRE")
                .arg(key)
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            Ok(len)
        })
    }

    fn list_range<'a>(
        &'a self,
        key: &'a str,
        start: isize,
        stop: isize,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            ::redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async::<_, Vec<String>>(&mut conn)
                .await
                .map_err(store_err)
        })
    }

    fn list_take<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let (items, _deleted): (Vec<String>, i64) = ::redis::pipe()
                .atomic()
                .cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            Ok(items)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = ::redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            Ok(removed > 0)
        })
    }
}
