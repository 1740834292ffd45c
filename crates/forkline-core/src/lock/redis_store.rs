// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed lock store.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::info;

use super::traits::{LockStore, Result};

/// Delete the key only when it still holds the caller's token.
///
/// Runs as a single server-side script, so no other client can interleave
/// between the comparison and the delete.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock store on a Redis (or Valkey) server.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    release: Script,
}

impl RedisLockStore {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis lock store");
        Ok(Self::new(conn))
    }

    /// Use an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    fn store_type(&self) -> &'static str {
        "redis"
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET key token NX PX ttl → "OK" when set, nil when the key exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.release.key(key);
        invocation.arg(token);
        let deleted: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(deleted == 1)
    }
}
