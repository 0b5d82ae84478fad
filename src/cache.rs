use std::{fmt, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};

/// Flat key/value cache with per-entry TTL.
///
/// `get` returns `Ok(None)` only for a clean miss; every other backend
/// failure is an `Err` so callers can tell the two apart.
#[async_trait]
pub trait EntityCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn invalidate(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url).context("create redis client")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl EntityCache for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .with_context(|| format!("redis GET {key}"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .with_context(|| format!("redis SET {key}"))?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .del(key)
            .await
            .with_context(|| format!("redis DEL {key}"))?;
        Ok(())
    }
}
