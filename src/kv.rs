//! Fast key-value store client with managed reconnection.
//!
//! Thin operation set over `redis::aio::ConnectionManager`; domain semantics
//! (counter keys, recent lists, presence sets) live in the modules that own
//! the keys. Clone is cheap and hands out the same multiplexed connection.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands, Script};

const CONNECT_TIMEOUT_SECS: u64 = 10;

// INCR plus conditional EXPIRE in one round trip; the window starts when the
// key is first touched and never extends on later increments.
const COUNTER_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Clone)]
pub struct KvClient {
    conn: ConnectionManager,
}

impl KvClient {
    /// Connect to Redis; fails fast instead of hanging on an unreachable
    /// server. Supports both redis:// and rediss:// (TLS) URLs.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ConnectionManager::new(client),
        )
        .await
        .context("Redis connection timed out")?
        .context("Redis connection failed")?;
        Ok(Self { conn })
    }

    pub async fn ping(&mut self) -> redis::RedisResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    // ============================================================================
    // Atomic counter windows
    // ============================================================================

    /// Increment `key` and arm its TTL window atomically. Returns the count
    /// after the increment.
    pub async fn counter_window(&mut self, key: &str, window_secs: i64) -> redis::RedisResult<i64> {
        Script::new(COUNTER_WINDOW_SCRIPT)
            .key(key)
            .arg(window_secs)
            .invoke_async(&mut self.conn)
            .await
    }

    /// TTL - remaining window in seconds (-1 without expiry, -2 if missing)
    pub async fn ttl(&mut self, key: &str) -> redis::RedisResult<i64> {
        self.conn.ttl(key).await
    }

    // ============================================================================
    // Bounded list operations
    // ============================================================================

    /// Push to the head of a capped list and refresh its TTL.
    pub async fn push_capped(
        &mut self,
        key: &str,
        value: &[u8],
        cap: usize,
        ttl_secs: i64,
    ) -> redis::RedisResult<()> {
        let _: i64 = self.conn.lpush(key, value).await?;
        let _: () = self.conn.ltrim(key, 0, cap as isize - 1).await?;
        let _: bool = self.conn.expire(key, ttl_secs).await?;
        Ok(())
    }

    /// Full contents of a list, head first. Empty vec when the key is gone.
    pub async fn list_all(&mut self, key: &str) -> redis::RedisResult<Vec<Vec<u8>>> {
        self.conn.lrange(key, 0, -1).await
    }

    /// Replace a list wholesale, head first, and arm its TTL.
    pub async fn replace_list(
        &mut self,
        key: &str,
        values: &[Vec<u8>],
        ttl_secs: i64,
    ) -> redis::RedisResult<()> {
        let _: i64 = self.conn.del(key).await?;
        if values.is_empty() {
            return Ok(());
        }
        // RPUSH preserves head-first order of the slice
        let _: i64 = self.conn.rpush(key, values).await?;
        let _: bool = self.conn.expire(key, ttl_secs).await?;
        Ok(())
    }

    pub async fn del(&mut self, key: &str) -> redis::RedisResult<i64> {
        self.conn.del(key).await
    }

    // ============================================================================
    // Set operations
    // ============================================================================

    pub async fn sadd(&mut self, key: &str, member: &str) -> redis::RedisResult<i64> {
        self.conn.sadd(key, member).await
    }

    pub async fn srem(&mut self, key: &str, member: &str) -> redis::RedisResult<i64> {
        self.conn.srem(key, member).await
    }

    pub async fn expire(&mut self, key: &str, seconds: i64) -> redis::RedisResult<bool> {
        self.conn.expire(key, seconds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn counter_window_increments_and_arms_ttl() {
        let mut kv = KvClient::connect("redis://localhost:6379").await.unwrap();
        let key = "test:counter_window";
        kv.del(key).await.unwrap();

        assert_eq!(kv.counter_window(key, 60).await.unwrap(), 1);
        assert_eq!(kv.counter_window(key, 60).await.unwrap(), 2);
        let ttl = kv.ttl(key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);

        kv.del(key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn capped_list_trims_to_cap() {
        let mut kv = KvClient::connect("redis://localhost:6379").await.unwrap();
        let key = "test:capped_list";
        kv.del(key).await.unwrap();

        for i in 0..5u8 {
            kv.push_capped(key, &[i], 3, 60).await.unwrap();
        }
        let items = kv.list_all(key).await.unwrap();
        assert_eq!(items.len(), 3);
        // Newest entry sits at the head
        assert_eq!(items[0], vec![4]);

        kv.del(key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn replace_list_preserves_order() {
        let mut kv = KvClient::connect("redis://localhost:6379").await.unwrap();
        let key = "test:replace_list";
        kv.del(key).await.unwrap();

        let values = vec![vec![1u8], vec![2], vec![3]];
        kv.replace_list(key, &values, 60).await.unwrap();
        assert_eq!(kv.list_all(key).await.unwrap(), values);

        kv.del(key).await.unwrap();
    }
}
