use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::{KvStore, StoreError, MAX_TTL};

const DELETE_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const TAKE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
end
return due
"#;

/// Redis-backed `KvStore` sharing one multiplexed connection.
///
/// Only non-blocking commands are issued so the multiplexed connection is never
/// parked behind a blocking pop; idle workers poll instead.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(client: &redis::Client) -> Result<Self, StoreError> {
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Redis multiplexed connection established");
        Ok(Self { conn })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(DELETE_IF_EQ)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, value).await?;
        Ok(())
    }

    async fn try_pop(&self, queue: &str, processing: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("LMOVE")
            .arg(queue)
            .arg(processing)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn ack(&self, processing: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(processing, 1, value).await?;
        Ok(())
    }

    async fn schedule(&self, zset: &str, value: &str, due_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(zset, value, due_ms).await?;
        Ok(())
    }

    async fn take_due(
        &self,
        zset: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = Script::new(TAKE_DUE)
            .key(zset)
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(due)
    }

    async fn requeue_processing(
        &self,
        processing: &str,
        queue: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            // LEFT of processing is the newest; RIGHT of the queue is the next to pop.
            let value: Option<String> = redis::cmd("LMOVE")
                .arg(processing)
                .arg(queue)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if value.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_is_positive_and_bounded() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
        assert_eq!(ttl_millis(Duration::MAX), MAX_TTL.as_millis() as u64);
        assert_eq!(
            ttl_millis(Duration::from_secs(u64::MAX)),
            MAX_TTL.as_millis() as u64
        );
    }
}
