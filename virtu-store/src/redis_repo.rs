use async_trait::async_trait;
use redis::{AsyncCommands, RedisResult};
use tracing::info;

use virtu_core::repository::SweepLock;
use virtu_core::{CoreError, CoreResult};

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Cache a serialized catalog response per provider/region.
    pub async fn cache_catalog(
        &self,
        provider: &str,
        region: &str,
        payload: &str,
        ttl_seconds: u64,
    ) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("catalog:{}:{}", provider, region);
        conn.set_ex::<_, _, ()>(key, payload, ttl_seconds).await?;
        Ok(())
    }

    pub async fn get_cached_catalog(
        &self,
        provider: &str,
        region: &str,
    ) -> RedisResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("catalog:{}:{}", provider, region);
        conn.get(key).await
    }

    /// SET NX lock so only one instance runs the reconciliation sweep at a
    /// time. Returns false when another holder has it.
    pub async fn acquire_sweep_lock(
        &self,
        holder: &str,
        ttl_seconds: u64,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg("sweep:reconciliation:lock")
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        if result.is_some() {
            info!(holder, "sweep lock acquired");
        }
        Ok(result.is_some())
    }

    /// Release only if we still hold it; an expired-and-reacquired lock is
    /// left alone.
    pub async fn release_sweep_lock(&self, holder: &str) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#,
        );
        let deleted: i64 = script
            .key("sweep:reconciliation:lock")
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl SweepLock for RedisClient {
    async fn acquire(&self, holder: &str, ttl_seconds: u64) -> CoreResult<bool> {
        self.acquire_sweep_lock(holder, ttl_seconds)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    async fn release(&self, holder: &str) -> CoreResult<bool> {
        self.release_sweep_lock(holder)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }
}
