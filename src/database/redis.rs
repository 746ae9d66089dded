//! Cache and pub/sub layer backed by Redis.
//!
//! Key/channel names follow SPEC_FULL.md §6 exactly so every service reads
//! and writes the same namespace regardless of which process it runs in.

use crate::core::{CoreResult, LeaderLease, PriceUpdateMessage, Quote, SymbolUpdateMessage};
use chrono::Utc;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Clone)]
pub struct RedisManager {
    pool: Pool,
    price_ttl_secs: u64,
    redis_url: String,
}

impl RedisManager {
    pub fn new(redis_url: &str, max_connections: usize, price_ttl_secs: u64) -> CoreResult<Self> {
        let mut cfg = Config::from_url(redis_url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(max_connections));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| crate::core::CoreError::Fatal(format!("redis pool: {e}")))?;
        Ok(Self { pool, price_ttl_secs, redis_url: redis_url.to_string() })
    }

    async fn conn(&self) -> CoreResult<Connection> {
        self.pool.get().await.map_err(|e| {
            crate::core::CoreError::Transient(format!("redis pool exhausted: {e}"))
        })
    }

    pub async fn health_check(&self) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(value)?;
        match ttl_secs {
            Some(ttl) => conn.set_ex(key, payload, ttl).await?,
            None => conn.set(key, payload).await?,
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn publish_json<T: Serialize>(&self, channel: &str, value: &T) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(value)?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    // -- tracked_symbols --------------------------------------------------

    pub async fn get_tracked_symbols(&self) -> CoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.smembers("tracked_symbols").await?;
        Ok(members)
    }

    pub async fn set_tracked_symbols(&self, symbols: &[String]) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del("tracked_symbols").await?;
        if !symbols.is_empty() {
            let _: () = conn.sadd("tracked_symbols", symbols).await?;
        }
        Ok(())
    }

    pub async fn publish_symbol_update(&self, msg: &SymbolUpdateMessage) -> CoreResult<()> {
        self.publish_json("symbol_updates", msg).await
    }

    // -- account_positions:{account_id} (1h TTL) ---------------------------

    pub async fn cache_account_positions<T: Serialize>(
        &self,
        account_id: &str,
        positions: &T,
    ) -> CoreResult<()> {
        self.set_json(&format!("account_positions:{account_id}"), positions, Some(3600))
            .await
    }

    pub async fn get_account_positions<T: DeserializeOwned>(
        &self,
        account_id: &str,
    ) -> CoreResult<Option<T>> {
        self.get_json(&format!("account_positions:{account_id}")).await
    }

    // -- price:{symbol} / quote:{symbol} (price_ttl) -----------------------

    pub async fn cache_quote(&self, quote: &Quote) -> CoreResult<()> {
        self.set_json(
            &format!("quote:{}", quote.symbol),
            quote,
            Some(self.price_ttl_secs),
        )
        .await?;
        self.set_json(
            &format!("price:{}", quote.symbol),
            &quote.ask_price,
            Some(self.price_ttl_secs),
        )
        .await
    }

    pub async fn get_quote(&self, symbol: &str) -> CoreResult<Option<Quote>> {
        self.get_json(&format!("quote:{symbol}")).await
    }

    /// Removes both cache entries for a symbol no longer in `tracked_symbols`,
    /// keeping the "a Quote exists iff its symbol is tracked" invariant.
    pub async fn delete_quote(&self, symbol: &str) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(format!("price:{symbol}")).await?;
        let _: () = conn.del(format!("quote:{symbol}")).await?;
        Ok(())
    }

    pub async fn publish_price_update(&self, msg: &PriceUpdateMessage) -> CoreResult<()> {
        self.publish_json("price_updates", msg).await
    }

    // -- last_portfolio:{account_id} (no TTL) ------------------------------

    pub async fn cache_last_portfolio<T: Serialize>(&self, account_id: &str, snapshot: &T) -> CoreResult<()> {
        self.set_json(&format!("last_portfolio:{account_id}"), snapshot, None).await
    }

    pub async fn get_last_portfolio<T: DeserializeOwned>(&self, account_id: &str) -> CoreResult<Option<T>> {
        self.get_json(&format!("last_portfolio:{account_id}")).await
    }

    pub async fn publish_portfolio_update<T: Serialize>(&self, snapshot: &T) -> CoreResult<()> {
        self.publish_json("portfolio_updates", snapshot).await
    }

    /// A live subscription to `portfolio_updates`, used by the process-wide
    /// WebSocket Broadcaster fan-out task.
    pub async fn subscribe_portfolio_updates(&self) -> CoreResult<redis::aio::PubSub> {
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| crate::core::CoreError::Fatal(format!("redis client: {e}")))?;
        let mut pubsub = client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe("portfolio_updates").await?;
        Ok(pubsub)
    }

    // -- {service}:leader (lease_duration TTL) -----------------------------

    /// Attempt to acquire leadership via `SET key value NX EX ttl`.
    pub async fn try_acquire_leadership(
        &self,
        service: &str,
        instance_id: &str,
        lease_duration_secs: u64,
    ) -> CoreResult<bool> {
        let mut conn = self.conn().await?;
        let key = format!("{service}:leader");
        let acquired: bool = redis::cmd("SET")
            .arg(&key)
            .arg(instance_id)
            .arg("NX")
            .arg("EX")
            .arg(lease_duration_secs)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(acquired)
    }

    /// Renew the lease iff still held by `instance_id`. Returns `false` if
    /// leadership was lost (another instance holds or held the key).
    pub async fn renew_leadership(
        &self,
        service: &str,
        instance_id: &str,
        lease_duration_secs: u64,
    ) -> CoreResult<bool> {
        let mut conn = self.conn().await?;
        let key = format!("{service}:leader");
        let current: Option<String> = conn.get(&key).await?;
        if current.as_deref() != Some(instance_id) {
            return Ok(false);
        }
        let _: () = conn.set_ex(&key, instance_id, lease_duration_secs).await?;
        Ok(true)
    }

    /// Release leadership iff still held by `instance_id` — a conditional
    /// delete so a stalled instance can't clobber a newer leader's key.
    pub async fn release_leadership(&self, service: &str, instance_id: &str) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let key = format!("{service}:leader");
        let current: Option<String> = conn.get(&key).await?;
        if current.as_deref() == Some(instance_id) {
            let _: () = conn.del(&key).await?;
        }
        Ok(())
    }

    pub async fn current_leader(&self, service: &str) -> CoreResult<Option<LeaderLease>> {
        let mut conn = self.conn().await?;
        let key = format!("{service}:leader");
        let instance_id: Option<String> = conn.get(&key).await?;
        let ttl: i64 = conn.ttl(&key).await?;
        Ok(instance_id.map(|instance_id| LeaderLease {
            key: key.clone(),
            instance_id,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl.max(0)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Option<RedisManager> {
        let url = std::env::var("TEST_REDIS_URL").ok()?;
        RedisManager::new(&url, 4, 3600).ok()
    }

    #[tokio::test]
    async fn leadership_round_trip() {
        let Some(mgr) = manager() else {
            eprintln!("skipping: TEST_REDIS_URL not set");
            return;
        };
        let acquired = mgr.try_acquire_leadership("test_svc", "instance-a", 5).await.unwrap();
        assert!(acquired);
        let renewed = mgr.renew_leadership("test_svc", "instance-a", 5).await.unwrap();
        assert!(renewed);
        let stolen = mgr.try_acquire_leadership("test_svc", "instance-b", 5).await.unwrap();
        assert!(!stolen);
        mgr.release_leadership("test_svc", "instance-a").await.unwrap();
    }
}
