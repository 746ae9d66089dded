//! Persistence and cache layer: Postgres for durable state, Redis for
//! hot cache/pub-sub.

pub mod postgres;
pub mod redis;

use crate::config::AppConfig;
use crate::core::CoreResult;
use std::sync::Arc;

pub use postgres::{AccountRow, PostgresManager};
pub use redis::RedisManager;

/// Owns both backends; every service holds an `Arc<DatabaseManager>`.
#[derive(Clone)]
pub struct DatabaseManager {
    pub postgres: Arc<PostgresManager>,
    pub redis: Arc<RedisManager>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub postgres_ok: bool,
    pub redis_ok: bool,
}

impl DatabaseManager {
    pub async fn new(config: &AppConfig) -> CoreResult<Self> {
        let postgres = PostgresManager::new(
            &config.database.url,
            config.database.max_connections,
        )
        .await?;
        let redis = RedisManager::new(
            &config.redis.url,
            config.redis.max_connections as usize,
            config.redis.price_ttl_secs,
        )?;
        Ok(Self {
            postgres: Arc::new(postgres),
            redis: Arc::new(redis),
        })
    }

    pub async fn health_check(&self) -> DatabaseHealth {
        DatabaseHealth {
            postgres_ok: self.postgres.health_check().await.is_ok(),
            redis_ok: self.redis.health_check().await.is_ok(),
        }
    }
}
