use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{debug, info};

use crate::{
    clients::state_store::StateStore,
    config::Config,
    models::{circuit_breaker::STATE_KEY_PREFIX, retry::RetryConfig},
    utils::retry_with_backoff,
};

pub struct RedisStateStore {
    connection: MultiplexedConnection,
    circuit_key_ttl: Duration,
    default_ttl: Duration,
}

impl RedisStateStore {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let redis_url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| anyhow!("REDIS_URL is not configured"))?;

        Self::connect_with(
            redis_url,
            &config.retry_config(),
            Duration::from_secs(config.redis_circuit_key_ttl_seconds),
            Duration::from_secs(config.redis_key_ttl_seconds),
        )
        .await
    }

    pub async fn connect_with(
        redis_url: &str,
        retry_config: &RetryConfig,
        circuit_key_ttl: Duration,
        default_ttl: Duration,
    ) -> Result<Self, Error> {
        info!("Connecting to Redis state store");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = retry_with_backoff(retry_config, || {
            let client = client.clone();
            async move { client.get_multiplexed_async_connection().await }
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!(
            circuit_key_ttl_secs = circuit_key_ttl.as_secs(),
            default_ttl_secs = default_ttl.as_secs(),
            "Redis state store connection established"
        );

        Ok(Self {
            connection,
            circuit_key_ttl,
            default_ttl,
        })
    }

    /// Circuit keys expire quickly so a crashed writer cannot pin a stale
    /// state; everything else lives for the general TTL.
    pub fn ttl_for(&self, key: &str) -> Duration {
        if key.starts_with(STATE_KEY_PREFIX) {
            self.circuit_key_ttl
        } else {
            self.default_ttl
        }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let ttl = self.ttl_for(key).as_secs().max(1);

        connection.set_ex::<_, _, ()>(key, value, ttl).await?;

        debug!(key, ttl_secs = ttl, "Redis key written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
