use crate::queue::{Broker, QueueResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;

/// Redis list broker: LPUSH to enqueue, RPOP to dequeue, so each channel is FIFO
pub struct RedisBroker {
    conn: MultiplexedConnection,
}

impl RedisBroker {
    /// Connects to Redis
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!("Connected to Redis at {}", url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, channel: &str, payload: String) -> QueueResult<()> {
        // multiplexed connections are cheap to clone and safe to use concurrently
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, channel: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("RPOP")
            .arg(channel)
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn len(&self, channel: &str) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("LLEN")
            .arg(channel)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
