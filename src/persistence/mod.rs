use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::execution::ledger::SimulatedPosition;
use crate::Result;

/// Paper account balance snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperBalance {
    pub wallet_balance: f64,
    pub equity: f64,
    /// Free margin at the time of the snapshot
    pub available: f64,
    pub updated_at: DateTime<Utc>,
}

/// Storage for the simulated account between restarts
///
/// The ledger reads and writes at checkpoints (startup, after fills), not every tick.
#[async_trait]
pub trait PaperStore: Send + Sync {
    async fn load_balance(&self) -> Result<Option<PaperBalance>>;

    async fn save_balance(&self, balance: &PaperBalance) -> Result<()>;

    async fn load_positions(&self) -> Result<Vec<SimulatedPosition>>;

    async fn save_positions(&self, positions: &[SimulatedPosition]) -> Result<()>;
}

/// Redis-backed paper store
///
/// Keys: `{prefix}:balance` and `{prefix}:positions`, both JSON strings.
pub struct RedisPaperStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisPaperStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `prefix` - Key namespace, e.g. "perpbot:paper"
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }
}

#[async_trait]
impl PaperStore for RedisPaperStore {
    async fn load_balance(&self) -> Result<Option<PaperBalance>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key("balance")).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_balance(&self, balance: &PaperBalance) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(balance)?;
        conn.set::<_, _, ()>(self.key("balance"), json).await?;
        tracing::debug!("Saved paper balance: equity={:.2}", balance.equity);
        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<SimulatedPosition>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key("positions")).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_positions(&self, positions: &[SimulatedPosition]) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(positions)?;
        conn.set::<_, _, ()>(self.key("positions"), json).await?;
        tracing::debug!("Saved {} paper positions", positions.len());
        Ok(())
    }
}

/// In-process store, used when no Redis URL is configured
#[derive(Default)]
pub struct MemoryPaperStore {
    balance: Mutex<Option<PaperBalance>>,
    positions: Mutex<Vec<SimulatedPosition>>,
}

impl MemoryPaperStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaperStore for MemoryPaperStore {
    async fn load_balance(&self) -> Result<Option<PaperBalance>> {
        Ok(self.balance.lock().map_err(|e| e.to_string())?.clone())
    }

    async fn save_balance(&self, balance: &PaperBalance) -> Result<()> {
        *self.balance.lock().map_err(|e| e.to_string())? = Some(balance.clone());
        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<SimulatedPosition>> {
        Ok(self.positions.lock().map_err(|e| e.to_string())?.clone())
    }

    async fn save_positions(&self, positions: &[SimulatedPosition]) -> Result<()> {
        *self.positions.lock().map_err(|e| e.to_string())? = positions.to_vec();
        Ok(())
    }
}
