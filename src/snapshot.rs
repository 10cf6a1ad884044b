//! Published JSON snapshots of the mined-block dataset and price history.
//!
//! Each document is fetched from a primary base URL and, on any HTTP or decode failure,
//! from a backup base URL. Both failing is [`AggregatorError::SnapshotUnavailable`].

use crate::error::{AggregatorError, Result};
use crate::scanner::MintDataset;
use crate::utils::constants::{MINED_BLOCKS_FILE, PRICE_DATA_FILE};
use crate::utils::error::compact_error_message;
use crate::utils::hex::b256_from_hex;
use alloy::primitives::B256;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const SNAPSHOT_TIMEOUT_SECS: u64 = 30;
const SNAPSHOT_ERR_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MinedBlocksSnapshot {
    /// Newest first; entries are `[block, txHash, miner, reward, epochCount]`.
    #[serde(default)]
    pub mined_blocks: Vec<Value>,
    #[serde(default)]
    pub latest_block_number: u64,
    #[serde(default)]
    pub previous_challenge: Option<String>,
    #[serde(default)]
    pub difficulty_start_block: Option<u64>,
    #[serde(default)]
    pub last_updated: Option<u64>,
}

impl MinedBlocksSnapshot {
    pub fn previous_challenge(&self) -> Option<B256> {
        self.previous_challenge.as_deref().and_then(b256_from_hex)
    }

    /// Entries that fail to decode are skipped.
    pub fn dataset(&self) -> MintDataset {
        MintDataset::from_json_entries(&self.mined_blocks)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PriceHistory {
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default)]
    pub timestamps: Vec<u64>,
    #[serde(default)]
    pub blocks: Vec<u64>,
    #[serde(default)]
    pub last_updated: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub block: u64,
    pub timestamp: u64,
    pub price: f64,
}

impl PriceHistory {
    /// The three arrays must be parallel.
    pub fn validate(&self) -> Result<()> {
        let n = self.prices.len();
        if self.timestamps.len() != n || self.blocks.len() != n {
            return Err(AggregatorError::decode(format!(
                "price history arrays differ in length (prices={}, timestamps={}, blocks={})",
                n,
                self.timestamps.len(),
                self.blocks.len()
            )));
        }
        Ok(())
    }

    pub fn points(&self) -> Vec<PricePoint> {
        self.prices
            .iter()
            .zip(&self.timestamps)
            .zip(&self.blocks)
            .map(|((price, timestamp), block)| PricePoint {
                block: *block,
                timestamp: *timestamp,
                price: *price,
            })
            .collect()
    }
}

#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_mined_blocks(&self) -> Result<MinedBlocksSnapshot>;
    async fn fetch_price_history(&self) -> Result<PriceHistory>;
}

/// A primary/backup pair of base URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePair {
    pub primary: Option<String>,
    pub backup: Option<String>,
}

impl SourcePair {
    pub fn new(primary: Option<String>, backup: Option<String>) -> Self {
        Self { primary, backup }
    }
}

pub fn snapshot_url(base: &str, file: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), file)
}

pub struct HttpSnapshotFetcher {
    client: reqwest::Client,
    mined_blocks: SourcePair,
    prices: SourcePair,
}

impl HttpSnapshotFetcher {
    pub fn new(mined_blocks: SourcePair, prices: SourcePair) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SNAPSHOT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AggregatorError::fatal(format!("snapshot http client: {e}")))?;
        Ok(Self {
            client,
            mined_blocks,
            prices,
        })
    }

    async fn fetch_one<T: DeserializeOwned>(&self, base: Option<&str>, file: &str) -> std::result::Result<T, String> {
        let Some(base) = base else {
            return Err("not configured".to_string());
        };
        let url = snapshot_url(base, file);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| compact_error_message(&format!("{url}: {e}"), SNAPSHOT_ERR_MAX_LEN))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("{url}: HTTP {status}"));
        }
        resp.json::<T>()
            .await
            .map_err(|e| compact_error_message(&format!("{url}: {e}"), SNAPSHOT_ERR_MAX_LEN))
    }

    async fn fetch_with_failover<T: DeserializeOwned>(&self, pair: &SourcePair, file: &str) -> Result<T> {
        let primary = match self.fetch_one::<T>(pair.primary.as_deref(), file).await {
            Ok(doc) => return Ok(doc),
            Err(err) => err,
        };
        tracing::warn!("[SNAPSHOT] primary {} failed ({}); trying backup", file, primary);
        match self.fetch_one::<T>(pair.backup.as_deref(), file).await {
            Ok(doc) => Ok(doc),
            Err(backup) => {
                tracing::warn!("[SNAPSHOT] backup {} failed: {}", file, backup);
                Err(AggregatorError::SnapshotUnavailable { primary, backup })
            }
        }
    }
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch_mined_blocks(&self) -> Result<MinedBlocksSnapshot> {
        let snapshot: MinedBlocksSnapshot = self
            .fetch_with_failover(&self.mined_blocks, MINED_BLOCKS_FILE)
            .await?;
        tracing::info!(
            "[SNAPSHOT] mined blocks: {} entries, tip {}",
            snapshot.mined_blocks.len(),
            snapshot.latest_block_number
        );
        Ok(snapshot)
    }

    async fn fetch_price_history(&self) -> Result<PriceHistory> {
        let history: PriceHistory = self.fetch_with_failover(&self.prices, PRICE_DATA_FILE).await?;
        history.validate()?;
        Ok(history)
    }
}
