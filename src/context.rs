//! Explicit aggregator context: configuration, transport, cache and the components built on
//! them. Nothing in the crate reaches for global state; hosts hold one of these.

use crate::derive::{
    compute_chart_series, BlockClock, ChartInputs, ChartSeries, DerivationParams,
};
use crate::error::{AggregatorError, Result};
use crate::miners::{compute_miner_aggregates, KnownMinerRegistry, MinerAggregates};
use crate::multicall::{CallRequest, CallResult, ContractStats, Multicall, PoolFee};
use crate::protocols::uniswap_v4::{pool_id, pool_state_slot, tracked_pool_keys, PoolKey};
use crate::sampler::{
    range_label, SamplerOptions, SamplerProgress, Series, SeriesRequest, SlotDescriptor,
    SlotPolicy, StorageSampler,
};
use crate::scanner::{MintDataset, MintScanner, ScanOptions, ScanOutcome, ScanRequest, ScanSupervisor};
use crate::snapshot::{HttpSnapshotFetcher, PricePoint, SnapshotFetcher, SourcePair};
use crate::storage::cache_db::{CacheDb, CacheKey};
use crate::utils::config::{AggregatorConfig, Endpoints};
use crate::utils::constants::{CHAIN_DETECT_TIMEOUT_MS, SECONDS_PER_DAY};
use crate::utils::rpc::{RpcBackend, RpcTransport};
use alloy::primitives::Address;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainId {
    Ethereum,
    Base,
    BaseSepolia,
    Other(u64),
    /// `eth_chainId` failed or lost the race against the detect timeout.
    Unknown,
}

impl ChainId {
    pub fn from_id(id: u64) -> Self {
        match id {
            1 => ChainId::Ethereum,
            8453 => ChainId::Base,
            84532 => ChainId::BaseSepolia,
            other => ChainId::Other(other),
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            ChainId::Ethereum => Some(1),
            ChainId::Base => Some(8453),
            ChainId::BaseSepolia => Some(84532),
            ChainId::Other(id) => Some(*id),
            ChainId::Unknown => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Base => "base",
            ChainId::BaseSepolia => "base-sepolia",
            ChainId::Other(_) => "other",
            ChainId::Unknown => "unknown network",
        }
    }
}

/// The slots behind the chart, keyed to the configured token and PoolManager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSlots {
    pub mining_target: SlotDescriptor,
    pub era: SlotDescriptor,
    pub tokens_minted: SlotDescriptor,
    pub tokens_per_eth: SlotDescriptor,
    pub eth_usd: SlotDescriptor,
    pub difficulty_start: SlotDescriptor,
}

impl ChartSlots {
    pub fn from_config(config: &AggregatorConfig) -> Self {
        let token = config.token_address;
        let slots = &config.token_slots;
        let [eth_token, eth_usdc, _, _] = tracked_pool_keys(
            token,
            config.usdc_address,
            config.weth_address,
            config.hook_address,
        );
        let pool_slot = |key: &PoolKey| pool_state_slot(pool_id(key));
        Self {
            mining_target: SlotDescriptor::new("mining_target", token, slots.mining_target, SlotPolicy::Integer),
            era: SlotDescriptor::new("epoch_count", token, slots.epoch_count, SlotPolicy::Integer),
            tokens_minted: SlotDescriptor::new("tokens_minted", token, slots.tokens_minted, SlotPolicy::Integer),
            tokens_per_eth: SlotDescriptor::new(
                "price_eth_bwork",
                config.pool_manager_address,
                pool_slot(&eth_token),
                SlotPolicy::SqrtPriceX96Q96,
            ),
            eth_usd: SlotDescriptor::new(
                "price_eth_usdc",
                config.pool_manager_address,
                pool_slot(&eth_usdc),
                SlotPolicy::SqrtPriceX96Scaled1e12,
            ),
            difficulty_start: SlotDescriptor::new(
                "difficulty_start",
                token,
                slots.latest_difficulty_period_started,
                SlotPolicy::Integer,
            ),
        }
    }
}

/// Every series a chart render needs, sampled over one block range.
#[derive(Debug, Clone)]
pub struct SampledCharts {
    pub mining_target: Arc<Series>,
    pub era: Arc<Series>,
    pub tokens_minted: Arc<Series>,
    pub tokens_per_eth: Arc<Series>,
    pub eth_usd: Arc<Series>,
    pub difficulty_start: Arc<Series>,
}

impl SampledCharts {
    pub fn inputs(&self) -> ChartInputs<'_> {
        ChartInputs {
            mining_target: &self.mining_target,
            era: &self.era,
            tokens_minted: &self.tokens_minted,
            tokens_per_eth: &self.tokens_per_eth,
            eth_usd: &self.eth_usd,
            difficulty_start: Some(&self.difficulty_start),
        }
    }
}

/// In-memory series cache key: the SQLite key plus the requested window.
type HotKey = (CacheKey, u64, u64, usize);

/// Components bound to one set of endpoints; swapped wholesale by `set_endpoints`.
struct Services {
    rpc: Arc<RpcTransport>,
    sampler: Arc<StorageSampler>,
    scanner: Arc<MintScanner>,
    multicall: Arc<Multicall>,
    snapshots: Option<Arc<dyn SnapshotFetcher>>,
}

pub struct AggregatorContext {
    config: AggregatorConfig,
    endpoints: RwLock<Endpoints>,
    services: RwLock<Arc<Services>>,
    cache: CacheDb,
    hot_series: DashMap<HotKey, Arc<Series>>,
    registry: KnownMinerRegistry,
    supervisor: Arc<ScanSupervisor>,
    clock: BlockClock,
    params: DerivationParams,
    sampler_options: SamplerOptions,
}

fn snapshot_fetcher(endpoints: &Endpoints) -> Result<Arc<dyn SnapshotFetcher>> {
    let fetcher = HttpSnapshotFetcher::new(
        SourcePair::new(
            endpoints.data_source_url.clone(),
            endpoints.backup_data_source_url.clone(),
        ),
        SourcePair::new(
            endpoints.price_data_source_url.clone(),
            endpoints.price_backup_data_source_url.clone(),
        ),
    )?;
    Ok(Arc::new(fetcher))
}

impl AggregatorContext {
    /// HTTP transport and snapshot sources from `config`, cache at `config.cache_db_path`.
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        let rpc = Arc::new(RpcTransport::connect_http(
            &config.endpoints.rpc_url,
            config.retry,
        )?);
        let cache = CacheDb::open(&config.cache_db_path)?;
        let snapshots = Some(snapshot_fetcher(&config.endpoints)?);
        let mut registry =
            KnownMinerRegistry::for_deployment(config.token_address, config.hook_address);
        if let Some(path) = config.known_miners_file.as_deref() {
            registry.merge(KnownMinerRegistry::from_json_file(path)?);
        }
        tracing::info!("[MINERS] {} named miner address(es)", registry.len());
        Ok(Self::from_parts(config, rpc, cache, snapshots, registry))
    }

    /// Assemble a context around an already-built transport, e.g. one over a scripted backend.
    pub fn from_parts(
        config: AggregatorConfig,
        rpc: Arc<RpcTransport>,
        cache: CacheDb,
        snapshots: Option<Arc<dyn SnapshotFetcher>>,
        registry: KnownMinerRegistry,
    ) -> Self {
        let sampler_options = SamplerOptions {
            genesis_floor: config.genesis_block,
            seconds_per_block: config.seconds_per_block,
            ..SamplerOptions::default()
        };
        Self::with_sampler_options(config, rpc, cache, snapshots, registry, sampler_options)
    }

    pub fn with_sampler_options(
        config: AggregatorConfig,
        rpc: Arc<RpcTransport>,
        cache: CacheDb,
        snapshots: Option<Arc<dyn SnapshotFetcher>>,
        registry: KnownMinerRegistry,
        sampler_options: SamplerOptions,
    ) -> Self {
        let supervisor = Arc::new(ScanSupervisor::default());
        let clock = BlockClock::new(
            config.reference_block,
            config.reference_timestamp,
            config.seconds_per_block,
        );
        let services = Self::build_services(
            &config,
            rpc,
            &cache,
            snapshots,
            &sampler_options,
            supervisor.clone(),
        );
        Self {
            endpoints: RwLock::new(config.endpoints.clone()),
            services: RwLock::new(Arc::new(services)),
            config,
            cache,
            hot_series: DashMap::new(),
            registry,
            supervisor,
            clock,
            params: DerivationParams::default(),
            sampler_options,
        }
    }

    fn build_services(
        config: &AggregatorConfig,
        rpc: Arc<RpcTransport>,
        cache: &CacheDb,
        snapshots: Option<Arc<dyn SnapshotFetcher>>,
        sampler_options: &SamplerOptions,
        supervisor: Arc<ScanSupervisor>,
    ) -> Services {
        let sampler = StorageSampler::new(rpc.clone(), cache.clone(), sampler_options.clone());
        let scanner = MintScanner::new(
            rpc.clone(),
            cache.clone(),
            snapshots.clone(),
            ScanOptions::new(config.token_address, config.genesis_block),
        )
        .with_supervisor(supervisor);
        let multicall = Multicall::new(rpc.clone(), config.multicall3_address);
        Services {
            rpc,
            sampler: Arc::new(sampler),
            scanner: Arc::new(scanner),
            multicall: Arc::new(multicall),
            snapshots,
        }
    }

    async fn services(&self) -> Arc<Services> {
        self.services.read().await.clone()
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn clock(&self) -> &BlockClock {
        &self.clock
    }

    pub fn registry(&self) -> &KnownMinerRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheDb {
        &self.cache
    }

    pub fn chart_slots(&self) -> ChartSlots {
        ChartSlots::from_config(&self.config)
    }

    pub async fn endpoints(&self) -> Endpoints {
        self.endpoints.read().await.clone()
    }

    pub async fn rpc(&self) -> Arc<RpcTransport> {
        self.services().await.rpc.clone()
    }

    pub async fn subscribe_sampler(&self) -> watch::Receiver<SamplerProgress> {
        self.services().await.sampler.subscribe()
    }

    pub async fn subscribe_scan(&self) -> watch::Receiver<crate::scanner::ScanProgress> {
        self.services().await.scanner.subscribe()
    }

    /// Swap RPC and snapshot endpoints at runtime. A running scan is cancelled at its next
    /// window boundary and the in-memory series cache is dropped.
    pub async fn set_endpoints(&self, endpoints: Endpoints) -> Result<()> {
        endpoints.validate()?;
        let rpc = Arc::new(RpcTransport::connect_http(&endpoints.rpc_url, self.config.retry)?);
        let snapshots = Some(snapshot_fetcher(&endpoints)?);
        self.supervisor.cancel_all();
        let services = Self::build_services(
            &self.config,
            rpc,
            &self.cache,
            snapshots,
            &self.sampler_options,
            self.supervisor.clone(),
        );
        *self.services.write().await = Arc::new(services);
        *self.endpoints.write().await = endpoints;
        self.hot_series.clear();
        tracing::info!("[CONTEXT] endpoints replaced");
        Ok(())
    }

    /// Swap only the transport, keeping the configured snapshot sources.
    pub async fn set_backend(&self, backend: Arc<dyn RpcBackend>) {
        let rpc = Arc::new(RpcTransport::new(backend, self.config.retry));
        let snapshots = self.services().await.snapshots.clone();
        self.supervisor.cancel_all();
        let services = Self::build_services(
            &self.config,
            rpc,
            &self.cache,
            snapshots,
            &self.sampler_options,
            self.supervisor.clone(),
        );
        *self.services.write().await = Arc::new(services);
        self.hot_series.clear();
    }

    /// `eth_chainId` raced against a short timeout; a loss degrades to [`ChainId::Unknown`].
    pub async fn detect_chain(&self) -> ChainId {
        let rpc = self.rpc().await;
        match timeout(Duration::from_millis(CHAIN_DETECT_TIMEOUT_MS), rpc.chain_id()).await {
            Ok(Ok(id)) => ChainId::from_id(id),
            Ok(Err(err)) => {
                tracing::warn!("[CONTEXT] chain detection failed: {}", err);
                ChainId::Unknown
            }
            Err(_) => {
                tracing::warn!(
                    "[CONTEXT] chain detection timed out after {}ms",
                    CHAIN_DETECT_TIMEOUT_MS
                );
                ChainId::Unknown
            }
        }
    }

    pub async fn fetch_series(
        &self,
        slot: &SlotDescriptor,
        start_block: u64,
        end_block: u64,
        samples: usize,
    ) -> Result<Arc<Series>> {
        let request = SeriesRequest {
            slot: slot.clone(),
            start_block,
            end_block,
            samples,
            range_label: range_label(
                end_block.saturating_sub(start_block),
                self.config.seconds_per_block,
            ),
        };
        let hot_key = (request.cache_key(), start_block, end_block, samples);
        if let Some(series) = self.hot_series.get(&hot_key) {
            return Ok(series.clone());
        }
        let series = Arc::new(self.services().await.sampler.fetch_series(&request).await?);
        self.hot_series.insert(hot_key, series.clone());
        Ok(series)
    }

    /// Samples every chart series over the last `days` ending at `head`.
    pub async fn fetch_chart_series(&self, head: u64, days: u64, samples: usize) -> Result<SampledCharts> {
        let window_start = self
            .clock
            .timestamp_at_block(head)
            .saturating_sub(days.max(1).saturating_mul(SECONDS_PER_DAY));
        let start = self.clock.block_at_timestamp(window_start).min(head);
        let slots = self.chart_slots();
        Ok(SampledCharts {
            mining_target: self.fetch_series(&slots.mining_target, start, head, samples).await?,
            era: self.fetch_series(&slots.era, start, head, samples).await?,
            tokens_minted: self.fetch_series(&slots.tokens_minted, start, head, samples).await?,
            tokens_per_eth: self.fetch_series(&slots.tokens_per_eth, start, head, samples).await?,
            eth_usd: self.fetch_series(&slots.eth_usd, start, head, samples).await?,
            difficulty_start: self.fetch_series(&slots.difficulty_start, start, head, samples).await?,
        })
    }

    /// Published USD price history, oldest first as served.
    pub async fn fetch_price_history(&self) -> Result<Vec<PricePoint>> {
        let snapshots = self.services().await.snapshots.clone().ok_or_else(|| {
            AggregatorError::SnapshotUnavailable {
                primary: "not configured".to_string(),
                backup: "not configured".to_string(),
            }
        })?;
        let history = snapshots.fetch_price_history().await?;
        history.validate()?;
        let points = history.points();
        tracing::info!(
            "[CONTEXT] price history: {} points, last updated {:?}",
            points.len(),
            history.last_updated
        );
        Ok(points)
    }

    pub async fn scan_mint_events(&self, request: ScanRequest) -> Result<ScanOutcome> {
        self.services().await.scanner.scan(request).await
    }

    /// Cached dataset without touching the network.
    pub async fn cached_mint_dataset(&self) -> MintDataset {
        self.services().await.scanner.load_cached().0
    }

    pub async fn aggregate(&self, calls: &[CallRequest]) -> Result<Vec<CallResult>> {
        self.services().await.multicall.aggregate(calls).await
    }

    pub async fn multicall(&self) -> Arc<Multicall> {
        self.services().await.multicall.clone()
    }

    /// Boot super-call against the configured token, owners of token and hook included.
    pub async fn fetch_contract_stats(&self) -> Result<ContractStats> {
        let mut owned = vec![self.config.token_address];
        if self.config.hook_address != Address::ZERO {
            owned.push(self.config.hook_address);
        }
        self.multicall()
            .await
            .fetch_contract_stats(self.config.token_address, &owned)
            .await
    }

    pub async fn fetch_pool_fees(&self) -> Result<Vec<PoolFee>> {
        let keys = tracked_pool_keys(
            self.config.token_address,
            self.config.usdc_address,
            self.config.weth_address,
            self.config.hook_address,
        );
        self.multicall()
            .await
            .fetch_pool_fees(self.config.state_view_address, &keys)
            .await
    }

    pub async fn fetch_user_positions(&self, user: Address) -> Result<crate::multicall::UserPositions> {
        let finder = self
            .config
            .position_finder_address
            .ok_or_else(|| AggregatorError::fatal("BWORK_POSITION_FINDER_ADDRESS is not configured"))?;
        self.multicall().await.fetch_user_positions(finder, user).await
    }

    pub fn compute_chart_series(&self, inputs: &ChartInputs<'_>) -> ChartSeries {
        compute_chart_series(inputs, &self.clock, &self.params)
    }

    pub fn compute_miner_aggregates(
        &self,
        dataset: &MintDataset,
        difficulty_start_block: u64,
    ) -> MinerAggregates {
        compute_miner_aggregates(dataset, difficulty_start_block, &self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_names() {
        assert_eq!(ChainId::from_id(8453), ChainId::Base);
        assert_eq!(ChainId::from_id(10).id(), Some(10));
        assert_eq!(ChainId::Unknown.id(), None);
        assert_eq!(ChainId::Unknown.name(), "unknown network");
    }

    #[test]
    fn test_chart_slots_price_pools_live_in_pool_manager() {
        let config = AggregatorConfig::from_lookup(|key| match key {
            "BWORK_RPC_URL" => Some("https://rpc.example".to_string()),
            "BWORK_TOKEN_ADDRESS" => Some("0x1111111111111111111111111111111111111111".to_string()),
            _ => None,
        })
        .expect("config");
        let slots = ChartSlots::from_config(&config);
        assert_eq!(slots.tokens_per_eth.contract, config.pool_manager_address);
        assert_eq!(slots.eth_usd.policy, SlotPolicy::SqrtPriceX96Scaled1e12);
        assert_ne!(slots.tokens_per_eth.slot, slots.eth_usd.slot);
        assert_eq!(slots.mining_target.contract, config.token_address);
    }
}
