//! Historical storage-slot sampler.
//!
//! A request names a `(contract, slot, descriptor)` and a block range. The sampler plans a
//! fixed set of block heights, satisfies what it can from the SQLite cache (within a block
//! tolerance), fetches the rest in rate-limited batches of concurrent `eth_getStorageAt`
//! calls, decodes every word through the request's [`SlotPolicy`] and persists the raw
//! words it learned.

use crate::error::{AggregatorError, Result};
use crate::protocols::uniswap_v4::{price_q96, price_scaled_1e12};
use crate::storage::cache_db::{CacheDb, CacheKey, SeriesEntries};
use crate::utils::constants::{
    DEFAULT_SAMPLE_TOLERANCE_BLOCKS, SAMPLER_BATCHES_PER_GROUP, SAMPLER_BATCH_SIZE,
    SAMPLER_EMPTY_RESPONSE_RETRIES, SAMPLER_INTER_GROUP_DELAY_MS, SAMPLER_INTRA_BATCH_DELAY_MS,
    SECONDS_PER_DAY,
};
use crate::utils::hex::{parse_word, u256_to_f64, word_to_cache_hex};
use crate::utils::rpc::RpcTransport;
use alloy::primitives::{Address, U256};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

/// Seconds since the Unix epoch; injectable so day alignment is deterministic under test.
pub type UnixClock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> UnixClock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    })
}

/// How a raw 32-byte storage word becomes a sample value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotPolicy {
    Integer,
    /// Low 160 bits as `sqrtPriceX96`, price scaled by `10^12`.
    SqrtPriceX96Scaled1e12,
    /// Low 160 bits as `sqrtPriceX96`, integer price `x^2 / 2^192`.
    SqrtPriceX96Q96,
}

impl SlotPolicy {
    pub fn decode(&self, word: U256) -> U256 {
        match self {
            SlotPolicy::Integer => word,
            SlotPolicy::SqrtPriceX96Scaled1e12 => price_scaled_1e12(word),
            SlotPolicy::SqrtPriceX96Q96 => price_q96(word),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub descriptor: String,
    pub contract: Address,
    pub slot: U256,
    pub policy: SlotPolicy,
}

impl SlotDescriptor {
    pub fn new(descriptor: impl Into<String>, contract: Address, slot: U256, policy: SlotPolicy) -> Self {
        Self {
            descriptor: descriptor.into(),
            contract,
            slot,
            policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageSample {
    pub block: u64,
    pub value: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl StorageSample {
    pub fn new(block: u64, value: U256) -> Self {
        Self {
            block,
            value,
            tag: None,
        }
    }
}

/// Samples of one descriptor, strictly ascending by block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Series {
    pub descriptor: String,
    samples: Vec<StorageSample>,
}

impl Series {
    /// Sort by block and keep the first sample seen for each block.
    pub fn from_samples(descriptor: impl Into<String>, mut samples: Vec<StorageSample>) -> Self {
        samples.sort_by_key(|s| s.block);
        samples.dedup_by_key(|s| s.block);
        Self {
            descriptor: descriptor.into(),
            samples,
        }
    }

    pub fn samples(&self) -> &[StorageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().map(|s| s.block)
    }

    /// Value of the latest sample at or before `block`.
    pub fn value_at(&self, block: u64) -> Option<U256> {
        let idx = self.samples.partition_point(|s| s.block <= block);
        idx.checked_sub(1).map(|i| self.samples[i].value)
    }

    pub fn as_f64_points(&self) -> Vec<(u64, f64)> {
        self.samples
            .iter()
            .map(|s| (s.block, u256_to_f64(s.value)))
            .collect()
    }
}

/// Planned block heights for one request, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePlan {
    pub start_block: u64,
    pub end_block: u64,
    pub aligned_end: u64,
    pub stepsize: u64,
    pub blocks: Vec<u64>,
}

impl SamplePlan {
    /// `start` is clamped to `genesis_floor`; the end is pulled back by `alignment_blocks`
    /// so that runs on the same UTC day plan the same heights.
    ///
    /// Both endpoints are sampled: `stepsize = (end - start) / max(samples - 1, 1)`.
    pub fn build(
        start: u64,
        end: u64,
        samples: usize,
        genesis_floor: u64,
        alignment_blocks: u64,
    ) -> Self {
        let start_block = start.max(genesis_floor);
        let end_block = end.max(start_block);
        let samples = samples.max(1) as u64;
        let stepsize = (end_block - start_block) / (samples - 1).max(1);
        let aligned_end = end_block.saturating_sub(alignment_blocks).max(start_block);

        let mut blocks = Vec::with_capacity(samples as usize);
        for k in 0..samples {
            let Some(offset) = k.checked_mul(stepsize) else {
                break;
            };
            let Some(block) = aligned_end.checked_sub(offset) else {
                break;
            };
            if block < genesis_floor {
                break;
            }
            if blocks.last() != Some(&block) {
                blocks.push(block);
            }
        }

        Self {
            start_block,
            end_block,
            aligned_end,
            stepsize,
            blocks,
        }
    }
}

/// Blocks elapsed since UTC midnight at `seconds_per_block`.
pub fn end_alignment_blocks(now_unix: u64, seconds_per_block: u64) -> u64 {
    (now_unix % SECONDS_PER_DAY) / seconds_per_block.max(1)
}

/// Cache-key range label for a block span, e.g. `30d`.
pub fn range_label(span_blocks: u64, seconds_per_block: u64) -> String {
    let seconds = span_blocks.saturating_mul(seconds_per_block.max(1));
    let days = (seconds + SECONDS_PER_DAY / 2) / SECONDS_PER_DAY;
    format!("{}d", days.max(1))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRequest {
    pub slot: SlotDescriptor,
    pub start_block: u64,
    pub end_block: u64,
    pub samples: usize,
    pub range_label: String,
}

impl SeriesRequest {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.slot.descriptor, &self.range_label, self.slot.contract)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerProgress {
    pub planned: usize,
    pub loaded: usize,
    pub dropped: usize,
}

impl SamplerProgress {
    /// Samples still owed once permanent drops are written off.
    pub fn expected(&self) -> usize {
        self.planned.saturating_sub(self.dropped)
    }

    pub fn all_values_loaded(&self) -> bool {
        self.loaded >= self.expected()
    }
}

#[derive(Clone)]
pub struct SamplerOptions {
    pub tolerance_blocks: u64,
    pub batch_size: usize,
    pub batches_per_group: usize,
    pub intra_batch_delay: Duration,
    pub inter_group_delay: Duration,
    pub empty_response_retries: u32,
    pub genesis_floor: u64,
    pub seconds_per_block: u64,
    pub clock: UnixClock,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            tolerance_blocks: DEFAULT_SAMPLE_TOLERANCE_BLOCKS,
            batch_size: SAMPLER_BATCH_SIZE,
            batches_per_group: SAMPLER_BATCHES_PER_GROUP,
            intra_batch_delay: Duration::from_millis(SAMPLER_INTRA_BATCH_DELAY_MS),
            inter_group_delay: Duration::from_millis(SAMPLER_INTER_GROUP_DELAY_MS),
            empty_response_retries: SAMPLER_EMPTY_RESPONSE_RETRIES,
            genesis_floor: 0,
            seconds_per_block: crate::utils::constants::DEFAULT_SECONDS_PER_BLOCK,
            clock: system_clock(),
        }
    }
}

fn nearest_cached(cached: &SeriesEntries, block: u64, tolerance: u64) -> Option<(u64, &String)> {
    let lo = block.saturating_sub(tolerance);
    let hi = block.saturating_add(tolerance);
    cached
        .range(lo..=hi)
        .min_by_key(|(cached_block, _)| cached_block.abs_diff(block))
        .map(|(cached_block, value)| (*cached_block, value))
}

enum FetchOutcome {
    Loaded(U256),
    Retry,
    Drop,
}

pub struct StorageSampler {
    rpc: Arc<RpcTransport>,
    cache: CacheDb,
    options: SamplerOptions,
    progress: watch::Sender<SamplerProgress>,
}

impl StorageSampler {
    pub fn new(rpc: Arc<RpcTransport>, cache: CacheDb, options: SamplerOptions) -> Self {
        let (progress, _) = watch::channel(SamplerProgress::default());
        Self {
            rpc,
            cache,
            options,
            progress,
        }
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    pub fn subscribe(&self) -> watch::Receiver<SamplerProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> SamplerProgress {
        *self.progress.borrow()
    }

    pub fn plan(&self, request: &SeriesRequest) -> SamplePlan {
        let alignment = end_alignment_blocks((self.options.clock)(), self.options.seconds_per_block);
        SamplePlan::build(
            request.start_block,
            request.end_block,
            request.samples,
            self.options.genesis_floor,
            alignment,
        )
    }

    fn classify(&self, block: u64, outcome: Result<Option<U256>>) -> Result<FetchOutcome> {
        match outcome {
            Ok(Some(word)) => Ok(FetchOutcome::Loaded(word)),
            Ok(None) => Ok(FetchOutcome::Retry),
            Err(AggregatorError::Fatal(message)) => Err(AggregatorError::Fatal(message)),
            Err(err) if err.is_retryable() => Ok(FetchOutcome::Retry),
            Err(err) => {
                tracing::warn!("[SAMPLER] dropping block {}: {}", block, err);
                Ok(FetchOutcome::Drop)
            }
        }
    }

    async fn retry_serially(&self, slot: &SlotDescriptor, block: u64) -> Result<Option<U256>> {
        for attempt in 0..self.options.empty_response_retries {
            let shift = attempt.min(10);
            sleep(self.options.intra_batch_delay.saturating_mul(1u32 << shift)).await;
            let outcome = self
                .rpc
                .get_storage_at(slot.contract, slot.slot, block)
                .await;
            match self.classify(block, outcome)? {
                FetchOutcome::Loaded(word) => return Ok(Some(word)),
                FetchOutcome::Retry => continue,
                FetchOutcome::Drop => return Ok(None),
            }
        }
        tracing::warn!(
            "[SAMPLER] {} block {} still empty after {} serial retries; leaving a gap",
            slot.descriptor,
            block,
            self.options.empty_response_retries
        );
        Ok(None)
    }

    /// Sorted, de-duplicated series for `request`; only fatal transport errors abort.
    pub async fn fetch_series(&self, request: &SeriesRequest) -> Result<Series> {
        let plan = self.plan(request);
        let slot = &request.slot;
        let key = request.cache_key();
        let cached = self.cache.read_series(&key);

        let mut progress = SamplerProgress {
            planned: plan.blocks.len(),
            ..SamplerProgress::default()
        };
        let mut samples = Vec::with_capacity(plan.blocks.len());
        let mut pending = Vec::new();
        let mut used_cached = HashSet::new();
        for &block in &plan.blocks {
            let hit = nearest_cached(&cached, block, self.options.tolerance_blocks)
                .filter(|(cached_block, _)| !used_cached.contains(cached_block))
                .and_then(|(cached_block, raw)| parse_word(raw).map(|word| (cached_block, word)));
            match hit {
                Some((cached_block, word)) => {
                    used_cached.insert(cached_block);
                    samples.push(StorageSample::new(cached_block, slot.policy.decode(word)));
                    progress.loaded += 1;
                }
                None => pending.push(block),
            }
        }
        self.progress.send_replace(progress);
        tracing::debug!(
            "[SAMPLER] {}: {} planned, {} cached, {} to fetch",
            key,
            plan.blocks.len(),
            progress.loaded,
            pending.len()
        );

        let mut fresh = SeriesEntries::new();
        let mut failed = Vec::new();
        let batch_size = self.options.batch_size.max(1);
        let per_group = self.options.batches_per_group.max(1);
        for (batch_idx, batch) in pending.chunks(batch_size).enumerate() {
            if batch_idx > 0 {
                sleep(self.options.intra_batch_delay).await;
                if batch_idx % per_group == 0 {
                    sleep(self.options.inter_group_delay).await;
                }
            }
            let calls = batch.iter().map(|&block| async move {
                let outcome = self
                    .rpc
                    .get_storage_at(slot.contract, slot.slot, block)
                    .await;
                (block, outcome)
            });
            for (block, outcome) in join_all(calls).await {
                match self.classify(block, outcome)? {
                    FetchOutcome::Loaded(word) => {
                        fresh.insert(block, word_to_cache_hex(word));
                        samples.push(StorageSample::new(block, slot.policy.decode(word)));
                        progress.loaded += 1;
                    }
                    FetchOutcome::Retry => failed.push(block),
                    FetchOutcome::Drop => progress.dropped += 1,
                }
            }
            self.progress.send_replace(progress);
        }

        for block in failed {
            match self.retry_serially(slot, block).await? {
                Some(word) => {
                    fresh.insert(block, word_to_cache_hex(word));
                    samples.push(StorageSample::new(block, slot.policy.decode(word)));
                    progress.loaded += 1;
                }
                None => progress.dropped += 1,
            }
            self.progress.send_replace(progress);
        }

        let series = Series::from_samples(slot.descriptor.clone(), samples);
        if !fresh.is_empty() {
            if let Err(err) = self.cache.write_series(&key, &fresh) {
                tracing::warn!("[SAMPLER] failed to persist {}: {}", key, err);
            }
        }
        tracing::info!(
            "[SAMPLER] {} ready: {} samples ({} fetched, {} dropped)",
            key,
            series.len(),
            fresh.len(),
            progress.dropped
        );
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_with_two_samples_hits_both_ends() {
        let plan = SamplePlan::build(5_000, 6_000, 2, 0, 0);
        assert_eq!(plan.stepsize, 1_000);
        assert_eq!(plan.blocks, vec![6_000, 5_000]);
    }

    #[test]
    fn test_plan_clamps_start_to_genesis_floor() {
        let plan = SamplePlan::build(10, 1_010, 11, 500, 0);
        assert_eq!(plan.start_block, 500);
        assert!(plan.blocks.iter().all(|b| *b >= 500));
        assert_eq!(plan.blocks.first(), Some(&1_010));
    }

    #[test]
    fn test_single_sample_plans_exactly_one_block() {
        let plan = SamplePlan::build(100, 150, 1, 0, 0);
        assert_eq!(plan.blocks, vec![150]);
        let tight = SamplePlan::build(100, 103, 10, 0, 0);
        assert_eq!(tight.stepsize, 0);
        assert_eq!(tight.blocks, vec![103]);
    }

    #[test]
    fn test_alignment_shifts_whole_plan() {
        let plan = SamplePlan::build(0, 100_000, 3, 0, 1_800);
        assert_eq!(plan.aligned_end, 98_200);
        assert_eq!(plan.blocks, vec![98_200, 48_200]);
    }

    #[test]
    fn test_end_alignment_counts_blocks_since_midnight() {
        assert_eq!(end_alignment_blocks(86_400 * 19_000, 2), 0);
        assert_eq!(end_alignment_blocks(86_400 * 19_000 + 3_601, 2), 1_800);
    }

    #[test]
    fn test_range_label_rounds_to_days() {
        assert_eq!(range_label(43_200 * 30, 2), "30d");
        assert_eq!(range_label(10, 2), "1d");
    }

    #[test]
    fn test_nearest_cached_respects_tolerance() {
        let cached: SeriesEntries = [(1_000, "01".to_string()), (1_250, "02".to_string())].into();
        assert_eq!(nearest_cached(&cached, 1_090, 100).map(|(b, _)| b), Some(1_000));
        assert_eq!(nearest_cached(&cached, 1_200, 100).map(|(b, _)| b), Some(1_250));
        assert_eq!(nearest_cached(&cached, 1_160, 100).map(|(b, _)| b), Some(1_250));
        assert!(nearest_cached(&cached, 1_120, 100).is_none());
        assert!(nearest_cached(&cached, 1_400, 100).is_none());
    }

    #[test]
    fn test_series_sorts_and_dedupes() {
        let series = Series::from_samples(
            "t",
            vec![
                StorageSample::new(30, U256::from(3)),
                StorageSample::new(10, U256::from(1)),
                StorageSample::new(30, U256::from(9)),
            ],
        );
        assert_eq!(series.blocks().collect::<Vec<_>>(), vec![10, 30]);
        assert_eq!(series.value_at(29), Some(U256::from(1)));
        assert_eq!(series.value_at(5), None);
    }

    #[test]
    fn test_policies_decode_words() {
        let q96 = U256::from(1u8) << 96;
        assert_eq!(SlotPolicy::Integer.decode(U256::from(7)), U256::from(7));
        assert_eq!(SlotPolicy::SqrtPriceX96Q96.decode(q96 * U256::from(3)), U256::from(9));
        assert_eq!(
            SlotPolicy::SqrtPriceX96Scaled1e12.decode(q96),
            U256::from(1_000_000_000_000u64)
        );
    }

    #[test]
    fn test_progress_writes_off_drops() {
        let progress = SamplerProgress {
            planned: 5,
            loaded: 3,
            dropped: 2,
        };
        assert!(progress.all_values_loaded());
        assert!(!SamplerProgress {
            planned: 5,
            loaded: 3,
            dropped: 1
        }
        .all_values_loaded());
    }
}
