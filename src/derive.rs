//! Chart derivation from sampled series.
//!
//! Target and sqrt-price decodes stay in 256-bit integers; values become `f64` only when a
//! [`ChartPoint`] is produced.

use crate::sampler::Series;
use crate::utils::constants::{
    max_target, DEFAULT_SECONDS_PER_BLOCK, ERAS_PER_DIFFICULTY_PERIOD, ERA_MINT_SCALING,
    HASHRATE_TARGET_SECONDS, MINTS_PER_EPOCH_ADJUSTMENT, SECONDS_PER_DAY,
};
use crate::utils::hex::{u256_to_f64, wad_to_f64};
use alloy::primitives::U256;
use serde::Serialize;

/// Hashes per unit of difficulty.
const HASHES_PER_DIFFICULTY: f64 = 4_194_304.0; // 2^22

/// Protocol constants the derivation is parameterised over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivationParams {
    pub era_mint_scaling: f64,
    pub mints_per_epoch_adjustment: f64,
    pub expected_eras_per_block: f64,
    pub target_seconds: f64,
}

impl Default for DerivationParams {
    fn default() -> Self {
        Self {
            era_mint_scaling: ERA_MINT_SCALING,
            mints_per_epoch_adjustment: MINTS_PER_EPOCH_ADJUSTMENT,
            expected_eras_per_block: 1.0 / ERAS_PER_DIFFICULTY_PERIOD,
            target_seconds: HASHRATE_TARGET_SECONDS,
        }
    }
}

/// Block height <-> unix time from one reference point and a fixed block time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockClock {
    pub reference_block: u64,
    pub reference_timestamp: u64,
    pub seconds_per_block: u64,
}

impl BlockClock {
    pub fn new(reference_block: u64, reference_timestamp: u64, seconds_per_block: u64) -> Self {
        Self {
            reference_block,
            reference_timestamp,
            seconds_per_block: seconds_per_block.max(1),
        }
    }

    pub fn timestamp_at_block(&self, block: u64) -> u64 {
        if block >= self.reference_block {
            let delta = (block - self.reference_block).saturating_mul(self.seconds_per_block);
            self.reference_timestamp.saturating_add(delta)
        } else {
            let delta = (self.reference_block - block).saturating_mul(self.seconds_per_block);
            self.reference_timestamp.saturating_sub(delta)
        }
    }

    /// Nearest block at or before `timestamp`.
    pub fn block_at_timestamp(&self, timestamp: u64) -> u64 {
        if timestamp >= self.reference_timestamp {
            let blocks = (timestamp - self.reference_timestamp) / self.seconds_per_block;
            self.reference_block.saturating_add(blocks)
        } else {
            let blocks = (self.reference_timestamp - timestamp).div_ceil(self.seconds_per_block);
            self.reference_block.saturating_sub(blocks)
        }
    }

    pub fn blocks_per_day(&self) -> f64 {
        SECONDS_PER_DAY as f64 / self.seconds_per_block as f64
    }
}

impl Default for BlockClock {
    fn default() -> Self {
        Self::new(0, 0, DEFAULT_SECONDS_PER_BLOCK)
    }
}

/// `maxTarget / target` as an exact quotient and remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Difficulty {
    pub target: U256,
    pub quotient: U256,
    pub remainder: U256,
}

impl Difficulty {
    pub fn as_f64(&self) -> f64 {
        u256_to_f64(self.quotient) + u256_to_f64(self.remainder) / u256_to_f64(self.target)
    }

    /// `quotient * target + remainder`; equals `maxTarget` for every value built by [`difficulty`].
    pub fn reconstruct(&self) -> U256 {
        self.quotient * self.target + self.remainder
    }
}

/// `None` for a zero target (uninitialised slot).
pub fn difficulty(target: U256) -> Option<Difficulty> {
    if target.is_zero() {
        return None;
    }
    let (quotient, remainder) = max_target().div_rem(target);
    Some(Difficulty {
        target,
        quotient,
        remainder,
    })
}

/// `(era_i - era_{i-1}) / (block_i - block_{i-1}) * scaling`. A decreasing era counts as zero.
pub fn eras_per_block(previous: (u64, U256), current: (u64, U256), scaling: f64) -> Option<f64> {
    let (prev_block, prev_era) = previous;
    let (block, era) = current;
    if block <= prev_block {
        return None;
    }
    let delta = u256_to_f64(era.saturating_sub(prev_era));
    Some(delta / (block - prev_block) as f64 * scaling)
}

/// Effective difficulty across a window `(prev_block, block]` in which the difficulty switched
/// from `d1` to `d2` at `change_block`.
pub fn blended_difficulty(d1: f64, d2: f64, prev_block: u64, block: u64, change_block: u64) -> f64 {
    if block <= prev_block {
        return d2;
    }
    let change = change_block.clamp(prev_block, block);
    let span = (block - prev_block) as f64;
    d1 * (change - prev_block) as f64 / span + d2 * (block - change) as f64 / span
}

pub fn hashrate(difficulty: f64, eras_per_block: f64, params: &DerivationParams) -> f64 {
    difficulty * HASHES_PER_DIFFICULTY / params.target_seconds * eras_per_block
        / params.expected_eras_per_block
}

pub fn average_reward_time(eras_per_block: f64, params: &DerivationParams) -> Option<f64> {
    let denominator = eras_per_block * params.mints_per_epoch_adjustment;
    (denominator > 0.0).then(|| 1.0 / denominator)
}

/// USD per token from the pool price (tokens per ETH) and the ETH price in USD.
pub fn usd_price(tokens_per_eth: U256, eth_usd: U256) -> Option<f64> {
    if tokens_per_eth.is_zero() {
        return None;
    }
    Some(u256_to_f64(eth_usd) / u256_to_f64(tokens_per_eth))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    pub block: u64,
    pub timestamp: u64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartSeries {
    pub difficulty_points: Vec<ChartPoint>,
    pub hashrate_points: Vec<ChartPoint>,
    pub reward_time_points: Vec<ChartPoint>,
    pub usd_price_points: Vec<ChartPoint>,
    pub eth_price_points: Vec<ChartPoint>,
    pub revenue_points: Vec<ChartPoint>,
}

/// Sampled inputs of one chart render.
#[derive(Debug, Clone, Copy)]
pub struct ChartInputs<'a> {
    pub mining_target: &'a Series,
    pub era: &'a Series,
    pub tokens_minted: &'a Series,
    /// Integer price of the ETH/token pool: tokens per ETH.
    pub tokens_per_eth: &'a Series,
    /// ETH/USDC pool price scaled to whole USD per ETH.
    pub eth_usd: &'a Series,
    /// `latestDifficultyPeriodStarted`; without it a change is assumed mid-window.
    pub difficulty_start: Option<&'a Series>,
}

fn usd_at(inputs: &ChartInputs<'_>, block: u64) -> Option<f64> {
    usd_price(inputs.tokens_per_eth.value_at(block)?, inputs.eth_usd.value_at(block)?)
}

fn effective_difficulty(inputs: &ChartInputs<'_>, prev_block: u64, block: u64) -> Option<f64> {
    let d2 = difficulty(inputs.mining_target.value_at(block)?)?;
    let Some(d1) = inputs
        .mining_target
        .value_at(prev_block)
        .and_then(difficulty)
    else {
        return Some(d2.as_f64());
    };
    if d1 == d2 {
        return Some(d2.as_f64());
    }
    let change_block = match inputs.difficulty_start {
        Some(starts) => starts
            .value_at(block)
            .and_then(|v| u64::try_from(v).ok())
            .filter(|b| *b > prev_block && *b <= block),
        None => Some(prev_block + (block - prev_block) / 2),
    };
    Some(match change_block {
        Some(change) => blended_difficulty(d1.as_f64(), d2.as_f64(), prev_block, block, change),
        None => d2.as_f64(),
    })
}

pub fn compute_chart_series(
    inputs: &ChartInputs<'_>,
    clock: &BlockClock,
    params: &DerivationParams,
) -> ChartSeries {
    let point = |block: u64, value: f64| ChartPoint {
        block,
        timestamp: clock.timestamp_at_block(block),
        value,
    };
    let mut out = ChartSeries::default();

    for sample in inputs.mining_target.samples() {
        if let Some(d) = difficulty(sample.value) {
            out.difficulty_points.push(point(sample.block, d.as_f64()));
        }
    }

    for pair in inputs.era.samples().windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let Some(epb) = eras_per_block(
            (prev.block, prev.value),
            (cur.block, cur.value),
            params.era_mint_scaling,
        ) else {
            continue;
        };
        if let Some(d) = effective_difficulty(inputs, prev.block, cur.block) {
            out.hashrate_points.push(point(cur.block, hashrate(d, epb, params)));
        }
        if let Some(seconds) = average_reward_time(epb, params) {
            out.reward_time_points.push(point(cur.block, seconds));
        }
    }

    for sample in inputs.tokens_per_eth.samples() {
        if let Some(usd) = usd_at(inputs, sample.block) {
            out.usd_price_points.push(point(sample.block, usd));
        }
    }

    for sample in inputs.eth_usd.samples() {
        out.eth_price_points.push(point(sample.block, u256_to_f64(sample.value)));
    }

    let blocks_per_day = clock.blocks_per_day();
    for pair in inputs.tokens_minted.samples().windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.block <= prev.block {
            continue;
        }
        let Some(usd) = usd_at(inputs, cur.block) else {
            continue;
        };
        let minted = wad_to_f64(cur.value.saturating_sub(prev.value));
        let per_day = minted / (cur.block - prev.block) as f64 * blocks_per_day;
        out.revenue_points.push(point(cur.block, per_day * usd));
    }

    tracing::debug!(
        "[DERIVE] difficulty={} hashrate={} usd={} revenue={}",
        out.difficulty_points.len(),
        out.hashrate_points.len(),
        out.usd_price_points.len(),
        out.revenue_points.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::StorageSample;
    use crate::utils::constants::WAD_U256;

    fn series(name: &str, points: &[(u64, U256)]) -> Series {
        Series::from_samples(
            name,
            points
                .iter()
                .map(|(b, v)| StorageSample::new(*b, *v))
                .collect(),
        )
    }

    #[test]
    fn test_difficulty_is_exact() {
        for target in [U256::from(1u8), U256::from(7u8), max_target() / U256::from(3u8), max_target()] {
            let d = difficulty(target).expect("non-zero");
            assert_eq!(d.reconstruct(), max_target());
            assert!(d.remainder < target);
        }
        assert!(difficulty(U256::ZERO).is_none());
        assert_eq!(difficulty(max_target()).map(|d| d.as_f64()), Some(1.0));
    }

    #[test]
    fn test_eras_per_block_and_reward_time() {
        let params = DerivationParams::default();
        let epb = eras_per_block((100, U256::from(10)), (200, U256::from(30)), 3.5).expect("epb");
        assert!((epb - 0.7).abs() < 1e-12);
        assert!(eras_per_block((200, U256::from(10)), (200, U256::from(30)), 3.5).is_none());
        assert_eq!(
            eras_per_block((100, U256::from(30)), (200, U256::from(10)), 3.5),
            Some(0.0)
        );
        let art = average_reward_time(0.125, &params).expect("art");
        assert!((art - 1.0).abs() < 1e-12);
        assert!(average_reward_time(0.0, &params).is_none());
    }

    #[test]
    fn test_hashrate_at_expected_rate() {
        let params = DerivationParams::default();
        // At the expected rate the ratio term is one.
        let h = hashrate(600.0, 1.0 / 80.0, &params);
        assert!((h - HASHES_PER_DIFFICULTY).abs() < 1e-6);
    }

    #[test]
    fn test_hashrate_blends_across_difficulty_change() {
        let params = DerivationParams::default();
        let t1 = max_target() / U256::from(100u64);
        let t2 = max_target() / U256::from(200u64);
        let target = series("target", &[(1_000, t1), (2_000, t2)]);
        let era = series("era", &[(1_000, U256::from(0)), (2_000, U256::from(100))]);
        let starts = series("start", &[(1_000, U256::from(500)), (2_000, U256::from(1_250))]);
        let empty = Series::default();
        let inputs = ChartInputs {
            mining_target: &target,
            era: &era,
            tokens_minted: &empty,
            tokens_per_eth: &empty,
            eth_usd: &empty,
            difficulty_start: Some(&starts),
        };
        let chart = compute_chart_series(&inputs, &BlockClock::default(), &params);
        assert_eq!(chart.hashrate_points.len(), 1);

        let d_eff = 100.0 * 250.0 / 1_000.0 + 200.0 * 750.0 / 1_000.0;
        let epb = 100.0 / 1_000.0 * 3.5;
        let expected = hashrate(d_eff, epb, &params);
        let got = chart.hashrate_points[0].value;
        assert!((got - expected).abs() / expected < 1e-9, "{got} vs {expected}");
        assert_eq!(chart.hashrate_points[0].block, 2_000);
    }

    #[test]
    fn test_unchanged_difficulty_is_not_blended() {
        let d = blended_difficulty(5.0, 5.0, 0, 10, 3);
        assert!((d - 5.0).abs() < 1e-12);
        assert!((blended_difficulty(1.0, 3.0, 0, 10, 0) - 3.0).abs() < 1e-12);
        assert!((blended_difficulty(1.0, 3.0, 0, 10, 10) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_usd_and_revenue_points() {
        let params = DerivationParams::default();
        let clock = BlockClock::new(0, 1_000_000, 2);
        let tokens_per_eth = series("ratio", &[(0, U256::from(1_000u64)), (43_200, U256::from(1_000u64))]);
        let eth_usd = series("eth", &[(0, U256::from(3_000u64)), (43_200, U256::from(3_000u64))]);
        // 100 tokens over one day of blocks.
        let minted = series(
            "minted",
            &[(0, U256::ZERO), (43_200, WAD_U256 * U256::from(100u64))],
        );
        let empty = Series::default();
        let inputs = ChartInputs {
            mining_target: &empty,
            era: &empty,
            tokens_minted: &minted,
            tokens_per_eth: &tokens_per_eth,
            eth_usd: &eth_usd,
            difficulty_start: None,
        };
        let chart = compute_chart_series(&inputs, &clock, &params);
        assert_eq!(chart.usd_price_points.len(), 2);
        assert!((chart.usd_price_points[0].value - 3.0).abs() < 1e-12);
        assert_eq!(chart.eth_price_points[1].value, 3_000.0);
        assert_eq!(chart.revenue_points.len(), 1);
        assert!((chart.revenue_points[0].value - 300.0).abs() < 1e-9);
        assert_eq!(chart.revenue_points[0].timestamp, 1_000_000 + 86_400);
        assert!(usd_price(U256::ZERO, U256::from(1u8)).is_none());
    }

    #[test]
    fn test_block_clock_both_directions() {
        let clock = BlockClock::new(1_000, 10_000, 2);
        assert_eq!(clock.timestamp_at_block(1_010), 10_020);
        assert_eq!(clock.timestamp_at_block(990), 9_980);
        assert_eq!(clock.block_at_timestamp(10_021), 1_010);
        assert_eq!(clock.block_at_timestamp(9_979), 989);
        assert_eq!(clock.block_at_timestamp(0), 0);
        assert_eq!(clock.blocks_per_day(), 43_200.0);
    }
}
