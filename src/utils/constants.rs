use alloy::primitives::{address, Address, U256};

/// Standard WAD (10^18)
pub const WAD_U256: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Upper bound of the mining target; difficulty is `MAX_TARGET / target`.
pub const MAX_TARGET_BITS: usize = 234;

pub fn max_target() -> U256 {
    U256::from(1u8) << MAX_TARGET_BITS
}

/// Universal Multicall3 deployment (same address on every supported chain).
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

pub const DEFAULT_SECONDS_PER_BLOCK: u64 = 2;
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Blocks tolerated between a planned sample and a cached one before it is re-fetched.
pub const DEFAULT_SAMPLE_TOLERANCE_BLOCKS: u64 = 100;

/// Fan-out of one sampler batch; higher values trip provider rate limits.
pub const SAMPLER_BATCH_SIZE: usize = 20;
pub const SAMPLER_INTRA_BATCH_DELAY_MS: u64 = 200;
pub const SAMPLER_INTER_GROUP_DELAY_MS: u64 = 400;
pub const SAMPLER_EMPTY_RESPONSE_RETRIES: u32 = 4;
/// Batches that form one group; the longer inter-group pause follows each group.
pub const SAMPLER_BATCHES_PER_GROUP: usize = 5;

pub const SCAN_WINDOW_BLOCKS: u64 = 500;
pub const SCAN_WINDOW_RETRIES: u32 = 5;
pub const SCAN_WINDOW_RETRY_BASE_MS: u64 = 1_000;
pub const SCAN_INTER_WINDOW_DELAY_MS: u64 = 200;

pub const MULTICALL_PAGE_SIZE: u64 = 50;
pub const MULTICALL_INTER_BATCH_DELAY_MS: u64 = 1_000;

pub const RPC_DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const RPC_DEFAULT_RETRY_BASE_MS: u64 = 2_000;
pub const RPC_DEFAULT_JITTER_MS: u64 = 250;
pub const CHAIN_DETECT_TIMEOUT_MS: u64 = 2_000;

/// `Mint(address indexed from, uint256 rewardAmount, uint256 epochCount, bytes32 newChallengeNumber)`
pub const MINT_EVENT_SIGNATURE: &str = "Mint(address,uint256,uint256,bytes32)";

/// Dynamic-fee flag shared by every tracked pool key.
pub const DYNAMIC_FEE_FLAG: u32 = 0x80_0000;
pub const TRACKED_POOL_TICK_SPACING: i32 = 60;

/// Eras per difficulty period.
pub const ERAS_PER_DIFFICULTY_PERIOD: f64 = 80.0;
/// On-chain era -> mint scaling applied to the sampled era deltas.
pub const ERA_MINT_SCALING: f64 = 3.5;
/// Mints per epoch protocol constant used by the reward-time derivation.
pub const MINTS_PER_EPOCH_ADJUSTMENT: f64 = 8.0;
/// Seconds targeted per solution in the hashrate formula.
pub const HASHRATE_TARGET_SECONDS: f64 = 600.0;

pub const MINED_BLOCKS_FILE: &str = "mined_blocks_mainnet.json";
pub const PRICE_DATA_FILE: &str = "price_data_bwork_mainnetv2.json";

pub const CACHE_KEY_MINED_BLOCKS: &str = "mined_blocks_dataset";
pub const CACHE_KEY_MINED_BLOCKS_TIP: &str = "mined_blocks_latest_block";
pub const CACHE_KEY_PREVIOUS_CHALLENGE: &str = "mined_blocks_previous_challenge";
pub const CACHE_KEY_DIFFICULTY_START: &str = "mined_blocks_difficulty_start_block";
pub const CACHE_KEY_FAILED_WINDOWS: &str = "mined_blocks_failed_windows";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_target_is_2_pow_234() {
        assert_eq!(max_target().bit_len(), MAX_TARGET_BITS + 1);
        assert_eq!(max_target().trailing_zeros(), MAX_TARGET_BITS);
    }

    #[test]
    fn test_wad_is_one_ether() {
        assert_eq!(WAD_U256, U256::from(10u64).pow(U256::from(18)));
    }
}
