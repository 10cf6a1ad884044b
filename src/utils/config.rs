use crate::error::{AggregatorError, Result};
use crate::storage::cache_db::DEFAULT_CACHE_DB_PATH;
use crate::utils::constants::{
    DEFAULT_SECONDS_PER_BLOCK, MULTICALL3_ADDRESS, RPC_DEFAULT_JITTER_MS,
    RPC_DEFAULT_MAX_ATTEMPTS, RPC_DEFAULT_RETRY_BASE_MS,
};
use crate::utils::rpc::RetryPolicy;
use alloy::primitives::{address, Address, U256};
use std::env;

/// Uniswap v4 PoolManager on Base.
pub const DEFAULT_POOL_MANAGER_ADDRESS: Address =
    address!("498581fF718922c3f8e6A244956aF099B2652b2b");
/// Uniswap v4 StateView lens on Base.
pub const DEFAULT_STATE_VIEW_ADDRESS: Address =
    address!("A3c0c9b65baD0b08107Aa264b0f3dB444b867A71");
pub const DEFAULT_USDC_ADDRESS: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
pub const DEFAULT_WETH_ADDRESS: Address = address!("4200000000000000000000000000000000000006");

/// Base genesis; every later block is `2s` apart.
pub const DEFAULT_REFERENCE_BLOCK: u64 = 0;
pub const DEFAULT_REFERENCE_TIMESTAMP: u64 = 1_686_789_347;

pub const DEFAULT_RANGE_DAYS: u64 = 30;
pub const DEFAULT_SAMPLES: usize = 60;

/// Storage layout of the token contract's mining state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSlots {
    pub latest_difficulty_period_started: U256,
    pub epoch_count: U256,
    pub mining_target: U256,
    pub challenge_number: U256,
    pub reward_era: U256,
    pub tokens_minted: U256,
}

impl Default for TokenSlots {
    fn default() -> Self {
        Self {
            latest_difficulty_period_started: U256::from(6),
            epoch_count: U256::from(7),
            mining_target: U256::from(10),
            challenge_number: U256::from(11),
            reward_era: U256::from(13),
            tokens_minted: U256::from(16),
        }
    }
}

/// Endpoints the host may swap at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub rpc_url: String,
    pub eth_rpc_url: Option<String>,
    pub data_source_url: Option<String>,
    pub backup_data_source_url: Option<String>,
    pub price_data_source_url: Option<String>,
    pub price_backup_data_source_url: Option<String>,
}

impl Endpoints {
    pub fn validate(&self) -> Result<()> {
        validate_http_url("BWORK_RPC_URL", &self.rpc_url)?;
        let optional = [
            ("BWORK_ETH_RPC_URL", &self.eth_rpc_url),
            ("BWORK_DATA_SOURCE_URL", &self.data_source_url),
            ("BWORK_BACKUP_DATA_SOURCE_URL", &self.backup_data_source_url),
            ("BWORK_PRICE_DATA_SOURCE_URL", &self.price_data_source_url),
            (
                "BWORK_PRICE_BACKUP_DATA_SOURCE_URL",
                &self.price_backup_data_source_url,
            ),
        ];
        for (name, value) in optional {
            if let Some(url) = value.as_deref() {
                validate_http_url(name, url)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub endpoints: Endpoints,
    pub token_address: Address,
    pub pool_manager_address: Address,
    pub state_view_address: Address,
    pub position_finder_address: Option<Address>,
    pub hook_address: Address,
    pub usdc_address: Address,
    pub weth_address: Address,
    pub multicall3_address: Address,
    pub cache_db_path: String,
    /// JSON registry of named miners (`BWORK_KNOWN_MINERS_FILE`).
    pub known_miners_file: Option<String>,
    pub genesis_block: u64,
    pub seconds_per_block: u64,
    pub reference_block: u64,
    pub reference_timestamp: u64,
    pub retry: RetryPolicy,
    pub range_days: u64,
    pub samples: usize,
    pub token_slots: TokenSlots,
}

pub fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.trim().parse::<reqwest::Url>().map_err(|e| {
        AggregatorError::fatal(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(AggregatorError::fatal(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_address(name: &str, raw: &str) -> Result<Address> {
    raw.trim().parse::<Address>().map_err(|e| {
        AggregatorError::fatal(format!("{name} must be a 20-byte hex address, got `{raw}`: {e}"))
    })
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        AggregatorError::fatal(format!("{name} must be an unsigned integer, got `{raw}`"))
    })
}

fn parse_slot(name: &str, raw: &str) -> Result<U256> {
    crate::utils::hex::to_u256(raw).ok_or_else(|| {
        AggregatorError::fatal(format!("{name} must be a decimal or 0x slot index, got `{raw}`"))
    })
}

impl AggregatorConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; `load` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        let rpc_url = get("BWORK_RPC_URL")
            .ok_or_else(|| AggregatorError::fatal("BWORK_RPC_URL must be set"))?;
        let data_source_url = get("BWORK_DATA_SOURCE_URL");
        let backup_data_source_url = get("BWORK_BACKUP_DATA_SOURCE_URL");
        let endpoints = Endpoints {
            rpc_url,
            eth_rpc_url: get("BWORK_ETH_RPC_URL"),
            price_data_source_url: get("BWORK_PRICE_DATA_SOURCE_URL")
                .or_else(|| data_source_url.clone()),
            price_backup_data_source_url: get("BWORK_PRICE_BACKUP_DATA_SOURCE_URL")
                .or_else(|| backup_data_source_url.clone()),
            data_source_url,
            backup_data_source_url,
        };
        endpoints.validate()?;

        let token_address = get("BWORK_TOKEN_ADDRESS")
            .ok_or_else(|| AggregatorError::fatal("BWORK_TOKEN_ADDRESS must be set"))
            .and_then(|raw| parse_address("BWORK_TOKEN_ADDRESS", &raw))?;

        let address_or = |name: &str, default: Address| -> Result<Address> {
            match get(name) {
                Some(raw) => parse_address(name, &raw),
                None => Ok(default),
            }
        };
        let number_or = |name: &str, default: u64| -> Result<u64> {
            match get(name) {
                Some(raw) => parse_number(name, &raw),
                None => Ok(default),
            }
        };
        let slot_or = |name: &str, default: U256| -> Result<U256> {
            match get(name) {
                Some(raw) => parse_slot(name, &raw),
                None => Ok(default),
            }
        };

        let seconds_per_block = number_or("BWORK_SECONDS_PER_BLOCK", DEFAULT_SECONDS_PER_BLOCK)?;
        if seconds_per_block == 0 {
            return Err(AggregatorError::fatal(
                "BWORK_SECONDS_PER_BLOCK must be greater than zero",
            ));
        }

        let max_attempts = number_or("RPC_MAX_ATTEMPTS", RPC_DEFAULT_MAX_ATTEMPTS as u64)?;
        let retry = RetryPolicy {
            max_attempts: usize::try_from(max_attempts.max(1)).unwrap_or(RPC_DEFAULT_MAX_ATTEMPTS),
            base_ms: number_or("RPC_RETRY_BASE_MS", RPC_DEFAULT_RETRY_BASE_MS)?,
            jitter_ms: number_or("RPC_RETRY_JITTER_MS", RPC_DEFAULT_JITTER_MS)?,
            ..RetryPolicy::default()
        };

        let defaults = TokenSlots::default();
        let token_slots = TokenSlots {
            latest_difficulty_period_started: slot_or(
                "BWORK_SLOT_DIFFICULTY_START",
                defaults.latest_difficulty_period_started,
            )?,
            epoch_count: slot_or("BWORK_SLOT_EPOCH_COUNT", defaults.epoch_count)?,
            mining_target: slot_or("BWORK_SLOT_MINING_TARGET", defaults.mining_target)?,
            challenge_number: slot_or("BWORK_SLOT_CHALLENGE", defaults.challenge_number)?,
            reward_era: slot_or("BWORK_SLOT_REWARD_ERA", defaults.reward_era)?,
            tokens_minted: slot_or("BWORK_SLOT_TOKENS_MINTED", defaults.tokens_minted)?,
        };

        Ok(Self {
            endpoints,
            token_address,
            pool_manager_address: address_or(
                "BWORK_POOL_MANAGER_ADDRESS",
                DEFAULT_POOL_MANAGER_ADDRESS,
            )?,
            state_view_address: address_or("BWORK_STATE_VIEW_ADDRESS", DEFAULT_STATE_VIEW_ADDRESS)?,
            position_finder_address: get("BWORK_POSITION_FINDER_ADDRESS")
                .map(|raw| parse_address("BWORK_POSITION_FINDER_ADDRESS", &raw))
                .transpose()?,
            hook_address: address_or("BWORK_HOOK_ADDRESS", Address::ZERO)?,
            usdc_address: address_or("BWORK_USDC_ADDRESS", DEFAULT_USDC_ADDRESS)?,
            weth_address: address_or("BWORK_WETH_ADDRESS", DEFAULT_WETH_ADDRESS)?,
            multicall3_address: address_or("MULTICALL3_ADDRESS", MULTICALL3_ADDRESS)?,
            cache_db_path: get("BWORK_CACHE_DB").unwrap_or_else(|| DEFAULT_CACHE_DB_PATH.to_string()),
            known_miners_file: get("BWORK_KNOWN_MINERS_FILE"),
            genesis_block: number_or("BWORK_GENESIS_BLOCK", 0)?,
            seconds_per_block,
            reference_block: number_or("BWORK_REFERENCE_BLOCK", DEFAULT_REFERENCE_BLOCK)?,
            reference_timestamp: number_or(
                "BWORK_REFERENCE_TIMESTAMP",
                DEFAULT_REFERENCE_TIMESTAMP,
            )?,
            retry,
            range_days: number_or("BWORK_RANGE_DAYS", DEFAULT_RANGE_DAYS)?.max(1),
            samples: usize::try_from(number_or("BWORK_SAMPLES", DEFAULT_SAMPLES as u64)?)
                .unwrap_or(DEFAULT_SAMPLES)
                .max(1),
            token_slots,
        })
    }
}
