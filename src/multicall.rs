//! Multicall3 batching and the aggregator's batched read paths.

use crate::error::{AggregatorError, Result};
use crate::protocols::uniswap_v4::{pool_id, price_scaled, PoolKey};
use crate::utils::constants::{MULTICALL_INTER_BATCH_DELAY_MS, MULTICALL_PAGE_SIZE, WAD_U256};
use crate::utils::rpc::RpcTransport;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

alloy::sol! {
    struct Multicall3Call {
        address target;
        bool allowFailure;
        bytes callData;
    }

    struct Multicall3Result {
        bool success;
        bytes returnData;
    }

    function aggregate3(Multicall3Call[] calldata calls)
        external
        payable
        returns (Multicall3Result[] memory returnData);

    function getBlockNumber() external view returns (uint256 blockNumber);

    function owner() external view returns (address);
    function getMiningTarget() external view returns (uint256);
    function rewardEra() external view returns (uint256);
    function tokensMinted() external view returns (uint256);
    function latestDifficultyPeriodStarted() external view returns (uint256);
    function getChallengeNumber() external view returns (bytes32);
    function epochCount() external view returns (uint256);

    function getSlot0(bytes32 poolId)
        external
        view
        returns (uint160 sqrtPriceX96, int24 tick, uint24 protocolFee, uint24 lpFee);

    function maxStakedIDforUser(address user) external view returns (uint256);
    function getStakedIDs(address user, uint256 start, uint256 count) external view returns (uint256[] memory);
    function getUnstakedIDs(address user, uint256 start, uint256 count) external view returns (uint256[] memory);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub target: Address,
    pub allow_failure: bool,
    pub call_data: Bytes,
}

impl CallRequest {
    pub fn new(target: Address, call_data: impl Into<Bytes>) -> Self {
        Self {
            target,
            allow_failure: true,
            call_data: call_data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub success: bool,
    pub return_data: Bytes,
}

impl CallResult {
    /// Decode with `C`'s return signature; `None` if the call failed or the bytes don't fit.
    pub fn decode<C: SolCall>(&self) -> Option<C::Return> {
        if !self.success {
            return None;
        }
        C::abi_decode_returns(self.return_data.as_ref(), true).ok()
    }
}

/// Raw `getSlot0` return: four ABI words.
fn decode_slot0_return(data: &[u8]) -> Option<(U256, i32, u32)> {
    if data.len() < 128 {
        return None;
    }
    let sqrt_price_x96 = U256::from_be_slice(&data[0..32]);
    let tick = i32::from_be_bytes([data[60], data[61], data[62], data[63]]);
    let lp_fee = u32::from_be_bytes([data[124], data[125], data[126], data[127]]);
    Some((sqrt_price_x96, tick, lp_fee))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractStats {
    pub owners: Vec<(Address, Option<Address>)>,
    pub mining_target: U256,
    pub reward_era: U256,
    pub tokens_minted: U256,
    pub latest_difficulty_period_started: u64,
    pub challenge_number: B256,
    pub epoch_count: U256,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolFee {
    pub currency0: Address,
    pub currency1: Address,
    pub pool_id: B256,
    /// `None` when the pool is not initialised or the lens reverted.
    pub lp_fee: Option<u32>,
    pub sqrt_price_x96: Option<U256>,
}

/// Spot ratio and the `sqrtPriceX96` it was derived from, read atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceRatioSnapshot {
    pub block_number: u64,
    pub sqrt_price_x96: U256,
    /// currency1 per currency0, 18-decimal fixed point.
    pub ratio_wad: U256,
    pub tick: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserPositions {
    pub max_staked_id: U256,
    pub staked: Vec<U256>,
    pub unstaked: Vec<U256>,
}

fn u64_field(value: U256, name: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| AggregatorError::decode(format!("{name} overflows u64")))
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| AggregatorError::decode(format!("multicall: {name} failed or returned garbage")))
}

pub struct Multicall {
    rpc: Arc<RpcTransport>,
    address: Address,
    page_size: u64,
    inter_batch_delay: Duration,
}

impl Multicall {
    pub fn new(rpc: Arc<RpcTransport>, address: Address) -> Self {
        Self {
            rpc,
            address,
            page_size: MULTICALL_PAGE_SIZE,
            inter_batch_delay: Duration::from_millis(MULTICALL_INTER_BATCH_DELAY_MS),
        }
    }

    pub fn with_paging(mut self, page_size: u64, inter_batch_delay: Duration) -> Self {
        self.page_size = page_size.max(1);
        self.inter_batch_delay = inter_batch_delay;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// One `aggregate3` round-trip; results come back in request order.
    pub async fn aggregate(&self, calls: &[CallRequest]) -> Result<Vec<CallResult>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = calls
            .iter()
            .map(|call| Multicall3Call {
                target: call.target,
                allowFailure: call.allow_failure,
                callData: call.call_data.clone(),
            })
            .collect::<Vec<_>>();
        let data: Bytes = aggregate3Call { calls: encoded }.abi_encode().into();
        let raw = self.rpc.call(self.address, data, None).await?;
        let decoded = <aggregate3Call as SolCall>::abi_decode_returns(raw.as_ref(), true)
            .map_err(|e| AggregatorError::decode(format!("aggregate3 returns: {e}")))?;
        if decoded.returnData.len() != calls.len() {
            return Err(AggregatorError::decode(format!(
                "aggregate3 returned {} results for {} calls",
                decoded.returnData.len(),
                calls.len()
            )));
        }
        tracing::debug!("[MULTICALL] {} calls in one round-trip", calls.len());
        Ok(decoded
            .returnData
            .into_iter()
            .map(|r| CallResult {
                success: r.success,
                return_data: r.returnData,
            })
            .collect())
    }

    /// Boot super-call: owners, mining state and the current block number in one request.
    pub async fn fetch_contract_stats(&self, token: Address, owned: &[Address]) -> Result<ContractStats> {
        let mut calls = vec![
            CallRequest::new(token, getMiningTargetCall {}.abi_encode()),
            CallRequest::new(token, rewardEraCall {}.abi_encode()),
            CallRequest::new(token, tokensMintedCall {}.abi_encode()),
            CallRequest::new(token, latestDifficultyPeriodStartedCall {}.abi_encode()),
            CallRequest::new(token, getChallengeNumberCall {}.abi_encode()),
            CallRequest::new(token, epochCountCall {}.abi_encode()),
            CallRequest::new(self.address, getBlockNumberCall {}.abi_encode()),
        ];
        let fixed = calls.len();
        calls.extend(
            owned
                .iter()
                .map(|target| CallRequest::new(*target, ownerCall {}.abi_encode())),
        );
        let results = self.aggregate(&calls).await?;

        let mining_target = required(results[0].decode::<getMiningTargetCall>(), "getMiningTarget")?._0;
        let reward_era = required(results[1].decode::<rewardEraCall>(), "rewardEra")?._0;
        let tokens_minted = required(results[2].decode::<tokensMintedCall>(), "tokensMinted")?._0;
        let difficulty_start = required(
            results[3].decode::<latestDifficultyPeriodStartedCall>(),
            "latestDifficultyPeriodStarted",
        )?
        ._0;
        let challenge_number =
            required(results[4].decode::<getChallengeNumberCall>(), "getChallengeNumber")?._0;
        let epoch_count = required(results[5].decode::<epochCountCall>(), "epochCount")?._0;
        let block_number =
            required(results[6].decode::<getBlockNumberCall>(), "getBlockNumber")?.blockNumber;

        let owners = owned
            .iter()
            .zip(&results[fixed..])
            .map(|(target, result)| (*target, result.decode::<ownerCall>().map(|r| r._0)))
            .collect();

        Ok(ContractStats {
            owners,
            mining_target,
            reward_era,
            tokens_minted,
            latest_difficulty_period_started: u64_field(difficulty_start, "latestDifficultyPeriodStarted")?,
            challenge_number,
            epoch_count,
            block_number: u64_field(block_number, "getBlockNumber")?,
        })
    }

    /// Current LP fee of every key through `StateView.getSlot0`; failures stay per pool.
    pub async fn fetch_pool_fees(&self, state_view: Address, keys: &[PoolKey]) -> Result<Vec<PoolFee>> {
        let calls = keys
            .iter()
            .map(|key| {
                CallRequest::new(
                    state_view,
                    getSlot0Call {
                        poolId: pool_id(key),
                    }
                    .abi_encode(),
                )
            })
            .collect::<Vec<_>>();
        let results = self.aggregate(&calls).await?;
        Ok(keys
            .iter()
            .zip(results)
            .map(|(key, result)| {
                let slot0 = result
                    .success
                    .then(|| decode_slot0_return(result.return_data.as_ref()))
                    .flatten()
                    .filter(|(sqrt, _, _)| !sqrt.is_zero());
                PoolFee {
                    currency0: key.currency0,
                    currency1: key.currency1,
                    pool_id: pool_id(key),
                    lp_fee: slot0.map(|(_, _, fee)| fee),
                    sqrt_price_x96: slot0.map(|(sqrt, _, _)| sqrt),
                }
            })
            .collect())
    }

    /// Ratio and `sqrtPriceX96` of one pool plus the block they were read at.
    pub async fn fetch_price_ratio(&self, state_view: Address, key: &PoolKey) -> Result<PriceRatioSnapshot> {
        let calls = [
            CallRequest::new(
                state_view,
                getSlot0Call {
                    poolId: pool_id(key),
                }
                .abi_encode(),
            ),
            CallRequest::new(self.address, getBlockNumberCall {}.abi_encode()),
        ];
        let results = self.aggregate(&calls).await?;
        let (sqrt_price_x96, tick, _) = required(
            results[0]
                .success
                .then(|| decode_slot0_return(results[0].return_data.as_ref()))
                .flatten(),
            "getSlot0",
        )?;
        let block_number =
            required(results[1].decode::<getBlockNumberCall>(), "getBlockNumber")?.blockNumber;
        Ok(PriceRatioSnapshot {
            block_number: u64_field(block_number, "getBlockNumber")?,
            sqrt_price_x96,
            ratio_wad: price_scaled(sqrt_price_x96, WAD_U256),
            tick,
        })
    }

    /// Staked and unstaked position ids of `user`, paged `page_size` at a time.
    pub async fn fetch_user_positions(&self, finder: Address, user: Address) -> Result<UserPositions> {
        let page = U256::from(self.page_size);
        let first = [
            CallRequest::new(finder, maxStakedIDforUserCall { user }.abi_encode()),
            CallRequest::new(
                finder,
                getStakedIDsCall {
                    user,
                    start: U256::ZERO,
                    count: page,
                }
                .abi_encode(),
            ),
            CallRequest::new(
                finder,
                getUnstakedIDsCall {
                    user,
                    start: U256::ZERO,
                    count: page,
                }
                .abi_encode(),
            ),
        ];
        let results = self.aggregate(&first).await?;
        let max_staked_id =
            required(results[0].decode::<maxStakedIDforUserCall>(), "maxStakedIDforUser")?._0;
        let mut positions = UserPositions {
            max_staked_id,
            staked: results[1]
                .decode::<getStakedIDsCall>()
                .map(|r| r._0)
                .unwrap_or_default(),
            unstaked: results[2]
                .decode::<getUnstakedIDsCall>()
                .map(|r| r._0)
                .unwrap_or_default(),
        };

        let mut start = page;
        while start < max_staked_id {
            sleep(self.inter_batch_delay).await;
            let batch = [
                CallRequest::new(finder, getStakedIDsCall { user, start, count: page }.abi_encode()),
                CallRequest::new(finder, getUnstakedIDsCall { user, start, count: page }.abi_encode()),
            ];
            let results = self.aggregate(&batch).await?;
            let staked = results[0]
                .decode::<getStakedIDsCall>()
                .map(|r| r._0)
                .unwrap_or_default();
            let unstaked = results[1]
                .decode::<getUnstakedIDsCall>()
                .map(|r| r._0)
                .unwrap_or_default();
            if staked.is_empty() && unstaked.is_empty() {
                break;
            }
            positions.staked.extend(staked);
            positions.unstaked.extend(unstaked);
            start = start.saturating_add(page);
        }

        positions.staked.retain(|id| !id.is_zero());
        positions.unstaked.retain(|id| !id.is_zero());
        tracing::info!(
            "[MULTICALL] {} staked / {} unstaked positions for {:#x}",
            positions.staked.len(),
            positions.unstaked.len(),
            user
        );
        Ok(positions)
    }
}
