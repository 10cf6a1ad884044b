mod common;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;
use bwork_aggregator::context::{AggregatorContext, ChainId, ChartSlots};
use bwork_aggregator::miners::KnownMinerRegistry;
use bwork_aggregator::multicall::{
    aggregate3Call, epochCountCall, getBlockNumberCall, getChallengeNumberCall,
    getMiningTargetCall, getSlot0Call, getStakedIDsCall, getUnstakedIDsCall,
    latestDifficultyPeriodStartedCall, maxStakedIDforUserCall, ownerCall, rewardEraCall,
    tokensMintedCall, CallRequest, Multicall, Multicall3Call, Multicall3Result,
};
use bwork_aggregator::protocols::uniswap_v4::tracked_pool_keys;
use bwork_aggregator::sampler::SamplerOptions;
use bwork_aggregator::snapshot::{MinedBlocksSnapshot, PriceHistory, SnapshotFetcher};
use bwork_aggregator::AggregatorError;
use bwork_aggregator::utils::config::AggregatorConfig;
use bwork_aggregator::utils::constants::MULTICALL3_ADDRESS;
use bwork_aggregator::utils::rpc::{RetryPolicy, RpcBackend, RpcTransport};
use common::{block_param, cleanup, temp_cache, transport, ScriptedRpc, MIDNIGHT};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Duration;

const TOKEN: &str = "0x1111111111111111111111111111111111111111";
const HOOK: &str = "0x2222222222222222222222222222222222222222";
const OWNER: Address = Address::new([0x0f; 20]);
const HEAD: u64 = 20_000;
const MAX_STAKED: u64 = 120;

fn config() -> AggregatorConfig {
    AggregatorConfig::from_lookup(|key| match key {
        "BWORK_RPC_URL" => Some("https://rpc.example".to_string()),
        "BWORK_TOKEN_ADDRESS" => Some(TOKEN.to_string()),
        "BWORK_HOOK_ADDRESS" => Some(HOOK.to_string()),
        _ => None,
    })
    .expect("config")
}

fn token() -> Address {
    TOKEN.parse().expect("token")
}

fn hook() -> Address {
    HOOK.parse().expect("hook")
}

fn q96() -> U256 {
    U256::from(1u8) << 96
}

fn ok(data: Vec<u8>) -> Multicall3Result {
    Multicall3Result {
        success: true,
        returnData: data.into(),
    }
}

fn failed() -> Multicall3Result {
    Multicall3Result {
        success: false,
        returnData: Bytes::new(),
    }
}

fn slot0_return(sqrt: U256, tick: i32, lp_fee: u32) -> Vec<u8> {
    let mut out = vec![0u8; 128];
    out[..32].copy_from_slice(&sqrt.to_be_bytes::<32>());
    if tick < 0 {
        out[32..60].fill(0xff);
    }
    out[60..64].copy_from_slice(&tick.to_be_bytes());
    out[124..128].copy_from_slice(&lp_fee.to_be_bytes());
    out
}

fn id_page(start: U256, count: U256) -> Vec<U256> {
    let start = start.to::<u64>();
    let end = (start + count.to::<u64>()).min(MAX_STAKED);
    let mut ids: Vec<U256> = (start + 1..=end).map(U256::from).collect();
    if start == 0 {
        ids.push(U256::ZERO);
    }
    ids
}

/// A node whose `eth_call` behaves like Multicall3 over a fake token, StateView and finder.
fn answer(call: &Multicall3Call) -> Multicall3Result {
    let data = call.callData.as_ref();
    let selector: [u8; 4] = data[..4].try_into().expect("selector");
    match selector {
        s if s == getMiningTargetCall::SELECTOR => ok(U256::from(1u64 << 40).abi_encode()),
        s if s == rewardEraCall::SELECTOR => ok(U256::from(3u8).abi_encode()),
        s if s == tokensMintedCall::SELECTOR => {
            ok((U256::from(1_000u64) * U256::from(10u64).pow(U256::from(18u8))).abi_encode())
        }
        s if s == latestDifficultyPeriodStartedCall::SELECTOR => ok(U256::from(12_345u64).abi_encode()),
        s if s == getChallengeNumberCall::SELECTOR => ok(B256::from([0xcc; 32]).abi_encode()),
        s if s == epochCountCall::SELECTOR => ok(U256::from(77u8).abi_encode()),
        s if s == getBlockNumberCall::SELECTOR => ok(U256::from(HEAD).abi_encode()),
        s if s == ownerCall::SELECTOR => {
            if call.target == hook() {
                failed()
            } else {
                ok(OWNER.abi_encode())
            }
        }
        s if s == getSlot0Call::SELECTOR => {
            let keys = tracked_pool_keys(token(), config().usdc_address, config().weth_address, hook());
            let decoded = getSlot0Call::abi_decode(data, true).expect("getSlot0");
            let first = bwork_aggregator::protocols::uniswap_v4::pool_id(&keys[0]);
            let second = bwork_aggregator::protocols::uniswap_v4::pool_id(&keys[1]);
            if decoded.poolId == first {
                ok(slot0_return(q96() * U256::from(2u8), -120, 0x4000))
            } else if decoded.poolId == second {
                ok(slot0_return(q96(), 0, 500))
            } else {
                // Uninitialised pool: StateView answers with an all-zero slot.
                ok(slot0_return(U256::ZERO, 0, 0))
            }
        }
        s if s == maxStakedIDforUserCall::SELECTOR => ok(U256::from(MAX_STAKED).abi_encode()),
        s if s == getStakedIDsCall::SELECTOR => {
            let decoded = getStakedIDsCall::abi_decode(data, true).expect("getStakedIDs");
            ok(id_page(decoded.start, decoded.count).abi_encode())
        }
        s if s == getUnstakedIDsCall::SELECTOR => {
            let decoded = getUnstakedIDsCall::abi_decode(data, true).expect("getUnstakedIDs");
            let ids: Vec<U256> = if decoded.start.is_zero() {
                vec![U256::ZERO, U256::from(900u64)]
            } else {
                Vec::new()
            };
            ok(ids.abi_encode())
        }
        _ => failed(),
    }
}

fn multicall_node() -> Arc<ScriptedRpc> {
    ScriptedRpc::new(|method, params| match method {
        "eth_call" => {
            let raw = params[0]["data"].as_str().ok_or("missing data")?;
            let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(|e| e.to_string())?;
            let request = aggregate3Call::abi_decode(&bytes, true).map_err(|e| e.to_string())?;
            let results: Vec<Multicall3Result> = request.calls.iter().map(answer).collect();
            Ok(json!(format!("0x{}", hex::encode((results,).abi_encode_params()))))
        }
        "eth_chainId" => Ok(json!("0x2105")),
        other => Err(format!("method not found: {other}")),
    })
}

fn context(backend: Arc<ScriptedRpc>, name: &str) -> (AggregatorContext, std::path::PathBuf) {
    let (cache, path) = temp_cache(name);
    let options = SamplerOptions {
        intra_batch_delay: Duration::ZERO,
        inter_group_delay: Duration::ZERO,
        clock: Arc::new(|| MIDNIGHT),
        ..SamplerOptions::default()
    };
    let ctx = AggregatorContext::with_sampler_options(
        config(),
        transport(backend, 0),
        cache,
        None,
        KnownMinerRegistry::new(),
        options,
    );
    (ctx, path)
}

#[tokio::test(flavor = "current_thread")]
async fn test_boot_super_call_reads_everything_in_one_round_trip() {
    let backend = multicall_node();
    let (ctx, path) = context(backend.clone(), "boot");

    let stats = ctx.fetch_contract_stats().await.expect("stats");

    assert_eq!(backend.count("eth_call"), 1);
    assert_eq!(stats.block_number, HEAD);
    assert_eq!(stats.latest_difficulty_period_started, 12_345);
    assert_eq!(stats.mining_target, U256::from(1u64 << 40));
    assert_eq!(stats.epoch_count, U256::from(77u8));
    assert_eq!(stats.challenge_number, B256::from([0xcc; 32]));
    assert_eq!(stats.owners, vec![(token(), Some(OWNER)), (hook(), None)]);
    cleanup(&path);
}

#[tokio::test(flavor = "current_thread")]
async fn test_pool_fee_failures_stay_local() {
    let backend = multicall_node();
    let (ctx, path) = context(backend, "fees");

    let fees = ctx.fetch_pool_fees().await.expect("fees");

    assert_eq!(fees.len(), 4);
    assert_eq!(fees[0].lp_fee, Some(0x4000));
    assert_eq!(fees[1].lp_fee, Some(500));
    assert_eq!(fees[1].sqrt_price_x96, Some(q96()));
    assert!(fees[2].lp_fee.is_none());
    assert!(fees[3].sqrt_price_x96.is_none());
    cleanup(&path);
}

#[tokio::test(flavor = "current_thread")]
async fn test_aggregate_preserves_order_and_failure_flags() {
    let backend = multicall_node();
    let (ctx, path) = context(backend, "aggregate");

    let calls = [
        CallRequest::new(token(), epochCountCall {}.abi_encode()),
        CallRequest::new(hook(), ownerCall {}.abi_encode()),
        CallRequest::new(MULTICALL3_ADDRESS, getBlockNumberCall {}.abi_encode()),
    ];
    let results = ctx.aggregate(&calls).await.expect("aggregate");

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].decode::<epochCountCall>().map(|r| r._0), Some(U256::from(77u8)));
    assert!(!results[1].success);
    assert_eq!(
        results[2].decode::<getBlockNumberCall>().map(|r| r.blockNumber),
        Some(U256::from(HEAD))
    );
    assert!(ctx.aggregate(&[]).await.expect("empty").is_empty());
    cleanup(&path);
}

#[tokio::test(flavor = "current_thread")]
async fn test_price_ratio_and_position_paging() {
    let backend = multicall_node();
    let multicall = Multicall::new(transport(backend.clone(), 0), MULTICALL3_ADDRESS)
        .with_paging(50, Duration::ZERO);
    let keys = tracked_pool_keys(token(), config().usdc_address, config().weth_address, hook());

    let ratio = multicall
        .fetch_price_ratio(config().state_view_address, &keys[0])
        .await
        .expect("ratio");
    assert_eq!(ratio.block_number, HEAD);
    assert_eq!(ratio.tick, -120);
    assert_eq!(ratio.ratio_wad, U256::from(4_000_000_000_000_000_000u128));

    let before = backend.count("eth_call");
    let positions = multicall
        .fetch_user_positions(Address::from([0x77; 20]), Address::from([0x88; 20]))
        .await
        .expect("positions");
    assert_eq!(positions.max_staked_id, U256::from(MAX_STAKED));
    assert_eq!(positions.staked.len(), MAX_STAKED as usize);
    assert!(positions.staked.iter().all(|id| !id.is_zero()));
    assert_eq!(positions.unstaked, vec![U256::from(900u64)]);
    // First batch plus the pages starting at 50 and 100.
    assert_eq!(backend.count("eth_call") - before, 3);
}

struct SilentNode;

#[async_trait]
impl RpcBackend for SilentNode {
    async fn request(&self, _method: &'static str, _params: Value) -> Result<Value, String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!("0x1"))
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_chain_detection_degrades_to_unknown() {
    let (ctx, path) = context(multicall_node(), "chain");
    assert_eq!(ctx.detect_chain().await, ChainId::Base);

    ctx.set_backend(Arc::new(SilentNode)).await;
    assert_eq!(ctx.detect_chain().await, ChainId::Unknown);
    cleanup(&path);
}

#[tokio::test(flavor = "current_thread")]
async fn test_set_endpoints_validates_and_swaps() {
    let (ctx, path) = context(multicall_node(), "endpoints");
    let mut endpoints = ctx.endpoints().await;

    endpoints.rpc_url = "ftp://nope".to_string();
    assert!(ctx.set_endpoints(endpoints.clone()).await.is_err());
    assert_eq!(ctx.endpoints().await.rpc_url, "https://rpc.example");

    endpoints.rpc_url = "https://other.example".to_string();
    ctx.set_endpoints(endpoints).await.expect("swap");
    assert_eq!(ctx.endpoints().await.rpc_url, "https://other.example");
    assert_eq!(ctx.rpc().await.endpoint(), "https://other.example");
    cleanup(&path);
}

fn word_u256(value: U256) -> Value {
    json!(format!("0x{:064x}", value))
}

#[tokio::test(flavor = "current_thread")]
async fn test_chart_pipeline_from_sampled_slots() {
    let slots = ChartSlots::from_config(&config());
    let slot_hex = |slot: U256| format!("0x{slot:x}");
    let target = slot_hex(slots.mining_target.slot);
    let era = slot_hex(slots.era.slot);
    let minted = slot_hex(slots.tokens_minted.slot);
    let tokens_per_eth = slot_hex(slots.tokens_per_eth.slot);
    let eth_usd = slot_hex(slots.eth_usd.slot);

    let backend = ScriptedRpc::new(move |method, params| {
        if method != "eth_getStorageAt" {
            return Err(format!("method not found: {method}"));
        }
        let block = block_param(params, 2);
        let slot = params[1].as_str().unwrap_or_default();
        let value = if slot == target {
            U256::from(1u64 << 40)
        } else if slot == era {
            U256::from(block / 10)
        } else if slot == minted {
            U256::from(block) * U256::from(1_000_000_000_000_000_000u64)
        } else if slot == tokens_per_eth {
            // 1e6 tokens per ETH
            (U256::from(1u8) << 96) * U256::from(1_000u64)
        } else if slot == eth_usd {
            // ~3000 USD per ETH after the 1e12 scaling
            U256::from_str_radix("4339505179874779489431521", 10).expect("sqrt")
        } else {
            U256::from(block / 100)
        };
        Ok(word_u256(value))
    });
    let (ctx, path) = context(backend.clone(), "charts");

    let sampled = ctx.fetch_chart_series(100_000, 1, 5).await.expect("sample");
    assert_eq!(sampled.mining_target.len(), 5);
    assert_eq!(sampled.era.blocks().last(), Some(100_000));
    // One day back from the head at two seconds per block.
    assert_eq!(sampled.era.blocks().next(), Some(56_800));
    let calls = backend.calls().len();
    assert_eq!(calls, 6 * 5);

    let again = ctx.fetch_chart_series(100_000, 1, 5).await.expect("hot cache");
    assert!(Arc::ptr_eq(&sampled.era, &again.era));
    assert_eq!(backend.calls().len(), calls);

    let chart = ctx.compute_chart_series(&sampled.inputs());
    assert_eq!(chart.difficulty_points.len(), 5);
    assert_eq!(chart.hashrate_points.len(), 4);
    assert_eq!(chart.reward_time_points.len(), 4);
    assert_eq!(chart.eth_price_points[0].value, 2_999.0);
    assert!(chart
        .usd_price_points
        .iter()
        .all(|p| (p.value - 0.002_999).abs() < 1e-9));
    // 1 token per block, 43_200 blocks per day, at the USD price above.
    assert_eq!(chart.revenue_points.len(), 4);
    assert!((chart.revenue_points[0].value - 43_200.0 * 0.002_999).abs() < 1e-6);
    cleanup(&path);
}

#[test]
fn test_transport_policy_is_shared_by_context() {
    let rpc = RpcTransport::new(
        ScriptedRpc::new(|_, _| Ok(json!("0x0"))),
        RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        },
    );
    assert_eq!(rpc.policy().max_attempts, 2);
    assert_eq!(rpc.endpoint(), "scripted://node");
}

/// Snapshot source that serves a fixed price history and no mined-blocks document.
struct FixedPrices(PriceHistory);

#[async_trait]
impl SnapshotFetcher for FixedPrices {
    async fn fetch_mined_blocks(&self) -> bwork_aggregator::Result<MinedBlocksSnapshot> {
        Err(AggregatorError::SnapshotUnavailable {
            primary: "offline".to_string(),
            backup: "offline".to_string(),
        })
    }

    async fn fetch_price_history(&self) -> bwork_aggregator::Result<PriceHistory> {
        Ok(self.0.clone())
    }
}

fn context_with_prices(history: PriceHistory, name: &str) -> (AggregatorContext, std::path::PathBuf) {
    let (cache, path) = temp_cache(name);
    let backend = ScriptedRpc::new(|method, _| Err(format!("method not found: {method}")));
    let ctx = AggregatorContext::with_sampler_options(
        config(),
        transport(backend, 0),
        cache,
        Some(Arc::new(FixedPrices(history))),
        KnownMinerRegistry::new(),
        SamplerOptions::default(),
    );
    (ctx, path)
}

#[tokio::test(flavor = "current_thread")]
async fn test_price_history_is_served_as_points() {
    let history = PriceHistory {
        prices: vec![0.0021, 0.0025, 0.0030],
        timestamps: vec![1_700_000_000, 1_700_086_400, 1_700_172_800],
        blocks: vec![50_000, 93_200, 136_400],
        last_updated: Some(1_700_172_900),
    };
    let (ctx, path) = context_with_prices(history, "prices");

    let points = ctx.fetch_price_history().await.expect("history");
    assert_eq!(points.len(), 3);
    assert_eq!(points[1].block, 93_200);
    assert_eq!(points[1].timestamp, 1_700_086_400);
    assert!((points[2].price - 0.0030).abs() < 1e-12);
    cleanup(&path);
}

#[tokio::test(flavor = "current_thread")]
async fn test_price_history_rejects_ragged_arrays_and_missing_sources() {
    let ragged = PriceHistory {
        prices: vec![0.0021, 0.0025],
        timestamps: vec![1_700_000_000],
        blocks: vec![50_000, 93_200],
        last_updated: None,
    };
    let (ctx, path) = context_with_prices(ragged, "ragged");
    assert!(matches!(
        ctx.fetch_price_history().await,
        Err(AggregatorError::ProtocolDecode(_))
    ));
    cleanup(&path);

    let (bare, path) = context(multicall_node(), "noprices");
    assert!(matches!(
        bare.fetch_price_history().await,
        Err(AggregatorError::SnapshotUnavailable { .. })
    ));
    cleanup(&path);
}
