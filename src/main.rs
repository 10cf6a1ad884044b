use anyhow::Context;
use bwork_aggregator::context::{AggregatorContext, ChainId};
use bwork_aggregator::derive::ChartSeries;
use bwork_aggregator::miners::MinerAggregates;
use bwork_aggregator::multicall::{ContractStats, PoolFee, UserPositions};
use bwork_aggregator::runtime::parse_runtime_args;
use bwork_aggregator::scanner::ScanRequest;
use bwork_aggregator::snapshot::PricePoint;
use bwork_aggregator::utils::config::AggregatorConfig;
use bwork_aggregator::utils::rpc::RpcStatsSnapshot;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ScanSummary {
    entries: usize,
    tip: u64,
    new_events: usize,
    difficulty_start_block: u64,
    failed_windows: Vec<(u64, u64)>,
    snapshot_error: Option<String>,
    from_cache_only: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    chain: ChainId,
    chain_name: &'static str,
    head: u64,
    range_days: u64,
    contract_stats: Option<ContractStats>,
    pool_fees: Vec<PoolFee>,
    scan: ScanSummary,
    charts: ChartSeries,
    price_history: Vec<PricePoint>,
    miners: MinerAggregates,
    positions: Option<UserPositions>,
    rpc: RpcStatsSnapshot,
}

fn explain_config(config: &AggregatorConfig) {
    eprintln!("[CONFIG] rpc={}", config.endpoints.rpc_url);
    eprintln!(
        "[CONFIG] data sources primary={:?} backup={:?}",
        config.endpoints.data_source_url, config.endpoints.backup_data_source_url
    );
    eprintln!(
        "[CONFIG] token={:#x} pool_manager={:#x} state_view={:#x} hook={:#x}",
        config.token_address,
        config.pool_manager_address,
        config.state_view_address,
        config.hook_address
    );
    eprintln!(
        "[CONFIG] cache={} genesis={} seconds_per_block={} range={}d samples={}",
        config.cache_db_path,
        config.genesis_block,
        config.seconds_per_block,
        config.range_days,
        config.samples
    );
    eprintln!(
        "[CONFIG] retry attempts={} base={}ms jitter={}ms",
        config.retry.max_attempts, config.retry.base_ms, config.retry.jitter_ms
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime_args = parse_runtime_args()?;

    bwork_aggregator::utils::env_guard::harden_env_setup();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        eprintln!("[STARTUP] RUST_LOG invalid or unset; defaulting to 'info'");
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = AggregatorConfig::load().context("loading aggregator configuration")?;
    if runtime_args.explain_config {
        explain_config(&config);
    }
    let range_days = config.range_days;
    let samples = config.samples;

    let ctx = AggregatorContext::new(config).context("building aggregator context")?;

    let chain = ctx.detect_chain().await;
    tracing::info!("[STARTUP] network: {} ({:?})", chain.name(), chain.id());

    let contract_stats = match ctx.fetch_contract_stats().await {
        Ok(stats) => Some(stats),
        Err(err) => {
            tracing::warn!("[STARTUP] boot multicall failed: {}", err);
            None
        }
    };
    let head = match contract_stats.as_ref() {
        Some(stats) => stats.block_number,
        None => ctx
            .rpc()
            .await
            .get_block_number()
            .await
            .context("reading chain head")?,
    };

    let pool_fees = ctx.fetch_pool_fees().await.unwrap_or_else(|err| {
        tracing::warn!("[STARTUP] pool fee query failed: {}", err);
        Vec::new()
    });

    let scan = if runtime_args.skip_scan {
        let dataset = ctx.cached_mint_dataset().await;
        let start = contract_stats
            .as_ref()
            .map(|s| s.latest_difficulty_period_started)
            .or_else(|| dataset.markers().next().map(|m| m.block))
            .unwrap_or(0);
        let summary = ScanSummary {
            entries: dataset.len(),
            tip: dataset.tip().unwrap_or(0),
            new_events: 0,
            difficulty_start_block: start,
            failed_windows: Vec::new(),
            snapshot_error: None,
            from_cache_only: true,
        };
        (dataset, summary)
    } else {
        let outcome = ctx
            .scan_mint_events(ScanRequest {
                head: Some(head),
                difficulty_start_block: contract_stats
                    .as_ref()
                    .map(|s| s.latest_difficulty_period_started),
            })
            .await
            .context("scanning Mint events")?;
        let summary = ScanSummary {
            entries: outcome.dataset.len(),
            tip: outcome.tip,
            new_events: outcome.new_events,
            difficulty_start_block: outcome.difficulty_start_block,
            failed_windows: outcome.failed_windows.clone(),
            snapshot_error: outcome.snapshot_error.clone(),
            from_cache_only: false,
        };
        (outcome.dataset, summary)
    };
    let (dataset, scan) = scan;
    let miners = ctx.compute_miner_aggregates(&dataset, scan.difficulty_start_block);

    let sampled = ctx
        .fetch_chart_series(head, range_days, samples)
        .await
        .context("sampling chart series")?;
    let charts = ctx.compute_chart_series(&sampled.inputs());

    let price_history = ctx.fetch_price_history().await.unwrap_or_else(|err| {
        tracing::warn!("[STARTUP] price history unavailable: {}", err);
        Vec::new()
    });

    let positions = match runtime_args.report_user {
        Some(user) => match ctx.fetch_user_positions(user).await {
            Ok(positions) => Some(positions),
            Err(err) => {
                tracing::warn!("[STARTUP] position enumeration failed for {:#x}: {}", user, err);
                None
            }
        },
        None => None,
    };

    let report = Report {
        chain,
        chain_name: chain.name(),
        head,
        range_days,
        contract_stats,
        pool_fees,
        scan,
        charts,
        price_history,
        miners,
        positions,
        rpc: ctx.rpc().await.stats(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );
    Ok(())
}
