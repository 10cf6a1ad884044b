//! Incremental `Mint` event scanner.
//!
//! The scan runs `Init -> LoadCache -> FetchReferenceSnapshot -> PickNewerSource -> Scan ->
//! Merge -> Persist -> Done`. Windows of `eth_getLogs` are walked strictly in ascending
//! order; a newer scan supersedes an older one at the next window boundary.

use crate::error::{AggregatorError, Result};
use crate::miners::MinerTally;
use crate::snapshot::SnapshotFetcher;
use crate::storage::cache_db::{CacheDb, CacheKey};
use crate::utils::constants::{
    CACHE_KEY_DIFFICULTY_START, CACHE_KEY_FAILED_WINDOWS, CACHE_KEY_MINED_BLOCKS,
    CACHE_KEY_MINED_BLOCKS_TIP, CACHE_KEY_PREVIOUS_CHALLENGE, MINT_EVENT_SIGNATURE, SCAN_INTER_WINDOW_DELAY_MS,
    SCAN_WINDOW_BLOCKS, SCAN_WINDOW_RETRIES, SCAN_WINDOW_RETRY_BASE_MS,
};
use crate::utils::hex::{b256_from_hex, wad_to_f64};
use crate::utils::rpc::{LogFilter, RawLog, RpcTransport};
use alloy::primitives::{keccak256, Address, B256, U256};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};

/// Reward sentinel that marks a challenge transition in the serialized dataset.
pub const CHALLENGE_MARKER_REWARD: f64 = -1.0;

pub fn mint_topic() -> B256 {
    keccak256(MINT_EVENT_SIGNATURE.as_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MintEvent {
    pub block: u64,
    pub tx_hash: B256,
    pub miner: Address,
    /// Whole tokens (18-decimal fixed point already divided out).
    pub reward: f64,
    pub epoch_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeMarker {
    pub block: u64,
    pub tx_hash: B256,
    pub challenge: B256,
    pub epoch_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MintEntry {
    Event(MintEvent),
    Marker(ChallengeMarker),
}

fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => crate::utils::hex::to_u256(s).and_then(|v| u64::try_from(v).ok()),
        _ => None,
    }
}

fn json_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

impl MintEntry {
    pub fn block(&self) -> u64 {
        match self {
            MintEntry::Event(e) => e.block,
            MintEntry::Marker(m) => m.block,
        }
    }

    pub fn tx_hash(&self) -> B256 {
        match self {
            MintEntry::Event(e) => e.tx_hash,
            MintEntry::Marker(m) => m.tx_hash,
        }
    }

    pub fn epoch_count(&self) -> u64 {
        match self {
            MintEntry::Event(e) => e.epoch_count,
            MintEntry::Marker(m) => m.epoch_count,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, MintEntry::Marker(_))
    }

    pub fn as_event(&self) -> Option<&MintEvent> {
        match self {
            MintEntry::Event(e) => Some(e),
            MintEntry::Marker(_) => None,
        }
    }

    /// `[block, txHash, minerOrChallenge, reward, epochCount]`
    pub fn to_json(&self) -> Value {
        match self {
            MintEntry::Event(e) => json!([
                e.block,
                format!("{:#x}", e.tx_hash),
                format!("{:#x}", e.miner),
                e.reward,
                e.epoch_count
            ]),
            MintEntry::Marker(m) => json!([
                m.block,
                format!("{:#x}", m.tx_hash),
                format!("{:#x}", m.challenge),
                CHALLENGE_MARKER_REWARD,
                m.epoch_count
            ]),
        }
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let fields = value.as_array()?;
        if fields.len() < 5 {
            return None;
        }
        let block = json_u64(&fields[0])?;
        let tx_hash = fields[1].as_str().and_then(b256_from_hex)?;
        let reward = json_f64(&fields[3])?;
        let epoch_count = json_u64(&fields[4])?;
        if reward < 0.0 {
            let challenge = fields[2].as_str().and_then(b256_from_hex)?;
            return Some(MintEntry::Marker(ChallengeMarker {
                block,
                tx_hash,
                challenge,
                epoch_count,
            }));
        }
        let miner = fields[2].as_str()?.trim().parse::<Address>().ok()?;
        Some(MintEntry::Event(MintEvent {
            block,
            tx_hash,
            miner,
            reward,
            epoch_count,
        }))
    }
}

impl Serialize for MintEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Mint events and challenge markers, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MintDataset {
    entries: Vec<MintEntry>,
}

impl MintDataset {
    pub fn new(entries: Vec<MintEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json_entries(raw: &[Value]) -> Self {
        let mut skipped = 0usize;
        let entries = raw
            .iter()
            .filter_map(|value| {
                let entry = MintEntry::from_json(value);
                if entry.is_none() {
                    skipped += 1;
                }
                entry
            })
            .collect();
        if skipped > 0 {
            tracing::warn!("[SCAN] skipped {} malformed dataset entries", skipped);
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[MintEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events only, newest first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &MintEvent> + '_ {
        self.entries.iter().filter_map(MintEntry::as_event)
    }

    pub fn markers(&self) -> impl Iterator<Item = &ChallengeMarker> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            MintEntry::Marker(m) => Some(m),
            MintEntry::Event(_) => None,
        })
    }

    /// Highest block observed in the dataset.
    pub fn tip(&self) -> Option<u64> {
        self.entries.iter().map(MintEntry::block).max()
    }

    /// Challenge of the newest marker, if any transition has been seen.
    pub fn latest_challenge(&self) -> Option<B256> {
        self.markers().next().map(|m| m.challenge)
    }

    /// Keep the newest entry per transaction hash; markers are always kept.
    pub fn dedupe(&mut self) -> usize {
        let before = self.entries.len();
        let mut seen = HashSet::with_capacity(before);
        self.entries
            .retain(|entry| entry.is_marker() || seen.insert(entry.tx_hash()));
        before - self.entries.len()
    }

    /// Put `newer` (oldest first) in front of the existing entries.
    pub fn prepend_oldest_first(&mut self, newer: Vec<MintEntry>) {
        if newer.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(newer.len() + self.entries.len());
        merged.extend(newer.into_iter().rev());
        merged.append(&mut self.entries);
        self.entries = merged;
    }

    /// Merge entries recovered from a range below the newest block (oldest first).
    ///
    /// A marker in `gap` supersedes a later marker for the same challenge, which was
    /// emitted at the first event seen after the missing range.
    pub fn merge_backfill(&mut self, gap: Vec<MintEntry>) {
        if gap.is_empty() {
            return;
        }
        let recovered: Vec<(B256, u64)> = gap
            .iter()
            .filter_map(|entry| match entry {
                MintEntry::Marker(m) => Some((m.challenge, m.block)),
                MintEntry::Event(_) => None,
            })
            .collect();
        self.entries.retain(|entry| match entry {
            MintEntry::Marker(m) => !recovered
                .iter()
                .any(|(challenge, block)| *challenge == m.challenge && *block < m.block),
            MintEntry::Event(_) => true,
        });
        let mut merged = Vec::with_capacity(gap.len() + self.entries.len());
        merged.extend(gap.into_iter().rev());
        merged.append(&mut self.entries);
        merged.sort_by_key(|entry| std::cmp::Reverse(entry.block()));
        self.entries = merged;
    }

    /// Challenge in force just before `block`, from the newest earlier marker.
    pub fn challenge_before(&self, block: u64) -> Option<B256> {
        self.markers().find(|m| m.block < block).map(|m| m.challenge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    Init,
    LoadCache,
    FetchReferenceSnapshot,
    PickNewerSource,
    Scan,
    Merge,
    Persist,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub windows_done: u64,
    pub windows_total: u64,
    pub current_block: u64,
    pub head: u64,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            phase: ScanPhase::Init,
            windows_done: 0,
            windows_total: 0,
            current_block: 0,
            head: 0,
        }
    }
}

impl ScanProgress {
    pub fn percent(&self) -> u64 {
        if self.windows_total == 0 {
            return 100;
        }
        self.windows_done.saturating_mul(100) / self.windows_total
    }
}

impl fmt::Display for ScanProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}% [{} / {}]",
            self.percent(),
            self.windows_done,
            self.windows_total
        )
    }
}

/// Replace-and-cancel control: starting a scan cancels every earlier one.
#[derive(Debug, Default)]
pub struct ScanSupervisor {
    generation: Arc<AtomicU64>,
    running: Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct ScanTicket {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl ScanTicket {
    pub fn is_cancelled(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.generation
    }
}

impl ScanSupervisor {
    pub fn begin(&self) -> ScanTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ScanTicket {
            generation,
            current: self.generation.clone(),
        }
    }

    /// Cancel whatever scan is running without starting a new one.
    pub fn cancel_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub contract: Address,
    pub genesis_block: u64,
    pub window_blocks: u64,
    pub window_retries: u32,
    pub window_retry_base: Duration,
    pub inter_window_delay: Duration,
}

impl ScanOptions {
    pub fn new(contract: Address, genesis_block: u64) -> Self {
        Self {
            contract,
            genesis_block,
            window_blocks: SCAN_WINDOW_BLOCKS,
            window_retries: SCAN_WINDOW_RETRIES,
            window_retry_base: Duration::from_millis(SCAN_WINDOW_RETRY_BASE_MS),
            inter_window_delay: Duration::from_millis(SCAN_INTER_WINDOW_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanRequest {
    /// Chain head to scan up to; fetched with `eth_blockNumber` when absent.
    pub head: Option<u64>,
    /// Overrides the cached/derived difficulty start block.
    pub difficulty_start_block: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub dataset: MintDataset,
    pub tip: u64,
    pub previous_challenge: Option<B256>,
    pub difficulty_start_block: u64,
    pub tally: MinerTally,
    pub new_events: usize,
    /// Ranges this run could not fetch; they are retried first by the next run.
    pub failed_windows: Vec<(u64, u64)>,
    pub snapshot_error: Option<String>,
}

struct ScanState {
    dataset: MintDataset,
    tip: u64,
    previous_challenge: Option<B256>,
    difficulty_start_block: Option<u64>,
    /// Block ranges below `tip` whose logs were never fetched, oldest first.
    failed_windows: Vec<(u64, u64)>,
}

pub fn decode_mint_log(log: &RawLog, topic: B256) -> Result<MintEvent> {
    if log.topics.first() != Some(&topic) {
        return Err(AggregatorError::decode("log is not a Mint event"));
    }
    let miner_topic = log
        .topics
        .get(1)
        .ok_or_else(|| AggregatorError::decode("Mint log without indexed miner"))?;
    let miner = Address::from_slice(&miner_topic.as_slice()[12..]);
    let data = log.data.as_ref();
    if data.len() < 96 {
        return Err(AggregatorError::decode(format!(
            "Mint data is {} bytes, expected 96",
            data.len()
        )));
    }
    let reward = U256::from_be_slice(&data[0..32]);
    let epoch_count = u64::try_from(U256::from_be_slice(&data[32..64]))
        .map_err(|_| AggregatorError::decode("Mint epochCount overflows u64"))?;
    let block = log
        .block()
        .ok_or_else(|| AggregatorError::decode("Mint log without block number"))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| AggregatorError::decode("Mint log without transaction hash"))?;
    Ok(MintEvent {
        block,
        tx_hash,
        miner,
        reward: wad_to_f64(reward),
        epoch_count,
    })
}

fn mint_challenge(log: &RawLog) -> Option<B256> {
    let data = log.data.as_ref();
    (data.len() >= 96).then(|| B256::from_slice(&data[64..96]))
}

pub struct MintScanner {
    rpc: Arc<RpcTransport>,
    cache: CacheDb,
    snapshots: Option<Arc<dyn SnapshotFetcher>>,
    options: ScanOptions,
    supervisor: Arc<ScanSupervisor>,
    progress: watch::Sender<ScanProgress>,
}

impl MintScanner {
    pub fn new(
        rpc: Arc<RpcTransport>,
        cache: CacheDb,
        snapshots: Option<Arc<dyn SnapshotFetcher>>,
        options: ScanOptions,
    ) -> Self {
        let (progress, _) = watch::channel(ScanProgress::default());
        Self {
            rpc,
            cache,
            snapshots,
            options,
            supervisor: Arc::new(ScanSupervisor::default()),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> ScanProgress {
        *self.progress.borrow()
    }

    pub fn supervisor(&self) -> &ScanSupervisor {
        &self.supervisor
    }

    /// Share replace-and-cancel state with another scanner over the same cache.
    pub fn with_supervisor(mut self, supervisor: Arc<ScanSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn shared_supervisor(&self) -> Arc<ScanSupervisor> {
        self.supervisor.clone()
    }

    pub fn set_snapshot_fetcher(&mut self, snapshots: Option<Arc<dyn SnapshotFetcher>>) {
        self.snapshots = snapshots;
    }

    fn set_phase(&self, phase: ScanPhase) {
        self.progress.send_modify(|p| p.phase = phase);
    }

    /// Cached dataset, tip, challenge and difficulty start. An unreadable dataset resets all four.
    pub fn load_cached(&self) -> (MintDataset, u64, Option<B256>, Option<u64>) {
        let Some(raw) = self
            .cache
            .read_json::<Vec<Value>>(&CacheKey::fixed(CACHE_KEY_MINED_BLOCKS))
        else {
            return (MintDataset::default(), 0, None, None);
        };
        let dataset = MintDataset::from_json_entries(&raw);
        let tip = self
            .cache
            .read_u64(&CacheKey::fixed(CACHE_KEY_MINED_BLOCKS_TIP))
            .unwrap_or(0)
            .max(dataset.tip().unwrap_or(0));
        let challenge = self
            .cache
            .read_json::<String>(&CacheKey::fixed(CACHE_KEY_PREVIOUS_CHALLENGE))
            .as_deref()
            .and_then(b256_from_hex);
        let difficulty_start = self
            .cache
            .read_u64(&CacheKey::fixed(CACHE_KEY_DIFFICULTY_START));
        (dataset, tip, challenge, difficulty_start)
    }

    /// Ranges a previous run gave up on; empty once the cached tip is reset.
    pub fn cached_failed_windows(&self, tip: u64) -> Vec<(u64, u64)> {
        if tip == 0 {
            return Vec::new();
        }
        let mut windows = self
            .cache
            .read_json::<Vec<(u64, u64)>>(&CacheKey::fixed(CACHE_KEY_FAILED_WINDOWS))
            .unwrap_or_default();
        windows.retain(|(from, to)| from <= to && *to <= tip);
        windows.sort_unstable();
        windows.dedup();
        windows
    }

    fn persist(&self, state: &ScanState) -> Result<()> {
        self.cache
            .write_json(&CacheKey::fixed(CACHE_KEY_MINED_BLOCKS), &state.dataset)?;
        self.cache
            .write_u64(&CacheKey::fixed(CACHE_KEY_MINED_BLOCKS_TIP), state.tip)?;
        match state.previous_challenge {
            Some(challenge) => self.cache.write_json(
                &CacheKey::fixed(CACHE_KEY_PREVIOUS_CHALLENGE),
                &format!("{challenge:#x}"),
            )?,
            None => self
                .cache
                .delete(&CacheKey::fixed(CACHE_KEY_PREVIOUS_CHALLENGE))?,
        }
        if let Some(block) = state.difficulty_start_block {
            self.cache
                .write_u64(&CacheKey::fixed(CACHE_KEY_DIFFICULTY_START), block)?;
        }
        if state.failed_windows.is_empty() {
            self.cache
                .delete(&CacheKey::fixed(CACHE_KEY_FAILED_WINDOWS))?;
        } else {
            self.cache.write_json(
                &CacheKey::fixed(CACHE_KEY_FAILED_WINDOWS),
                &state.failed_windows,
            )?;
        }
        Ok(())
    }

    async fn fetch_window(&self, filter: &LogFilter) -> Result<Option<Vec<RawLog>>> {
        let retries = self.options.window_retries.max(1);
        for attempt in 1..=retries {
            match self.rpc.get_logs(filter).await {
                Ok(logs) => return Ok(Some(logs)),
                Err(AggregatorError::Fatal(message)) => return Err(AggregatorError::Fatal(message)),
                Err(err) => {
                    tracing::warn!(
                        "[SCAN] window [{}, {}] attempt {}/{} failed: {}",
                        filter.from_block,
                        filter.to_block,
                        attempt,
                        retries,
                        err
                    );
                    if attempt < retries {
                        sleep(self.options.window_retry_base.saturating_mul(attempt)).await;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Extend the mined-block dataset from the cached tip to the chain head.
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanOutcome> {
        let ticket = self.supervisor.begin();
        let _running = self.supervisor.running.lock().await;
        if ticket.is_cancelled() {
            return Err(AggregatorError::Cancelled);
        }
        self.progress.send_replace(ScanProgress::default());

        self.set_phase(ScanPhase::LoadCache);
        let (dataset, tip, previous_challenge, cached_difficulty_start) = self.load_cached();
        let mut state = ScanState {
            dataset,
            tip,
            previous_challenge,
            difficulty_start_block: cached_difficulty_start,
            failed_windows: self.cached_failed_windows(tip),
        };
        tracing::info!(
            "[SCAN] cache: {} entries, tip {}, {} window(s) to retry",
            state.dataset.len(),
            state.tip,
            state.failed_windows.len()
        );

        self.set_phase(ScanPhase::FetchReferenceSnapshot);
        let mut snapshot_error = None;
        let snapshot = match self.snapshots.as_ref() {
            Some(fetcher) => match fetcher.fetch_mined_blocks().await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    tracing::warn!("[SCAN] reference snapshot unavailable, using local cache: {}", err);
                    snapshot_error = Some(err.to_string());
                    None
                }
            },
            None => None,
        };

        self.set_phase(ScanPhase::PickNewerSource);
        if let Some(snapshot) = snapshot {
            if snapshot.latest_block_number > state.tip {
                tracing::info!(
                    "[SCAN] adopting snapshot (tip {} > cached {})",
                    snapshot.latest_block_number,
                    state.tip
                );
                state.dataset = snapshot.dataset();
                state.tip = snapshot.latest_block_number;
                state.previous_challenge = snapshot
                    .previous_challenge()
                    .or_else(|| state.dataset.latest_challenge());
                if snapshot.difficulty_start_block.is_some() {
                    state.difficulty_start_block = snapshot.difficulty_start_block;
                }
                // Every stored gap lies below the old tip, so the snapshot covers it.
                state.failed_windows.clear();
                self.persist(&state)?;
            }
        }

        if let Some(block) = request.difficulty_start_block {
            state.difficulty_start_block = Some(block);
        }
        if state.difficulty_start_block.is_none() {
            state.difficulty_start_block = state.dataset.markers().next().map(|m| m.block);
        }
        let difficulty_start = state.difficulty_start_block.unwrap_or(0);

        self.set_phase(ScanPhase::Scan);
        let topic = mint_topic();
        let mut failed_windows = Vec::new();
        let mut new_events = self
            .backfill_failed_windows(&mut state, &ticket, topic, &mut failed_windows)
            .await?;
        let mut tally = MinerTally::replay(&state.dataset, difficulty_start);

        let head = match request.head {
            Some(head) => head,
            None => self.rpc.get_block_number().await?,
        };

        let window = self.options.window_blocks.max(1);
        let first_block = state
            .tip
            .saturating_add(1)
            .max(self.options.genesis_block);
        let windows_total = if head >= first_block {
            (head - first_block) / window + 1
        } else {
            0
        };
        self.progress.send_modify(|p| {
            p.windows_total = windows_total;
            p.head = head;
            p.current_block = first_block;
        });

        let mut fresh: Vec<MintEntry> = Vec::new();
        let mut from = first_block;
        let mut windows_done = 0u64;
        while from <= head {
            if ticket.is_cancelled() {
                tracing::info!("[SCAN] superseded at block {}; saving progress", from);
                self.merge_and_persist(&mut state, std::mem::take(&mut fresh))?;
                return Err(AggregatorError::Cancelled);
            }

            let to = from.saturating_add(window - 1).min(head);
            let filter = LogFilter {
                from_block: from,
                to_block: to,
                address: self.options.contract,
                topics: vec![topic],
            };
            match self.fetch_window(&filter).await? {
                Some(logs) => {
                    for log in &logs {
                        let event = match decode_mint_log(log, topic) {
                            Ok(event) => event,
                            Err(err) => {
                                tracing::warn!("[SCAN] skipping log in block {:?}: {}", log.block(), err);
                                continue;
                            }
                        };
                        let challenge = mint_challenge(log);
                        tally.record(&event, event.block >= difficulty_start);
                        fresh.push(MintEntry::Event(event.clone()));
                        new_events += 1;

                        if let Some(challenge) = challenge {
                            match state.previous_challenge {
                                Some(previous) if previous != challenge => {
                                    fresh.push(MintEntry::Marker(ChallengeMarker {
                                        block: event.block,
                                        tx_hash: event.tx_hash,
                                        challenge,
                                        epoch_count: event.epoch_count,
                                    }));
                                    state.previous_challenge = Some(challenge);
                                }
                                Some(_) => {}
                                None => state.previous_challenge = Some(challenge),
                            }
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        "[SCAN] giving up on window [{}, {}] after {} attempts",
                        from,
                        to,
                        self.options.window_retries
                    );
                    failed_windows.push((from, to));
                    state.failed_windows.push((from, to));
                }
            }

            state.tip = to;
            windows_done += 1;
            self.progress.send_modify(|p| {
                p.windows_done = windows_done;
                p.current_block = to;
            });
            tracing::info!("[SCAN] {}", self.progress());

            from = to.saturating_add(1);
            if from <= head {
                sleep(self.options.inter_window_delay).await;
            }
        }

        if self.merge_and_persist(&mut state, fresh)? > 0 {
            tally = MinerTally::replay(&state.dataset, difficulty_start);
        }
        self.set_phase(ScanPhase::Done);
        tracing::info!(
            "[SCAN] done: {} new events, {} entries, tip {}",
            new_events,
            state.dataset.len(),
            state.tip
        );

        Ok(ScanOutcome {
            dataset: state.dataset,
            tip: state.tip,
            previous_challenge: state.previous_challenge,
            difficulty_start_block: difficulty_start,
            tally,
            new_events,
            failed_windows,
            snapshot_error,
        })
    }

    /// Re-fetch the ranges earlier runs gave up on and merge what they hold.
    async fn backfill_failed_windows(
        &self,
        state: &mut ScanState,
        ticket: &ScanTicket,
        topic: B256,
        still_failed: &mut Vec<(u64, u64)>,
    ) -> Result<usize> {
        let pending = std::mem::take(&mut state.failed_windows);
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!("[SCAN] retrying {} window(s) left from earlier runs", pending.len());
        let newest_event = state.dataset.events().next().map(|e| e.block);
        let mut recovered = 0usize;
        for (idx, &(from, to)) in pending.iter().enumerate() {
            if ticket.is_cancelled() {
                state.failed_windows.extend_from_slice(&pending[idx..]);
                state.failed_windows.sort_unstable();
                self.persist(state)?;
                return Err(AggregatorError::Cancelled);
            }
            let filter = LogFilter {
                from_block: from,
                to_block: to,
                address: self.options.contract,
                topics: vec![topic],
            };
            let Some(logs) = self.fetch_window(&filter).await? else {
                tracing::warn!("[SCAN] window [{}, {}] still unavailable", from, to);
                state.failed_windows.push((from, to));
                still_failed.push((from, to));
                continue;
            };

            let mut running = state.dataset.challenge_before(from);
            let mut gap = Vec::new();
            for log in &logs {
                let event = match decode_mint_log(log, topic) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!("[SCAN] skipping log in block {:?}: {}", log.block(), err);
                        continue;
                    }
                };
                let challenge = mint_challenge(log);
                gap.push(MintEntry::Event(event.clone()));
                if let Some(challenge) = challenge {
                    if running.is_some_and(|previous| previous != challenge) {
                        gap.push(MintEntry::Marker(ChallengeMarker {
                            block: event.block,
                            tx_hash: event.tx_hash,
                            challenge,
                            epoch_count: event.epoch_count,
                        }));
                    }
                    running = Some(challenge);
                }
            }
            let gap_newest = gap.last().map(MintEntry::block);
            if gap_newest > newest_event && running.is_some() {
                state.previous_challenge = running;
            }
            let events = gap.iter().filter(|entry| !entry.is_marker()).count();
            tracing::info!("[SCAN] recovered {} event(s) in [{}, {}]", events, from, to);
            recovered += events;
            state.dataset.merge_backfill(gap);
        }
        state.dataset.dedupe();
        self.persist(state)?;
        Ok(recovered)
    }

    fn merge_and_persist(&self, state: &mut ScanState, fresh: Vec<MintEntry>) -> Result<usize> {
        self.set_phase(ScanPhase::Merge);
        state.dataset.prepend_oldest_first(fresh);
        let removed = state.dataset.dedupe();
        if removed > 0 {
            tracing::debug!("[SCAN] dropped {} duplicate transaction(s)", removed);
        }
        self.set_phase(ScanPhase::Persist);
        self.persist(state)?;
        Ok(removed)
    }
}
