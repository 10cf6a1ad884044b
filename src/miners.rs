//! Per-miner statistics over the mint dataset, with known-pool alias collapsing.

use crate::error::{AggregatorError, Result};
use crate::scanner::{MintDataset, MintEvent};
use alloy::primitives::{keccak256, Address};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownMiner {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub colour: String,
}

#[derive(Debug, Clone, Deserialize)]
struct KnownMinerRecord {
    address: Address,
    #[serde(flatten)]
    miner: KnownMiner,
}

/// Address -> pool identity. Addresses sharing a display name are aliases of one pool.
#[derive(Debug, Clone, Default)]
pub struct KnownMinerRegistry {
    entries: HashMap<Address, KnownMiner>,
}

impl KnownMinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        address: Address,
        name: impl Into<String>,
        url: impl Into<String>,
        colour: impl Into<String>,
    ) -> Self {
        self.insert(address, name, url, colour);
        self
    }

    pub fn insert(
        &mut self,
        address: Address,
        name: impl Into<String>,
        url: impl Into<String>,
        colour: impl Into<String>,
    ) {
        self.entries.insert(
            address,
            KnownMiner {
                name: name.into(),
                url: url.into(),
                colour: colour.into(),
            },
        );
    }

    /// Labels for the deployment's own token and hook contracts.
    pub fn for_deployment(token: Address, hook: Address) -> Self {
        let mut registry = Self::new();
        if token != Address::ZERO {
            registry.insert(token, "BWORK token", "", "");
        }
        if hook != Address::ZERO {
            registry.insert(hook, "BWORK hook", "", "");
        }
        registry
    }

    /// Entries of `overrides` replace entries for the same address.
    pub fn merge(&mut self, overrides: KnownMinerRegistry) {
        self.entries.extend(overrides.entries);
    }

    /// `[{"address": "0x..", "name": "..", "url": "..", "colour": "#.."}]`
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let records: Vec<KnownMinerRecord> = serde_json::from_str(raw)?;
        let mut registry = Self::new();
        for record in records {
            registry.entries.insert(record.address, record.miner);
        }
        Ok(registry)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AggregatorError::fatal(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn lookup(&self, address: &Address) -> Option<&KnownMiner> {
        self.entries.get(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn colour_for(&self, address: &Address) -> String {
        self.lookup(address)
            .map(|m| m.colour.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| miner_colour(address))
    }
}

/// Deterministic `#rrggbb` for an address without a registry colour.
pub fn miner_colour(address: &Address) -> String {
    let digest = keccak256(address.as_slice());
    format!("#{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2])
}

/// Epochs credited to one mint given the previous cumulative count.
///
/// The first event credits its whole count; a decreasing counter (reset at a
/// difficulty roll-over) credits one epoch.
pub fn epochs_mined(previous: Option<u64>, cumulative: u64) -> u64 {
    match previous {
        None => cumulative,
        Some(prev) if cumulative >= prev => cumulative - prev,
        Some(prev) => {
            tracing::debug!(
                "[MINERS] epoch count went backwards ({} -> {}); crediting 1",
                prev,
                cumulative
            );
            1
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MinerCounters {
    pub epochs_mined: u64,
    pub tx_count: u64,
    pub tokens_mined: f64,
}

impl MinerCounters {
    fn absorb(&mut self, other: &MinerCounters) {
        self.epochs_mined += other.epochs_mined;
        self.tx_count += other.tx_count;
        self.tokens_mined += other.tokens_mined;
    }
}

/// Running per-address counters, all-time and since the difficulty start block.
#[derive(Debug, Clone, Default)]
pub struct MinerTally {
    all_time: BTreeMap<Address, MinerCounters>,
    recent: BTreeMap<Address, MinerCounters>,
    last_epoch_count: Option<u64>,
}

impl MinerTally {
    /// Fold every event of `dataset`, oldest first.
    pub fn replay(dataset: &MintDataset, difficulty_start_block: u64) -> Self {
        let mut tally = Self::default();
        for event in dataset.events().rev() {
            tally.record(event, event.block >= difficulty_start_block);
        }
        tally
    }

    /// Account one mint; returns the epochs credited to it.
    pub fn record(&mut self, event: &MintEvent, recent: bool) -> u64 {
        let epochs = epochs_mined(self.last_epoch_count, event.epoch_count);
        self.last_epoch_count = Some(event.epoch_count);
        let delta = MinerCounters {
            epochs_mined: epochs,
            tx_count: 1,
            tokens_mined: event.reward,
        };
        self.all_time.entry(event.miner).or_default().absorb(&delta);
        if recent {
            self.recent.entry(event.miner).or_default().absorb(&delta);
        }
        epochs
    }

    pub fn all_time(&self) -> &BTreeMap<Address, MinerCounters> {
        &self.all_time
    }

    pub fn recent(&self) -> &BTreeMap<Address, MinerCounters> {
        &self.recent
    }

    pub fn finish(&self, registry: &KnownMinerRegistry) -> MinerAggregates {
        MinerAggregates {
            all_time: rank(collapse_aliases(&self.all_time, registry), registry),
            recent: rank(collapse_aliases(&self.recent, registry), registry),
        }
    }
}

/// Fold every alias of a known pool into the lexicographically first address.
pub fn collapse_aliases(
    counters: &BTreeMap<Address, MinerCounters>,
    registry: &KnownMinerRegistry,
) -> BTreeMap<Address, MinerCounters> {
    let mut canonical_by_name: HashMap<&str, Address> = HashMap::new();
    for address in counters.keys() {
        if let Some(known) = registry.lookup(address) {
            // BTreeMap iterates in address order, so the first alias seen is the smallest.
            canonical_by_name.entry(known.name.as_str()).or_insert(*address);
        }
    }

    let mut out = BTreeMap::new();
    for (address, counts) in counters {
        let target = registry
            .lookup(address)
            .and_then(|known| canonical_by_name.get(known.name.as_str()).copied())
            .unwrap_or(*address);
        out.entry(target)
            .or_insert_with(MinerCounters::default)
            .absorb(counts);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinerAggregate {
    pub address: Address,
    pub name: Option<String>,
    pub url: Option<String>,
    pub colour: String,
    pub epochs_mined: u64,
    pub tx_count: u64,
    pub tokens_mined: f64,
    /// Share of the window's epochs in `[0, 1]`.
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MinerAggregates {
    pub all_time: Vec<MinerAggregate>,
    pub recent: Vec<MinerAggregate>,
}

fn rank(
    counters: BTreeMap<Address, MinerCounters>,
    registry: &KnownMinerRegistry,
) -> Vec<MinerAggregate> {
    let total: u64 = counters.values().map(|c| c.epochs_mined).sum();
    let mut rows: Vec<MinerAggregate> = counters
        .into_iter()
        .map(|(address, c)| {
            let known = registry.lookup(&address);
            MinerAggregate {
                address,
                name: known.map(|k| k.name.clone()),
                url: known.map(|k| k.url.clone()).filter(|u| !u.is_empty()),
                colour: registry.colour_for(&address),
                epochs_mined: c.epochs_mined,
                tx_count: c.tx_count,
                tokens_mined: c.tokens_mined,
                percent: if total == 0 {
                    0.0
                } else {
                    c.epochs_mined as f64 / total as f64
                },
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.epochs_mined
            .cmp(&a.epochs_mined)
            .then_with(|| a.address.cmp(&b.address))
    });
    rows
}

/// All-time and recent rich lists for `dataset`.
pub fn compute_miner_aggregates(
    dataset: &MintDataset,
    difficulty_start_block: u64,
    registry: &KnownMinerRegistry,
) -> MinerAggregates {
    MinerTally::replay(dataset, difficulty_start_block).finish(registry)
}
