//! Read-only JSON-RPC transport.
//!
//! Every outbound node call goes through [`RpcTransport`], which owns the retry policy:
//! rate-limit and transient failures are retried with `base * 2^attempt + jitter`,
//! anything else is surfaced immediately. The wire itself sits behind [`RpcBackend`] so
//! the sampler and scanner can be driven by a scripted backend in tests.

use crate::error::{AggregatorError, Result};
use crate::utils::constants::{
    RPC_DEFAULT_JITTER_MS, RPC_DEFAULT_MAX_ATTEMPTS, RPC_DEFAULT_RETRY_BASE_MS,
};
use crate::utils::hex::parse_word;
use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::Http;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

const RPC_ERR_MAX_LEN: usize = 260;
const RPC_CALL_TIMEOUT_MS: u64 = 20_000;

pub type HttpProvider = RootProvider<Http<Client>>;

/// One JSON-RPC round-trip, no retries. Errors are the provider's message text.
#[async_trait]
pub trait RpcBackend: Send + Sync {
    async fn request(&self, method: &'static str, params: Value) -> std::result::Result<Value, String>;

    fn endpoint(&self) -> &str {
        "<unnamed>"
    }
}

pub struct HttpRpcBackend {
    provider: HttpProvider,
    url: String,
}

impl HttpRpcBackend {
    pub fn connect(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let parsed = trimmed.parse::<reqwest::Url>().map_err(|err| {
            AggregatorError::fatal(format!("invalid RPC url `{trimmed}`: {err}"))
        })?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(parsed),
            url: trimmed.to_string(),
        })
    }
}

#[async_trait]
impl RpcBackend for HttpRpcBackend {
    async fn request(&self, method: &'static str, params: Value) -> std::result::Result<Value, String> {
        self.provider
            .raw_request::<Value, Value>(Cow::Borrowed(method), params)
            .await
            .map_err(|err| err.to_string())
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited,
    Transient,
    Protocol,
    Fatal,
}

pub fn is_rate_limited_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("-32005")
        || msg.contains("429")
        || msg.contains("rate limit")
        || msg.contains("rate-limit")
        || msg.contains("ratelimit")
        || msg.contains("too many requests")
        || msg.contains("compute units per second")
        || msg.contains("throughput")
}

fn is_protocol_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    [
        "method not found",
        "-32601",
        "invalid params",
        "-32602",
        "execution reverted",
        "parse error",
        "-32700",
        "unknown variant",
        "did not match any variant",
        "deserialization error",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

fn is_fatal_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("missing trie node")
        || msg.contains("invalid url")
        || msg.contains("unauthorized")
}

pub fn classify_rpc_error(message: &str) -> FailureClass {
    if is_rate_limited_rpc_error(message) {
        FailureClass::RateLimited
    } else if is_protocol_rpc_error(message) {
        FailureClass::Protocol
    } else if is_fatal_rpc_error(message) {
        FailureClass::Fatal
    } else {
        FailureClass::Transient
    }
}

fn compact_rpc_error_message(message: &str) -> String {
    crate::utils::error::compact_error_message(message, RPC_ERR_MAX_LEN)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_ms: u64,
    pub jitter_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RPC_DEFAULT_MAX_ATTEMPTS,
            base_ms: RPC_DEFAULT_RETRY_BASE_MS,
            jitter_ms: RPC_DEFAULT_JITTER_MS,
            call_timeout_ms: RPC_CALL_TIMEOUT_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1` (zero-based), jitter excluded.
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let shift = attempt.min(16) as u32;
        self.base_ms.saturating_mul(1u64 << shift)
    }

    fn backoff_with_jitter(&self, attempt: usize) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.backoff_ms(attempt).saturating_add(jitter))
    }
}

#[derive(Debug, Default)]
pub struct RpcStats {
    calls: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RpcStatsSnapshot {
    pub calls: u64,
    pub retries: u64,
    pub rate_limited: u64,
}

impl RpcStats {
    pub fn snapshot(&self) -> RpcStatsSnapshot {
        RpcStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// `eth_getLogs` filter over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Address,
    pub topics: Vec<B256>,
}

impl LogFilter {
    fn to_params(&self) -> Value {
        json!([{
            "fromBlock": block_tag(self.from_block),
            "toBlock": block_tag(self.to_block),
            "address": self.address,
            "topics": self.topics,
        }])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub log_index: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn block(&self) -> Option<u64> {
        self.block_number.map(|n| n.to::<u64>())
    }
}

pub fn block_tag(block_number: u64) -> String {
    format!("0x{block_number:x}")
}

fn parse_quantity(value: &Value, context: &str) -> Result<u64> {
    let raw = value
        .as_str()
        .ok_or_else(|| AggregatorError::decode(format!("{context}: expected hex string, got {value}")))?;
    let parsed = parse_word(raw)
        .ok_or_else(|| AggregatorError::decode(format!("{context}: invalid quantity `{raw}`")))?;
    u64::try_from(parsed)
        .map_err(|_| AggregatorError::decode(format!("{context}: quantity `{raw}` overflows u64")))
}

pub struct RpcTransport {
    backend: Arc<dyn RpcBackend>,
    policy: RetryPolicy,
    stats: RpcStats,
}

impl RpcTransport {
    pub fn new(backend: Arc<dyn RpcBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            stats: RpcStats::default(),
        }
    }

    pub fn connect_http(url: &str, policy: RetryPolicy) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpRpcBackend::connect(url)?), policy))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn endpoint(&self) -> &str {
        self.backend.endpoint()
    }

    pub fn stats(&self) -> RpcStatsSnapshot {
        self.stats.snapshot()
    }

    /// Issue `method` with the transport's retry policy applied.
    pub async fn request(&self, method: &'static str, params: Value) -> Result<Value> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            self.stats.calls.fetch_add(1, Ordering::Relaxed);
            let outcome = timeout(
                Duration::from_millis(self.policy.call_timeout_ms),
                self.backend.request(method, params.clone()),
            )
            .await;

            let message = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(message)) => message,
                Err(_) => format!("timed out after {}ms", self.policy.call_timeout_ms),
            };

            let class = classify_rpc_error(&message);
            let compact = compact_rpc_error_message(&message);
            if class == FailureClass::RateLimited {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            match class {
                FailureClass::Protocol => {
                    return Err(AggregatorError::decode(format!("{method}: {compact}")));
                }
                FailureClass::Fatal => {
                    return Err(AggregatorError::fatal(format!("{method}: {compact}")));
                }
                FailureClass::RateLimited | FailureClass::Transient => {}
            }

            attempt += 1;
            if attempt >= attempts {
                tracing::warn!(
                    "[RPC] {} exhausted {} attempt(s) against {}: {}",
                    method,
                    attempts,
                    self.backend.endpoint(),
                    compact
                );
                let message = format!("{method}: {compact}");
                return Err(if class == FailureClass::RateLimited {
                    AggregatorError::RateLimited { attempts, message }
                } else {
                    AggregatorError::NetworkTransient { attempts, message }
                });
            }

            let delay = self.policy.backoff_with_jitter(attempt - 1);
            tracing::debug!(
                "[RPC] {} attempt {}/{} failed ({:?}); retrying in {}ms: {}",
                method,
                attempt,
                attempts,
                class,
                delay.as_millis(),
                compact
            );
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            sleep(delay).await;
        }
    }

    pub async fn get_block_number(&self) -> Result<u64> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&value, "eth_blockNumber")
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let value = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&value, "eth_chainId")
    }

    /// Storage word at `block`. `Ok(None)` means the node answered with an empty `0x`.
    pub async fn get_storage_at(&self, address: Address, slot: U256, block: u64) -> Result<Option<U256>> {
        let value = self
            .request(
                "eth_getStorageAt",
                json!([address, format!("0x{slot:x}"), block_tag(block)]),
            )
            .await?;
        let raw = value.as_str().ok_or_else(|| {
            AggregatorError::decode(format!("eth_getStorageAt: expected hex string, got {value}"))
        })?;
        if crate::utils::hex::clean_hex(raw).is_empty() {
            return Ok(None);
        }
        parse_word(raw)
            .map(Some)
            .ok_or_else(|| AggregatorError::decode(format!("eth_getStorageAt: invalid word `{raw}`")))
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        let value = self.request("eth_getLogs", filter.to_params()).await?;
        let logs: Vec<RawLog> = serde_json::from_value(value)?;
        Ok(logs.into_iter().filter(|log| !log.removed).collect())
    }

    pub async fn call(&self, to: Address, data: Bytes, block: Option<u64>) -> Result<Bytes> {
        let tag = block.map(block_tag).unwrap_or_else(|| "latest".to_string());
        let value = self
            .request("eth_call", json!([{ "to": to, "data": data }, tag]))
            .await?;
        serde_json::from_value::<Bytes>(value).map_err(Into::into)
    }
}
