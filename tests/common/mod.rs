#![allow(dead_code)]

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use bwork_aggregator::storage::cache_db::CacheDb;
use bwork_aggregator::utils::rpc::{RetryPolicy, RpcBackend, RpcTransport};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A unix time exactly at UTC midnight, so sampler end alignment is zero.
pub const MIDNIGHT: u64 = 1_700_006_400;

pub type Handler = dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync;

/// In-memory JSON-RPC node: every request is answered by `handler` and recorded.
pub struct ScriptedRpc {
    handler: Box<Handler>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRpc {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }
}

#[async_trait]
impl RpcBackend for ScriptedRpc {
    async fn request(&self, method: &'static str, params: Value) -> Result<Value, String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((method.to_string(), params.clone()));
        (self.handler)(method, &params)
    }

    fn endpoint(&self) -> &str {
        "scripted://node"
    }
}

pub fn transport(backend: Arc<ScriptedRpc>, base_ms: u64) -> Arc<RpcTransport> {
    Arc::new(RpcTransport::new(
        backend,
        RetryPolicy {
            max_attempts: 5,
            base_ms,
            jitter_ms: 0,
            ..RetryPolicy::default()
        },
    ))
}

pub fn temp_cache(name: &str) -> (CacheDb, PathBuf) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let path = std::env::temp_dir().join(format!(
        "bwork_it_{}_{}_{}.db",
        name,
        std::process::id(),
        nanos
    ));
    let db = CacheDb::open(&path).expect("open cache");
    (db, path)
}

pub fn cleanup(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(path.with_extension("db-wal"));
    let _ = std::fs::remove_file(path.with_extension("db-shm"));
}

pub fn word(value: u64) -> Value {
    json!(format!("0x{:064x}", value))
}

pub fn block_param(params: &Value, index: usize) -> u64 {
    params[index]
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .expect("block tag")
}

pub fn hash(byte: u8) -> B256 {
    B256::from([byte; 32])
}

/// `Mint(address indexed from, uint rewardAmount, uint epochCount, bytes32 newChallengeNumber)`.
pub fn mint_log(
    contract: Address,
    block: u64,
    tx: B256,
    miner: Address,
    reward_tokens: u64,
    epoch_count: u64,
    challenge: B256,
) -> Value {
    let mut miner_topic = [0u8; 32];
    miner_topic[12..].copy_from_slice(miner.as_slice());
    let reward = U256::from(reward_tokens) * U256::from(1_000_000_000_000_000_000u64);
    let mut data = Vec::with_capacity(96);
    data.extend_from_slice(&reward.to_be_bytes::<32>());
    data.extend_from_slice(&U256::from(epoch_count).to_be_bytes::<32>());
    data.extend_from_slice(challenge.as_slice());
    json!({
        "address": contract,
        "topics": [bwork_aggregator::scanner::mint_topic(), B256::from(miner_topic)],
        "data": format!("0x{}", hex::encode(data)),
        "blockNumber": format!("0x{block:x}"),
        "transactionHash": tx,
        "logIndex": "0x0",
        "removed": false,
    })
}

/// Single-shot HTTP responder; returns its base URL.
pub async fn serve_once(status: &'static str, body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}

pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
