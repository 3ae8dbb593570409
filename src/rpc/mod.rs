use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use async_trait::async_trait;
use jsonrpsee::core::ClientError;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::{Deserialize, Serialize, Serializer};

use crate::retry::RetryPolicy;

/// Read-only view of a node's event logs.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64>;

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>>;
}

#[derive(Clone)]
pub struct RpcClient {
    inner: HttpClient,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RpcClient {
    pub fn new(endpoint: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        assert!(!endpoint.is_empty(), "RPC endpoint must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(endpoint)
            .with_context(|| format!("Failed to build RPC client for {endpoint}"))?;

        Ok(Self {
            inner: client,
            timeout,
            retry,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch_chain_id(&self) -> Result<u64> {
        let raw: String = self
            .retry
            .run("eth_chainId", is_retryable, move || {
                self.inner.request("eth_chainId", rpc_params![])
            })
            .await
            .context("RPC call eth_chainId failed")?;
        parse_quantity(&raw)
    }

    pub async fn fetch_latest_block_number(&self) -> Result<u64> {
        let raw: String = self
            .retry
            .run("eth_blockNumber", is_retryable, move || {
                self.inner.request("eth_blockNumber", rpc_params![])
            })
            .await
            .context("RPC call eth_blockNumber failed")?;
        let block_number = parse_quantity(&raw)?;
        ensure_sane_height(block_number)?;
        Ok(block_number)
    }

    pub async fn fetch_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>> {
        let logs: Vec<RpcLog> = self
            .retry
            .run("eth_getLogs", is_retryable, move || {
                self.inner.request("eth_getLogs", rpc_params![filter])
            })
            .await
            .with_context(|| {
                format!(
                    "RPC call eth_getLogs failed for blocks {}..{}",
                    filter.from_block, filter.to_block
                )
            })?;
        Ok(logs)
    }
}

#[async_trait]
impl LogSource for RpcClient {
    async fn latest_block_number(&self) -> Result<u64> {
        self.fetch_latest_block_number().await
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>> {
        self.fetch_logs(filter).await
    }
}

/// Error responses from the node are final; transport trouble is not.
fn is_retryable(err: &ClientError) -> bool {
    !matches!(err, ClientError::Call(_) | ClientError::ParseError(_))
}

const MAX_BLOCK_HEIGHT: u64 = 1_000_000_000_000;

fn ensure_sane_height(block_number: u64) -> Result<()> {
    ensure!(
        block_number < MAX_BLOCK_HEIGHT,
        "Node reported implausible block height {block_number}"
    );
    Ok(())
}

pub fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Quantity {raw} is missing 0x prefix"))?;
    if digits.is_empty() {
        return Err(anyhow!("Quantity {raw} has no digits"));
    }
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid hex quantity {raw}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl std::fmt::Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockTag::Number(number) => write!(f, "{number:#x}"),
            BlockTag::Latest => f.write_str("latest"),
        }
    }
}

impl Serialize for BlockTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// `eth_getLogs` filter object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub address: String,
    pub topics: Vec<Option<String>>,
    pub from_block: BlockTag,
    pub to_block: BlockTag,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}
