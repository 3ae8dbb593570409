use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{Context, Result, ensure};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_RPC_URL: &str = "https://node.shadownet.etherlink.com";
pub const DEFAULT_PINATA_API_URL: &str = "https://api.pinata.cloud";
pub const DEFAULT_GATEWAY_HOST: &str = "gateway.pinata.cloud";
pub const DEFAULT_DONATION_EVENT: &str = "DonationReceived(uint256,address,uint256)";

const DEFAULT_CONFIG_PATH: &str = "config/api.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub chain: ChainConfig,
    pub pinata: PinataConfig,
    pub indexer: IndexerConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let explicit_path = std::env::var("FANDONOR_API_CONFIG").ok();
        let configured_path = explicit_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        ensure!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        ensure!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = with_defaults(Config::builder())?.add_source(
            File::new(&configured_path, FileFormat::Toml).required(explicit_path.is_some()),
        );

        if let Ok(env_override) = std::env::var("FANDONOR_API_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/api.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        let builder = builder
            .set_override_option("chain.rpc_url", non_empty_env("RPC_URL"))?
            .set_override_option("chain.contract_address", non_empty_env("CONTRACT_ADDRESS"))?
            .set_override_option("pinata.jwt", non_empty_env("PINATA_JWT"))?;

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self> {
        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize API configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        ensure!(self.server.port > 0, "Server port must be greater than zero");
        ensure!(
            self.server.max_upload_bytes >= 1024,
            "Upload limit must be at least 1 KiB"
        );
        ensure!(!self.chain.rpc_url.is_empty(), "RPC URL must be specified");
        ensure!(
            !self.chain.donation_event.is_empty(),
            "Donation event signature must be specified"
        );
        if let Some(range) = self.chain.max_log_block_range {
            ensure!(range > 0, "max_log_block_range must be positive");
        }
        // An empty override is the same as no override.
        if self
            .chain
            .contract_address
            .as_deref()
            .is_some_and(|raw| raw.trim().is_empty())
        {
            self.chain.contract_address = None;
        }
        self.chain.contract_address()?;
        if self.pinata.jwt.as_deref().is_some_and(str::is_empty) {
            self.pinata.jwt = None;
        }
        ensure!(
            !self.pinata.gateway_host.is_empty(),
            "Gateway host must be specified"
        );
        ensure!(
            !self.pinata.gateway_host.contains('/'),
            "Gateway host must be a bare host name"
        );
        self.indexer.ensure_bounds()?;
        self.retry.ensure_bounds()?;
        Ok(())
    }
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("server.port", 3000)?
        .set_default("server.max_upload_bytes", 25 * 1024 * 1024)?
        .set_default("chain.rpc_url", DEFAULT_RPC_URL)?
        .set_default("chain.chain_id", 127_823)?
        .set_default("chain.network_name", "Etherlink Shadownet")?
        .set_default("chain.currency_name", "XTZ")?
        .set_default("chain.currency_symbol", "XTZ")?
        .set_default("chain.currency_decimals", 18)?
        .set_default("chain.donation_event", DEFAULT_DONATION_EVENT)?
        .set_default("pinata.api_base_url", DEFAULT_PINATA_API_URL)?
        .set_default("pinata.gateway_host", DEFAULT_GATEWAY_HOST)?
        .set_default("indexer.enabled", false)?
        .set_default("indexer.poll_interval_ms", 5_000)?
        .set_default("indexer.block_span", 10_000)?
        .set_default("indexer.stale_after_polls", 5)?
        .set_default("cache.donations_max_capacity", 10_000)?
        .set_default("cache.donations_ttl_seconds", 10)?
        .set_default("cache.pinned_files_max_capacity", 1_000)?
        .set_default("cache.pinned_files_ttl_seconds", 3_600)?
        .set_default("retry.max_attempts", 3)?
        .set_default("retry.initial_backoff_ms", 200)?
        .set_default("retry.max_backoff_ms", 2_000)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(self.port != 0, "HTTP port cannot be zero");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub network_name: String,
    pub currency_name: String,
    pub currency_symbol: String,
    pub currency_decimals: u8,
    pub request_timeout_ms: Option<u64>,
    pub contract_address: Option<String>,
    pub donation_event: String,
    /// Upper bound on the block span of a single `eth_getLogs` call.
    /// Unset scans genesis to head in one request.
    pub max_log_block_range: Option<u64>,
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(10_000);
        assert!(millis >= 100, "RPC timeout must be at least 100ms");
        assert!(millis <= 120_000, "RPC timeout cannot exceed two minutes");
        Duration::from_millis(millis)
    }

    pub fn contract_address(&self) -> Result<Option<Address>> {
        self.contract_address
            .as_deref()
            .map(|raw| {
                raw.trim()
                    .parse::<Address>()
                    .with_context(|| format!("Invalid contract address {raw}"))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinataConfig {
    pub jwt: Option<String>,
    pub api_base_url: String,
    pub gateway_host: String,
    pub request_timeout_ms: Option<u64>,
}

impl PinataConfig {
    pub fn request_timeout(&self) -> Duration {
        let millis = self.request_timeout_ms.unwrap_or(60_000);
        assert!(millis >= 100, "Pinning timeout must be at least 100ms");
        assert!(millis <= 600_000, "Pinning timeout cannot exceed ten minutes");
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub block_span: u64,
    /// Missed poll intervals after which the index is no longer served.
    pub stale_after_polls: u32,
}

impl IndexerConfig {
    pub fn poll_interval(&self) -> Duration {
        assert!(
            self.poll_interval_ms >= 100,
            "Poll interval must be >= 100ms"
        );
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn staleness_limit(&self) -> Duration {
        self.poll_interval().saturating_mul(self.stale_after_polls)
    }

    pub fn ensure_bounds(&self) -> Result<()> {
        ensure!(
            (100..=600_000).contains(&self.poll_interval_ms),
            "Poll interval must be between 100ms and 10 minutes"
        );
        ensure!(self.block_span > 0, "Block span must be positive");
        ensure!(
            self.stale_after_polls >= 2,
            "stale_after_polls must be at least 2"
        );
        ensure!(
            self.block_span <= 1_000_000,
            "Block span exceeds hard limit"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub donations_max_capacity: u64,
    pub donations_ttl_seconds: u64,
    pub pinned_files_max_capacity: u64,
    pub pinned_files_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    fn ensure_bounds(&self) -> Result<()> {
        ensure!(self.max_attempts >= 1, "Retry attempts must be at least 1");
        ensure!(self.max_attempts <= 10, "Retry attempts exceed hard limit");
        ensure!(
            self.initial_backoff_ms <= self.max_backoff_ms,
            "Initial backoff must not exceed max backoff"
        );
        ensure!(
            self.max_backoff_ms <= 60_000,
            "Max backoff cannot exceed 60 seconds"
        );
        Ok(())
    }
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}
