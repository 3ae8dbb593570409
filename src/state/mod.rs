use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use serde::Serialize;

use crate::config::{CacheConfig, ChainConfig};
use crate::donations::DonationScanner;
use crate::indexer::DonationIndex;
use crate::models::donation::DonationRecord;
use crate::pinning::AssetPublisher;
use crate::rpc::LogSource;

#[derive(Clone)]
pub struct AppState {
    pub logs: Arc<dyn LogSource>,
    /// `None` when no contract address is configured.
    pub donations: Option<DonationScanner>,
    pub index: Option<Arc<DonationIndex>>,
    /// `None` when no pinning credential is configured.
    pub publisher: Option<Arc<AssetPublisher>>,
    pub cache: Arc<ApiCache>,
    pub chain: ChainSummary,
    pub rpc_timeout: Duration,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        logs: Arc<dyn LogSource>,
        donations: Option<DonationScanner>,
        publisher: Option<Arc<AssetPublisher>>,
        cache: Arc<ApiCache>,
        chain: ChainSummary,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            logs,
            donations,
            index: None,
            publisher,
            cache,
            chain,
            rpc_timeout,
            start_time: Instant::now(),
        }
    }

    pub fn with_index(mut self, index: Arc<DonationIndex>) -> Self {
        assert!(
            self.donations.is_some(),
            "Donation index requires a contract address"
        );
        self.index = Some(index);
        self
    }
}

/// Static chain description reported by the readiness probe.
#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub chain_id: u64,
    pub name: String,
    pub currency_name: String,
    pub currency_symbol: String,
    pub currency_decimals: u8,
}

impl From<&ChainConfig> for ChainSummary {
    fn from(config: &ChainConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            name: config.network_name.clone(),
            currency_name: config.currency_name.clone(),
            currency_symbol: config.currency_symbol.clone(),
            currency_decimals: config.currency_decimals,
        }
    }
}

pub struct ApiCache {
    /// Donation lists by decimal token id; disabled when the TTL is zero.
    pub donations: Option<Cache<String, Arc<Vec<DonationRecord>>>>,
    /// Pinned file CIDs by SHA-256 of the file bytes.
    pub pinned_files: Cache<String, String>,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        let donations = (config.donations_ttl_seconds > 0).then(|| {
            Cache::builder()
                .max_capacity(config.donations_max_capacity)
                .time_to_live(Duration::from_secs(config.donations_ttl_seconds))
                .build()
        });

        let pinned_files = Cache::builder()
            .max_capacity(config.pinned_files_max_capacity)
            .time_to_live(Duration::from_secs(config.pinned_files_ttl_seconds))
            .time_to_idle(Duration::from_secs(config.pinned_files_ttl_seconds / 2 + 1))
            .build();

        Self {
            donations,
            pinned_files,
        }
    }

    pub fn donation_entries(&self) -> u64 {
        self.donations
            .as_ref()
            .map_or(0, |cache| cache.entry_count())
    }
}
