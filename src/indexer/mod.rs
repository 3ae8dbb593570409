use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use alloy_primitives::U256;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::IndexerConfig;
use crate::donations::{DecodedDonation, DonationScanner, InvalidLogs, block_windows};
use crate::models::donation::DonationRecord;
use crate::rpc::LogSource;

/// In-memory donation history keyed by token id.
#[derive(Default)]
pub struct DonationIndex {
    donations: RwLock<HashMap<U256, Vec<DonationRecord>>>,
    last_indexed_block: AtomicU64,
    total_donations: AtomicU64,
    ready: AtomicBool,
    last_synced_at: RwLock<Option<DateTime<Utc>>>,
    /// Past this age since the last successful sync the index stops answering.
    max_staleness: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub ready: bool,
    pub stale: bool,
    pub last_indexed_block: u64,
    pub tokens: u64,
    pub donations: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl DonationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_staleness(max_staleness: Duration) -> Self {
        Self {
            max_staleness: Some(max_staleness),
            ..Self::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::SeqCst)
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_synced_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_fresh(&self) -> bool {
        let Some(limit) = self.max_staleness else {
            return true;
        };
        match self.last_synced_at() {
            // A clock step backwards reads as fresh.
            Some(synced) => (Utc::now() - synced)
                .to_std()
                .map_or(true, |age| age <= limit),
            None => false,
        }
    }

    /// Caught up and synced recently enough to answer queries.
    pub fn is_serving(&self) -> bool {
        self.is_ready() && self.is_fresh()
    }

    /// Donations for `token_id`, or `None` until the first catch-up finished
    /// and whenever syncing has fallen behind.
    pub fn donations_for(&self, token_id: U256) -> Option<Vec<DonationRecord>> {
        if !self.is_serving() {
            return None;
        }
        let donations = self
            .donations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Some(donations.get(&token_id).cloned().unwrap_or_default())
    }

    fn apply(&self, batch: Vec<DecodedDonation>, through_block: u64) {
        assert!(
            through_block >= self.last_indexed_block.load(AtomicOrdering::SeqCst),
            "Index checkpoint must not regress"
        );
        let added = batch.len() as u64;
        if !batch.is_empty() {
            let mut donations = self
                .donations
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for donation in batch {
                donations
                    .entry(donation.token_id)
                    .or_default()
                    .push(donation.record);
            }
        }
        self.total_donations
            .fetch_add(added, AtomicOrdering::SeqCst);
        self.last_indexed_block
            .store(through_block, AtomicOrdering::SeqCst);
    }

    /// Records a sync that reached the head.
    fn mark_synced(&self) {
        *self
            .last_synced_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        if !self.ready.swap(true, AtomicOrdering::SeqCst) {
            info!(
                "Donation index caught up at block {}",
                self.last_indexed_block.load(AtomicOrdering::SeqCst)
            );
        }
    }

    pub fn status(&self) -> IndexStatus {
        let tokens = self
            .donations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64;
        let ready = self.is_ready();
        IndexStatus {
            ready,
            stale: ready && !self.is_fresh(),
            last_indexed_block: self.last_indexed_block.load(AtomicOrdering::SeqCst),
            tokens,
            donations: self.total_donations.load(AtomicOrdering::SeqCst),
            last_synced_at: self.last_synced_at(),
        }
    }
}

/// Polls the node and appends new `DonationReceived` logs to the index.
pub struct DonationIndexer {
    source: Arc<dyn LogSource>,
    scanner: DonationScanner,
    index: Arc<DonationIndex>,
    config: IndexerConfig,
    span: u64,
    next_block: u64,
}

impl DonationIndexer {
    pub fn new(
        source: Arc<dyn LogSource>,
        scanner: DonationScanner,
        index: Arc<DonationIndex>,
        config: IndexerConfig,
    ) -> Self {
        assert!(config.block_span > 0, "Indexer block span must be positive");
        // Windows never exceed the node's eth_getLogs range cap.
        let span = scanner
            .max_block_range()
            .map_or(config.block_span, |cap| cap.min(config.block_span));
        Self {
            source,
            scanner,
            index,
            config,
            span,
            next_block: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting donation indexer for contract {}",
            self.scanner.contract()
        );
        self.tick_logged().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Indexer shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting indexer loop");
                            break;
                        }
                    }
                }
                _ = sleep(self.config.poll_interval()) => {
                    self.tick_logged().await;
                }
            }
        }

        Ok(())
    }

    async fn tick_logged(&mut self) {
        if let Err(err) = self.sync_once().await {
            warn!(
                next_block = self.next_block,
                "Donation index sync failed, retrying next poll: {err:#}"
            );
        }
    }

    pub async fn sync_once(&mut self) -> Result<()> {
        let head = self.source.latest_block_number().await?;
        if self.next_block > head {
            debug!("Donation index up to date at block {head}");
            self.index.mark_synced();
            return Ok(());
        }

        let span = self.span;
        for (start, end) in block_windows(self.next_block, head, span) {
            let batch = self
                .scanner
                .scan_range(self.source.as_ref(), None, start, end, span, InvalidLogs::Skip)
                .await?;
            if !batch.is_empty() {
                debug!("Indexed {} donations in blocks {start}..={end}", batch.len());
            }
            self.index.apply(batch, end);
            self.next_block = end + 1;
        }

        self.index.mark_synced();
        Ok(())
    }
}
