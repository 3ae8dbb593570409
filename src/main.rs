mod config;
mod donations;
mod http;
mod indexer;
mod models;
mod pinning;
mod retry;
mod rpc;
mod state;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::config::ApiConfig;
use crate::donations::DonationScanner;
use crate::indexer::{DonationIndex, DonationIndexer};
use crate::pinning::{AssetPublisher, PinataClient, PinningService};
use crate::retry::RetryPolicy;
use crate::rpc::{LogSource, RpcClient};
use crate::state::{ApiCache, AppState, ChainSummary};
use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ApiConfig::load().context("Failed to load configuration")?;
    let retry = RetryPolicy::from_config(&config.retry);

    let rpc_client = Arc::new(
        RpcClient::new(&config.chain.rpc_url, config.chain.request_timeout(), retry)
            .context("Failed to initialize RPC client")?,
    );
    check_chain_id(&rpc_client, config.chain.chain_id).await;

    let cache = Arc::new(ApiCache::new(&config.cache));
    let scanner = config.chain.contract_address()?.map(|contract| {
        DonationScanner::new(
            contract,
            &config.chain.donation_event,
            config.chain.max_log_block_range,
        )
    });
    if scanner.is_none() {
        warn!("CONTRACT_ADDRESS not set; donation queries will fail");
    }

    let publisher = match config.pinata.jwt.clone() {
        Some(jwt) => {
            let client: Arc<dyn PinningService> = Arc::new(
                PinataClient::from_config(&config.pinata, jwt, retry)
                    .context("Failed to initialize Pinata client")?,
            );
            Some(Arc::new(AssetPublisher::new(
                client,
                &config.pinata.gateway_host,
                cache.pinned_files.clone(),
            )))
        }
        None => {
            warn!("PINATA_JWT not set; uploads will fail");
            None
        }
    };

    let logs: Arc<dyn LogSource> = rpc_client.clone();
    let mut app_state = AppState::new(
        Arc::clone(&logs),
        scanner.clone(),
        publisher,
        Arc::clone(&cache),
        ChainSummary::from(&config.chain),
        rpc_client.timeout(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut indexer_handle: Option<JoinHandle<()>> = None;
    match scanner {
        Some(scanner) if config.indexer.enabled => {
            let index = Arc::new(DonationIndex::with_max_staleness(
                config.indexer.staleness_limit(),
            ));
            let indexer = DonationIndexer::new(
                Arc::clone(&logs),
                scanner,
                Arc::clone(&index),
                config.indexer.clone(),
            );
            app_state = app_state.with_index(index);
            indexer_handle = Some(tokio::spawn(async move {
                if let Err(err) = indexer.run(shutdown_rx).await {
                    error!("Indexer terminated with error: {err}");
                }
            }));
        }
        None if config.indexer.enabled => {
            warn!("Donation indexer enabled without a contract address; not starting it");
        }
        _ => {}
    }

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!(
        retry_attempts = retry.max_attempts(),
        "FanDonor API listening on {local_addr}"
    );

    let router: Router = http::router(app_state, config.server.max_upload_bytes);
    let server = axum::serve(listener, router.into_make_service());
    server
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("HTTP server exited with error")?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = indexer_handle {
        if let Err(join_err) = handle.await {
            error!("Indexer task join error: {join_err}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false);
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.compact().init(),
    }
}

async fn check_chain_id(rpc_client: &RpcClient, expected: u64) {
    match rpc_client.fetch_chain_id().await {
        Ok(chain_id) if chain_id == expected => {
            info!("Connected to chain {chain_id}");
        }
        Ok(chain_id) => {
            warn!("RPC endpoint reports chain {chain_id}, configured chain is {expected}");
        }
        Err(err) => {
            warn!("Could not query chain id: {err:#}");
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    shutdown_tx.send(true).ok();
    info!("Shutdown signal dispatched");
}
