use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, error, info};

use crate::donations::parse_token_id;
use crate::models::donation::DonationRecord;
use crate::state::AppState;

use super::HttpError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{token_id}", get(list_donations))
}

async fn list_donations(
    State(state): State<AppState>,
    Path(raw_token_id): Path<String>,
) -> Result<Json<Vec<DonationRecord>>, HttpError> {
    let Some(token_id) = parse_token_id(&raw_token_id) else {
        return Err(HttpError::bad_request("Invalid token ID"));
    };

    let Some(scanner) = state.donations.as_ref() else {
        error!("Contract address not configured");
        return Err(HttpError::internal("Contract address not configured"));
    };

    if let Some(records) = state
        .index
        .as_ref()
        .and_then(|index| index.donations_for(token_id))
    {
        debug!("Serving {} donations for token {token_id} from index", records.len());
        return Ok(Json(records));
    }

    let cache_key = token_id.to_string();
    if let Some(cache) = state.cache.donations.as_ref() {
        if let Some(cached) = cache.get(&cache_key).await {
            debug!("Serving donations for token {token_id} from cache");
            return Ok(Json(cached.as_ref().clone()));
        }
    }

    let records = scanner
        .scan_token(state.logs.as_ref(), token_id)
        .await
        .map_err(|err| {
            error!("Error fetching donations for token {token_id}: {err:#}");
            HttpError::internal("Failed to fetch donations")
        })?;
    info!(
        "Found {} donation events for token {token_id}",
        records.len()
    );

    if let Some(cache) = state.cache.donations.as_ref() {
        cache.insert(cache_key, Arc::new(records.clone())).await;
    }
    Ok(Json(records))
}
