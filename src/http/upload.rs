use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::{error, info};

use crate::models::upload::{AssetUpload, UploadResult};
use crate::pinning::{PinningError, UploadFailure};
use crate::state::AppState;

use super::HttpError;

const MISSING_FIELDS: &str = "Missing file/name/description";
const DEFAULT_FILE_NAME: &str = "upload";

pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload_asset))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

/// Pins the uploaded file, then its metadata document, and returns the
/// metadata's gateway URI.
///
/// The body is only read once the pinning credential is known to be present.
async fn upload_asset(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<UploadResult>, HttpError> {
    let Some(publisher) = state.publisher.clone() else {
        error!("Missing PINATA_JWT");
        return Err(HttpError::internal("Missing PINATA_JWT"));
    };

    let multipart = Multipart::from_request(request, &state)
        .await
        .map_err(|_| HttpError::bad_request(MISSING_FIELDS))?;
    let asset = read_upload_form(multipart).await?;
    info!(
        file = %asset.file_name,
        size = asset.bytes.len(),
        name = %asset.name,
        "Pinning uploaded asset"
    );

    let result = publisher.publish(asset).await.map_err(upload_error)?;
    info!(token_uri = %result.token_uri, "Asset pinned");
    Ok(Json(result))
}

async fn read_upload_form(mut multipart: Multipart) -> Result<AssetUpload, HttpError> {
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut name = String::new();
    let mut description = String::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().map(|s| s.to_string()).unwrap_or_default();
        match field_name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .filter(|file_name| !file_name.is_empty())
                    .unwrap_or(DEFAULT_FILE_NAME)
                    .to_string();
                let content_type = field.content_type().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((file_name, content_type, bytes.to_vec()));
            }
            "name" => name = field.text().await.map_err(multipart_error)?,
            "description" => description = field.text().await.map_err(multipart_error)?,
            _ => {}
        }
    }

    let Some((file_name, content_type, bytes)) = file.filter(|(_, _, bytes)| !bytes.is_empty())
    else {
        return Err(HttpError::bad_request(MISSING_FIELDS));
    };
    if name.is_empty() || description.is_empty() {
        return Err(HttpError::bad_request(MISSING_FIELDS));
    }

    Ok(AssetUpload {
        file_name,
        content_type,
        bytes,
        name,
        description,
    })
}

fn multipart_error(err: MultipartError) -> HttpError {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return HttpError::new(status, "Upload exceeds size limit".to_string());
    }
    HttpError::bad_request(MISSING_FIELDS)
}

fn upload_error(failure: UploadFailure) -> HttpError {
    let message = failure.to_string();
    match failure.source {
        PinningError::Rejected { .. } => HttpError::new(StatusCode::BAD_GATEWAY, message),
        _ => {
            error!(step = failure.step.label(), "Upload failed: {message}");
            let message = if message.is_empty() {
                "Upload failed".to_string()
            } else {
                message
            };
            HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}
