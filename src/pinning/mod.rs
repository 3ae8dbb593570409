//! Content pinning through the Pinata gateway.
//!
//! An upload is two ordered pins: the file, then a metadata document that
//! points at the file's gateway URI. [`AssetPublisher`] drives that sequence
//! through [`UploadStage`] so a failure always names the step it happened in.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PinataConfig;
use crate::models::upload::{AssetUpload, TokenMetadata, UploadResult};
use crate::retry::RetryPolicy;

const PIN_FILE_PATH: &str = "/pinning/pinFileToIPFS";
const PIN_JSON_PATH: &str = "/pinning/pinJSONToIPFS";
const CID_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum PinningError {
    #[error("{status} {body}")]
    Rejected { status: u16, body: String },
    #[error("pinning request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed pinning response: {0}")]
    Decode(String),
}

impl PinningError {
    /// Gateway overload and transport trouble are worth another attempt;
    /// explicit rejections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PinningError::Rejected { status, .. } => *status >= 500 || *status == 429,
            PinningError::Transport(_) => true,
            PinningError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedObject {
    pub cid: String,
}

#[async_trait]
pub trait PinningService: Send + Sync {
    async fn pin_file(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<PinnedObject, PinningError>;

    async fn pin_json(&self, content: &Value, name: &str) -> Result<PinnedObject, PinningError>;
}

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

pub struct PinataClient {
    http: reqwest::Client,
    api_base_url: String,
    jwt: String,
    retry: RetryPolicy,
}

impl PinataClient {
    pub fn new(
        api_base_url: &str,
        jwt: String,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        assert!(!api_base_url.is_empty(), "Pinata API URL must be provided");
        assert!(!jwt.is_empty(), "Pinata JWT must be provided");

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build pinning HTTP client")?;

        Ok(Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            jwt,
            retry,
        })
    }

    pub fn from_config(config: &PinataConfig, jwt: String, retry: RetryPolicy) -> Result<Self> {
        Self::new(&config.api_base_url, jwt, config.request_timeout(), retry)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    async fn read_pin_response(response: reqwest::Response) -> Result<PinnedObject, PinningError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PinningError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let payload: PinResponse = response
            .json()
            .await
            .map_err(|err| PinningError::Decode(err.to_string()))?;
        if payload.ipfs_hash.is_empty() {
            return Err(PinningError::Decode("empty IpfsHash".to_string()));
        }
        Ok(PinnedObject {
            cid: payload.ipfs_hash,
        })
    }

    fn file_form(file_name: &str, content_type: Option<&str>, bytes: &[u8]) -> Form {
        let part = || Part::bytes(bytes.to_vec()).file_name(file_name.to_string());
        let file = match content_type {
            Some(mime) => part().mime_str(mime).unwrap_or_else(|_| part()),
            None => part(),
        };
        Form::new()
            .part("file", file)
            .text("pinataMetadata", json!({ "name": file_name }).to_string())
            .text(
                "pinataOptions",
                json!({ "cidVersion": CID_VERSION }).to_string(),
            )
    }
}

#[async_trait]
impl PinningService for PinataClient {
    async fn pin_file(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<PinnedObject, PinningError> {
        let url = self.endpoint(PIN_FILE_PATH);
        let url = url.as_str();
        self.retry
            .run("pinFileToIPFS", PinningError::is_retryable, move || async move {
                let response = self
                    .http
                    .post(url)
                    .bearer_auth(&self.jwt)
                    .multipart(Self::file_form(file_name, content_type, bytes))
                    .send()
                    .await
                    .map_err(PinningError::Transport)?;
                Self::read_pin_response(response).await
            })
            .await
    }

    async fn pin_json(&self, content: &Value, name: &str) -> Result<PinnedObject, PinningError> {
        let url = self.endpoint(PIN_JSON_PATH);
        let body = json!({
            "pinataContent": content,
            "pinataMetadata": { "name": name },
        });
        let (url, body) = (url.as_str(), &body);
        self.retry
            .run("pinJSONToIPFS", PinningError::is_retryable, move || async move {
                let response = self
                    .http
                    .post(url)
                    .bearer_auth(&self.jwt)
                    .json(body)
                    .send()
                    .await
                    .map_err(PinningError::Transport)?;
                Self::read_pin_response(response).await
            })
            .await
    }
}

pub fn gateway_uri(gateway_host: &str, cid: &str) -> String {
    format!("https://{gateway_host}/ipfs/{cid}")
}

/// Progress of one upload. Only moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStage {
    NotStarted,
    FilePinned { file_cid: String },
    Complete { token_uri: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    FilePin,
    MetadataPin,
}

impl UploadStep {
    pub fn label(self) -> &'static str {
        match self {
            UploadStep::FilePin => "File upload",
            UploadStep::MetadataPin => "Metadata upload",
        }
    }
}

/// An upload that stopped at `step`; `stage` is the last stage it reached.
#[derive(Debug, Error)]
#[error("{} failed: {source}", .step.label())]
pub struct UploadFailure {
    pub step: UploadStep,
    pub stage: UploadStage,
    #[source]
    pub source: PinningError,
}

pub struct AssetPublisher {
    service: Arc<dyn PinningService>,
    gateway_host: String,
    pinned_files: Cache<String, String>,
}

impl AssetPublisher {
    pub fn new(
        service: Arc<dyn PinningService>,
        gateway_host: &str,
        pinned_files: Cache<String, String>,
    ) -> Self {
        assert!(!gateway_host.is_empty(), "Gateway host must be provided");
        Self {
            service,
            gateway_host: gateway_host.to_string(),
            pinned_files,
        }
    }

    pub async fn publish(&self, asset: AssetUpload) -> Result<UploadResult, UploadFailure> {
        let mut stage = UploadStage::NotStarted;
        let digest = hex::encode(Sha256::digest(&asset.bytes));

        let file_cid = match self.pinned_files.get(&digest).await {
            Some(cid) => {
                info!(file = %asset.file_name, cid = %cid, "Reusing previously pinned file");
                cid
            }
            None => {
                let pinned = self
                    .service
                    .pin_file(
                        &asset.file_name,
                        asset.content_type.as_deref(),
                        &asset.bytes,
                    )
                    .await
                    .map_err(|source| fail(UploadStep::FilePin, &stage, source))?;
                self.pinned_files
                    .insert(digest, pinned.cid.clone())
                    .await;
                pinned.cid
            }
        };
        advance(
            &mut stage,
            UploadStage::FilePinned {
                file_cid: file_cid.clone(),
            },
        );

        let metadata = TokenMetadata {
            name: asset.name.clone(),
            description: asset.description,
            image: gateway_uri(&self.gateway_host, &file_cid),
        };
        let content = serde_json::to_value(&metadata).map_err(|err| {
            fail(
                UploadStep::MetadataPin,
                &stage,
                PinningError::Decode(err.to_string()),
            )
        })?;
        let pinned = self
            .service
            .pin_json(&content, &format!("{}-metadata", asset.name))
            .await
            .map_err(|source| fail(UploadStep::MetadataPin, &stage, source))?;

        let token_uri = gateway_uri(&self.gateway_host, &pinned.cid);
        advance(
            &mut stage,
            UploadStage::Complete {
                token_uri: token_uri.clone(),
            },
        );
        Ok(UploadResult { token_uri })
    }
}

fn advance(stage: &mut UploadStage, next: UploadStage) {
    debug!(from = ?stage, to = ?next, "Upload stage transition");
    *stage = next;
}

fn fail(step: UploadStep, stage: &UploadStage, source: PinningError) -> UploadFailure {
    warn!(step = step.label(), stage = ?stage, "Upload step failed: {source}");
    UploadFailure {
        step,
        stage: stage.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;
    use crate::testing::FakePinning;

    const GATEWAY: &str = "gateway.pinata.cloud";

    fn asset(bytes: &[u8]) -> AssetUpload {
        AssetUpload {
            file_name: "poster.png".to_string(),
            content_type: Some("image/png".to_string()),
            bytes: bytes.to_vec(),
            name: "Poster".to_string(),
            description: "Signed tour poster".to_string(),
        }
    }

    fn publisher(service: Arc<dyn PinningService>) -> AssetPublisher {
        AssetPublisher::new(service, GATEWAY, Cache::new(16))
    }

    fn client(base_url: &str, retry: RetryPolicy) -> PinataClient {
        PinataClient::new(
            base_url,
            "test-jwt".to_string(),
            Duration::from_secs(5),
            retry,
        )
        .expect("client builds")
    }

    #[test]
    fn rejection_classification() {
        let rejected = |status| PinningError::Rejected {
            status,
            body: String::new(),
        };
        assert!(rejected(500).is_retryable());
        assert!(rejected(503).is_retryable());
        assert!(rejected(429).is_retryable());
        assert!(!rejected(400).is_retryable());
        assert!(!rejected(413).is_retryable());
        assert!(!PinningError::Decode("bad".to_string()).is_retryable());
    }

    #[test]
    fn failure_message_names_the_step() {
        let failure = UploadFailure {
            step: UploadStep::MetadataPin,
            stage: UploadStage::FilePinned {
                file_cid: "Qfile".to_string(),
            },
            source: PinningError::Rejected {
                status: 401,
                body: "unauthorized".to_string(),
            },
        };
        assert_eq!(failure.to_string(), "Metadata upload failed: 401 unauthorized");
    }

    #[tokio::test]
    async fn publish_links_metadata_to_file() {
        let fake = Arc::new(FakePinning::succeeding("Qfile", "Qmeta"));
        let result = publisher(fake.clone())
            .publish(asset(b"png-bytes"))
            .await
            .unwrap();

        assert_eq!(result.token_uri, "https://gateway.pinata.cloud/ipfs/Qmeta");
        let documents = fake.json_documents();
        assert_eq!(documents.len(), 1);
        let (content, name) = &documents[0];
        assert_eq!(content["image"], "https://gateway.pinata.cloud/ipfs/Qfile");
        assert_eq!(content["name"], "Poster");
        assert_eq!(content["description"], "Signed tour poster");
        assert_eq!(name, "Poster-metadata");
        assert_eq!(fake.file_names(), vec!["poster.png".to_string()]);
    }

    #[tokio::test]
    async fn file_rejection_stops_before_metadata() {
        let fake = Arc::new(FakePinning::succeeding("Qfile", "Qmeta"));
        fake.reject_files(413, "File too large");

        let failure = publisher(fake.clone())
            .publish(asset(b"huge"))
            .await
            .unwrap_err();

        assert_eq!(failure.step, UploadStep::FilePin);
        assert_eq!(failure.stage, UploadStage::NotStarted);
        assert_eq!(fake.file_calls(), 1);
        assert_eq!(fake.json_calls(), 0);
    }

    #[tokio::test]
    async fn metadata_rejection_reports_pinned_file() {
        let fake = Arc::new(FakePinning::succeeding("Qfile", "Qmeta"));
        fake.reject_json(400, "invalid json");

        let failure = publisher(fake.clone())
            .publish(asset(b"bytes"))
            .await
            .unwrap_err();

        assert_eq!(failure.step, UploadStep::MetadataPin);
        assert_eq!(
            failure.stage,
            UploadStage::FilePinned {
                file_cid: "Qfile".to_string()
            }
        );
    }

    #[tokio::test]
    async fn retried_upload_reuses_pinned_file() {
        let fake = Arc::new(FakePinning::succeeding("Qfile", "Qmeta"));
        let publisher = publisher(fake.clone());
        fake.reject_json(400, "bad metadata");

        assert!(publisher.publish(asset(b"same")).await.is_err());

        fake.accept_json("Qmeta");
        let result = publisher.publish(asset(b"same")).await.unwrap();

        assert_eq!(result.token_uri, "https://gateway.pinata.cloud/ipfs/Qmeta");
        assert_eq!(fake.file_calls(), 1);
        assert_eq!(fake.json_calls(), 2);
        let (content, _) = &fake.json_documents()[1];
        assert_eq!(content["image"], "https://gateway.pinata.cloud/ipfs/Qfile");
    }

    #[tokio::test]
    async fn different_files_are_pinned_separately() {
        let fake = Arc::new(FakePinning::succeeding("Qfile", "Qmeta"));
        let publisher = publisher(fake.clone());

        publisher.publish(asset(b"first")).await.unwrap();
        publisher.publish(asset(b"second")).await.unwrap();

        assert_eq!(fake.file_calls(), 2);
    }

    #[tokio::test]
    async fn pinata_file_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let file_mock = server
            .mock("POST", PIN_FILE_PATH)
            .match_header("authorization", "Bearer test-jwt")
            .match_body(Matcher::Regex(r#"\{"cidVersion":1\}"#.to_string()))
            .with_status(413)
            .with_body("File too large")
            .expect(1)
            .create_async()
            .await;
        let json_mock = server
            .mock("POST", PIN_JSON_PATH)
            .expect(0)
            .create_async()
            .await;

        let pinata: Arc<dyn PinningService> = Arc::new(client(
            &server.url(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        ));
        let failure = publisher(pinata).publish(asset(b"huge")).await.unwrap_err();

        assert_eq!(failure.step, UploadStep::FilePin);
        assert!(matches!(
            failure.source,
            PinningError::Rejected { status: 413, ref body } if body == "File too large"
        ));
        file_mock.assert_async().await;
        json_mock.assert_async().await;
    }

    #[tokio::test]
    async fn pinata_round_trip_builds_token_uri() {
        let mut server = mockito::Server::new_async().await;
        let file_mock = server
            .mock("POST", PIN_FILE_PATH)
            .match_header("authorization", "Bearer test-jwt")
            .match_body(Matcher::Regex(r#"\{"name":"poster.png"\}"#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"IpfsHash":"Qfile","PinSize":9,"Timestamp":"2024-01-01T00:00:00Z"}"#)
            .expect(1)
            .create_async()
            .await;
        let json_mock = server
            .mock("POST", PIN_JSON_PATH)
            .match_header("authorization", "Bearer test-jwt")
            .match_body(Matcher::PartialJson(json!({
                "pinataContent": {
                    "name": "Poster",
                    "description": "Signed tour poster",
                    "image": "https://gateway.pinata.cloud/ipfs/Qfile",
                },
                "pinataMetadata": { "name": "Poster-metadata" },
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"IpfsHash":"Qmeta","PinSize":120,"Timestamp":"2024-01-01T00:00:01Z"}"#)
            .expect(1)
            .create_async()
            .await;

        let pinata: Arc<dyn PinningService> =
            Arc::new(client(&server.url(), RetryPolicy::none()));
        let result = publisher(pinata).publish(asset(b"png-bytes")).await.unwrap();

        assert_eq!(result.token_uri, "https://gateway.pinata.cloud/ipfs/Qmeta");
        file_mock.assert_async().await;
        json_mock.assert_async().await;
    }

    #[tokio::test]
    async fn pinata_overload_is_retried_within_budget() {
        let mut server = mockito::Server::new_async().await;
        let json_mock = server
            .mock("POST", PIN_JSON_PATH)
            .with_status(503)
            .with_body("busy")
            .expect(2)
            .create_async()
            .await;

        let pinata = client(
            &server.url(),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        );
        let err = pinata
            .pin_json(&json!({ "name": "x" }), "x-metadata")
            .await
            .unwrap_err();

        assert!(matches!(err, PinningError::Rejected { status: 503, .. }));
        json_mock.assert_async().await;
    }

    #[tokio::test]
    async fn pinata_response_without_hash_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", PIN_JSON_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"PinSize":1}"#)
            .create_async()
            .await;

        let pinata = client(&server.url(), RetryPolicy::none());
        let err = pinata.pin_json(&json!({}), "x").await.unwrap_err();
        assert!(matches!(err, PinningError::Decode(_)));
    }
}
