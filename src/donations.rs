//! Decoding of `DonationReceived` logs and block-range scans over them.
//!
//! The event is laid out as
//! `DonationReceived(uint256 indexed tokenId, address indexed donor, uint256 amount)`:
//! `topics[1]` carries the token id, `topics[2]` the donor and the first data
//! word the amount.

use alloy_primitives::{Address, B256, U256, keccak256};
use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::donation::DonationRecord;
use crate::rpc::{BlockTag, LogFilter, LogSource, RpcLog, parse_quantity};

/// Longest decimal rendering of a `uint256`.
const MAX_TOKEN_ID_DIGITS: usize = 78;

#[derive(Debug, Error)]
pub enum DonationError {
    #[error("log is missing topic {0}")]
    MissingTopic(usize),
    #[error("log topic {index} is not a 32-byte word: {value}")]
    InvalidTopic { index: usize, value: String },
    #[error("log data is not hex encoded")]
    InvalidData,
    #[error("log data holds {0} bytes, expected at least 32")]
    ShortData(usize),
    #[error("log is missing {0}")]
    MissingField(&'static str),
    #[error("log field {field} is malformed: {value}")]
    MalformedField { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDonation {
    pub token_id: U256,
    pub record: DonationRecord,
}

/// Parses a path segment as a base-10 `uint256` token id.
pub fn parse_token_id(raw: &str) -> Option<U256> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let significant = raw.trim_start_matches('0');
    if significant.is_empty() {
        return Some(U256::ZERO);
    }
    if significant.len() > MAX_TOKEN_ID_DIGITS {
        return None;
    }
    U256::from_str_radix(significant, 10).ok()
}

pub fn token_topic(token_id: U256) -> B256 {
    B256::from(token_id.to_be_bytes::<32>())
}

fn encode_word(word: B256) -> String {
    format!("0x{}", hex::encode(word.as_slice()))
}

fn topic_at(log: &RpcLog, index: usize) -> Result<B256, DonationError> {
    let raw = log
        .topics
        .get(index)
        .ok_or(DonationError::MissingTopic(index))?;
    raw.parse::<B256>()
        .map_err(|_| DonationError::InvalidTopic {
            index,
            value: raw.clone(),
        })
}

/// Decodes one log. Returns `None` for logs the node flagged as removed.
pub fn decode_donation(log: &RpcLog) -> Result<Option<DecodedDonation>, DonationError> {
    if log.removed {
        return Ok(None);
    }

    let token_id = U256::from_be_bytes(topic_at(log, 1)?.0);
    let donor = Address::from_word(topic_at(log, 2)?);

    let data = alloy_primitives::hex::decode(&log.data).map_err(|_| DonationError::InvalidData)?;
    if data.len() < 32 {
        return Err(DonationError::ShortData(data.len()));
    }
    let amount = U256::from_be_slice(&data[..32]);

    let raw_block = log
        .block_number
        .as_deref()
        .ok_or(DonationError::MissingField("blockNumber"))?;
    let block_number =
        parse_quantity(raw_block).map_err(|_| DonationError::MalformedField {
            field: "blockNumber",
            value: raw_block.to_string(),
        })?;

    let raw_hash = log
        .transaction_hash
        .as_deref()
        .ok_or(DonationError::MissingField("transactionHash"))?;
    let transaction_hash =
        raw_hash
            .parse::<B256>()
            .map_err(|_| DonationError::MalformedField {
                field: "transactionHash",
                value: raw_hash.to_string(),
            })?;

    Ok(Some(DecodedDonation {
        token_id,
        record: DonationRecord {
            donor: donor.to_checksum(None),
            amount: amount.to_string(),
            block_number: block_number.to_string(),
            transaction_hash: encode_word(transaction_hash),
        },
    }))
}

/// Splits `[from, to]` into consecutive inclusive windows of at most `span` blocks.
pub fn block_windows(from: u64, to: u64, span: u64) -> impl Iterator<Item = (u64, u64)> {
    assert!(span > 0, "Window span must be positive");
    let mut next = Some(from).filter(|start| *start <= to);
    std::iter::from_fn(move || {
        let start = next?;
        let end = start.saturating_add(span - 1).min(to);
        next = end.checked_add(1).filter(|candidate| *candidate <= to);
        Some((start, end))
    })
}

/// What a scan does with a log it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidLogs {
    Fail,
    Skip,
}

/// Scope of a donation scan: which contract and which event.
#[derive(Debug, Clone)]
pub struct DonationScanner {
    contract: Address,
    event_topic: B256,
    max_block_range: Option<u64>,
}

impl DonationScanner {
    pub fn new(contract: Address, event_signature: &str, max_block_range: Option<u64>) -> Self {
        assert!(
            !event_signature.is_empty(),
            "Event signature must be provided"
        );
        assert!(
            max_block_range.is_none_or(|range| range > 0),
            "Block range must be positive"
        );
        Self {
            contract,
            event_topic: keccak256(event_signature.as_bytes()),
            max_block_range,
        }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn max_block_range(&self) -> Option<u64> {
        self.max_block_range
    }

    pub fn filter(&self, token_id: Option<U256>, from: BlockTag, to: BlockTag) -> LogFilter {
        let mut topics = vec![Some(encode_word(self.event_topic))];
        if let Some(token_id) = token_id {
            topics.push(Some(encode_word(token_topic(token_id))));
        }
        LogFilter {
            address: encode_address(self.contract),
            topics,
            from_block: from,
            to_block: to,
        }
    }

    /// All donations for one token from genesis to the current head.
    pub async fn scan_token(
        &self,
        source: &dyn LogSource,
        token_id: U256,
    ) -> Result<Vec<DonationRecord>> {
        let decoded = match self.max_block_range {
            None => {
                let filter = self.filter(Some(token_id), BlockTag::Number(0), BlockTag::Latest);
                let logs = source.logs(&filter).await?;
                decode_all(&logs, InvalidLogs::Fail)?
            }
            Some(span) => {
                let head = source.latest_block_number().await?;
                self.scan_range(source, Some(token_id), 0, head, span, InvalidLogs::Fail)
                    .await?
            }
        };
        debug!(
            "Found {} donation events for token {token_id}",
            decoded.len()
        );
        Ok(decoded.into_iter().map(|donation| donation.record).collect())
    }

    /// Donations in `[from, to]`, queried window by window in block order.
    pub async fn scan_range(
        &self,
        source: &dyn LogSource,
        token_id: Option<U256>,
        from: u64,
        to: u64,
        span: u64,
        invalid: InvalidLogs,
    ) -> Result<Vec<DecodedDonation>> {
        let mut decoded = Vec::new();
        for (start, end) in block_windows(from, to, span) {
            let filter = self.filter(token_id, BlockTag::Number(start), BlockTag::Number(end));
            let logs = source.logs(&filter).await?;
            decoded.extend(decode_all(&logs, invalid)?);
        }
        Ok(decoded)
    }
}

fn encode_address(address: Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

fn decode_all(logs: &[RpcLog], invalid: InvalidLogs) -> Result<Vec<DecodedDonation>> {
    let mut decoded = Vec::with_capacity(logs.len());
    for log in logs {
        let tx = log.transaction_hash.as_deref().unwrap_or("<pending>");
        match decode_donation(log) {
            Ok(Some(donation)) => decoded.push(donation),
            Ok(None) => {}
            Err(err) if invalid == InvalidLogs::Skip => {
                warn!(tx, "Skipping undecodable donation log: {err}");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to decode donation log {tx}"));
            }
        }
    }
    Ok(decoded)
}
