//! In-process fakes for the upstream seams, shared by unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use alloy_primitives::{Address, B256, U256};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::DEFAULT_DONATION_EVENT;
use crate::donations::token_topic;
use crate::pinning::{PinnedObject, PinningError, PinningService};
use crate::rpc::{BlockTag, LogFilter, LogSource, RpcLog, parse_quantity};

fn word(bytes: B256) -> String {
    format!("0x{}", hex::encode(bytes.as_slice()))
}

/// A `DonationReceived` log as a node would return it.
pub fn donation_log(token_id: u64, donor: Address, amount: U256, block: u64, tx_seed: u8) -> RpcLog {
    let event_topic = alloy_primitives::keccak256(DEFAULT_DONATION_EVENT.as_bytes());
    RpcLog {
        address: Some("0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string()),
        topics: vec![
            word(event_topic),
            word(token_topic(U256::from(token_id))),
            word(donor.into_word()),
        ],
        data: format!("0x{}", hex::encode(amount.to_be_bytes::<32>())),
        block_number: Some(format!("{block:#x}")),
        transaction_hash: Some(word(B256::repeat_byte(tx_seed))),
        log_index: Some("0x0".to_string()),
        removed: false,
    }
}

/// Node double that answers `eth_getLogs` from a fixed set of logs and
/// records every filter it receives.
#[derive(Default)]
pub struct ScriptedLogs {
    head: AtomicU64,
    logs: Mutex<Vec<RpcLog>>,
    filters: Mutex<Vec<LogFilter>>,
    head_calls: AtomicUsize,
    failing: AtomicBool,
    max_range: Mutex<Option<u64>>,
}

impl ScriptedLogs {
    pub fn new(head: u64) -> Self {
        let source = Self::default();
        source.head.store(head, Ordering::SeqCst);
        source
    }

    pub fn push(&self, log: RpcLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Refuses `eth_getLogs` windows wider than `blocks`, like capped providers.
    pub fn cap_range(&self, blocks: u64) {
        *self.max_range.lock().unwrap() = Some(blocks);
    }

    pub fn filters(&self) -> Vec<LogFilter> {
        self.filters.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.filters.lock().unwrap().len() + self.head_calls.load(Ordering::SeqCst)
    }

    fn matches(filter: &LogFilter, log: &RpcLog, head: u64) -> bool {
        let topics_match = filter
            .topics
            .iter()
            .enumerate()
            .all(|(index, topic)| match topic {
                Some(expected) => log.topics.get(index) == Some(expected),
                None => true,
            });
        let block = log
            .block_number
            .as_deref()
            .and_then(|raw| parse_quantity(raw).ok())
            .unwrap_or_default();
        let resolve = |tag: BlockTag| match tag {
            BlockTag::Number(number) => number,
            BlockTag::Latest => head,
        };
        topics_match && block >= resolve(filter.from_block) && block <= resolve(filter.to_block)
    }
}

#[async_trait]
impl LogSource for ScriptedLogs {
    async fn latest_block_number(&self) -> Result<u64> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>> {
        self.filters.lock().unwrap().push(filter.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let head = self.head.load(Ordering::SeqCst);
        if let Some(cap) = *self.max_range.lock().unwrap() {
            let resolve = |tag: BlockTag| match tag {
                BlockTag::Number(number) => number,
                BlockTag::Latest => head,
            };
            let width = resolve(filter.to_block).saturating_sub(resolve(filter.from_block)) + 1;
            if width > cap {
                return Err(anyhow!("block range too large"));
            }
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| Self::matches(filter, log, head))
            .cloned()
            .collect())
    }
}

/// Pinning gateway double with scripted outcomes per endpoint.
pub struct FakePinning {
    file_outcome: Mutex<Result<String, (u16, String)>>,
    json_outcome: Mutex<Result<String, (u16, String)>>,
    file_calls: AtomicUsize,
    json_calls: AtomicUsize,
    file_names: Mutex<Vec<String>>,
    json_documents: Mutex<Vec<(Value, String)>>,
}

impl FakePinning {
    pub fn succeeding(file_cid: &str, json_cid: &str) -> Self {
        Self {
            file_outcome: Mutex::new(Ok(file_cid.to_string())),
            json_outcome: Mutex::new(Ok(json_cid.to_string())),
            file_calls: AtomicUsize::new(0),
            json_calls: AtomicUsize::new(0),
            file_names: Mutex::new(Vec::new()),
            json_documents: Mutex::new(Vec::new()),
        }
    }

    pub fn reject_files(&self, status: u16, body: &str) {
        *self.file_outcome.lock().unwrap() = Err((status, body.to_string()));
    }

    pub fn reject_json(&self, status: u16, body: &str) {
        *self.json_outcome.lock().unwrap() = Err((status, body.to_string()));
    }

    pub fn accept_json(&self, cid: &str) {
        *self.json_outcome.lock().unwrap() = Ok(cid.to_string());
    }

    pub fn file_calls(&self) -> usize {
        self.file_calls.load(Ordering::SeqCst)
    }

    pub fn json_calls(&self) -> usize {
        self.json_calls.load(Ordering::SeqCst)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.file_names.lock().unwrap().clone()
    }

    pub fn json_documents(&self) -> Vec<(Value, String)> {
        self.json_documents.lock().unwrap().clone()
    }

    fn outcome(slot: &Mutex<Result<String, (u16, String)>>) -> Result<PinnedObject, PinningError> {
        match slot.lock().unwrap().clone() {
            Ok(cid) => Ok(PinnedObject { cid }),
            Err((status, body)) => Err(PinningError::Rejected { status, body }),
        }
    }
}

#[async_trait]
impl PinningService for FakePinning {
    async fn pin_file(
        &self,
        file_name: &str,
        _content_type: Option<&str>,
        _bytes: &[u8],
    ) -> Result<PinnedObject, PinningError> {
        self.file_calls.fetch_add(1, Ordering::SeqCst);
        self.file_names.lock().unwrap().push(file_name.to_string());
        Self::outcome(&self.file_outcome)
    }

    async fn pin_json(&self, content: &Value, name: &str) -> Result<PinnedObject, PinningError> {
        self.json_calls.fetch_add(1, Ordering::SeqCst);
        self.json_documents
            .lock()
            .unwrap()
            .push((content.clone(), name.to_string()));
        Self::outcome(&self.json_outcome)
    }
}
