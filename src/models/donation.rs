use serde::{Deserialize, Serialize};

/// One `DonationReceived` log, normalized for the web client.
///
/// Numeric fields are decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRecord {
    pub donor: String,
    pub amount: String,
    pub block_number: String,
    pub transaction_hash: String,
}
