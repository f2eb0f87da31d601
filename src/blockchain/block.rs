use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::canonical::canonical_json;
use super::transaction::LedgerEntry;

/// Index of the genesis block
pub const GENESIS_INDEX: u64 = 1;

/// Previous hash recorded in the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "00";

/// Represents a block in the blockchain
///
/// The serialized field names are part of the peer wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain, starting at 1
    pub index: u64,

    /// Seconds since the Unix epoch when the block was sealed, kept in the
    /// numeric form it was received in
    #[schema(value_type = f64)]
    pub timestamp: Number,

    /// Transactions and medical records sealed in this block
    #[schema(value_type = Vec<Object>)]
    pub transactions: Vec<LedgerEntry>,

    /// Proof of work (nonce)
    pub nonce: u64,

    /// Hash of the previous block
    pub previous_hash: String,
}

impl Block {
    /// Creates a new block stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `transactions` - The entries to seal in the block
    /// * `nonce` - The proof of work
    /// * `previous_hash` - The hash of the previous block
    pub fn new(
        index: u64,
        transactions: Vec<LedgerEntry>,
        nonce: u64,
        previous_hash: String,
    ) -> Self {
        Block {
            index,
            timestamp: Number::from_f64(now_seconds()).unwrap_or_else(|| Number::from(0)),
            transactions,
            nonce,
            previous_hash,
        }
    }

    /// Creates the genesis block
    pub fn genesis() -> Self {
        Block::new(GENESIS_INDEX, Vec::new(), 0, GENESIS_PREVIOUS_HASH.to_string())
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 hex digest of the block's canonical JSON
    pub fn calculate_hash(&self) -> String {
        // Serializing a block of plain fields and JSON values cannot fail
        let block_string = canonical_json(self).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(block_string.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Current wall-clock time in fractional seconds since the Unix epoch
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
