use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use super::canonical::canonical_json;
use super::medical::MedicalRecord;

/// Reserved sender identity for mining rewards; the only sender exempt from
/// signature verification
pub const MINING_SENDER: &str = "THE BLOCKCHAIN";

/// Amount credited to the node that seals a block
pub const MINING_REWARD: f64 = 1.0;

/// Minimum length of a sender or recipient address
pub const MIN_ADDRESS_LEN: usize = 10;

/// Errors raised by transaction boundary validation
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Amount must be a positive number: {0}")]
    InvalidAmount(f64),

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Transaction requires a valid signature")]
    MissingSignature,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A financial transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct Transaction {
    /// Sender address (hex-encoded public key, or the mining sender)
    pub sender: String,

    /// Recipient address
    pub recipient: String,

    /// Amount being transferred
    pub amount: f64,

    /// Hex-encoded signature over the signing payload; omitted for mining rewards
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl Transaction {
    /// Creates a new transaction
    pub fn new(sender: &str, recipient: &str, amount: f64, signature: &str) -> Self {
        Transaction {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            signature: signature.to_string(),
        }
    }

    /// Creates a mining reward transaction
    pub fn mining_reward(recipient: &str) -> Self {
        Transaction::new(MINING_SENDER, recipient, MINING_REWARD, "")
    }

    /// Checks if the transaction is a mining reward
    pub fn is_mining_reward(&self) -> bool {
        self.sender == MINING_SENDER
    }

    /// Validates the transaction fields before admission
    ///
    /// The amount must be finite and strictly positive, both addresses must be
    /// at least `MIN_ADDRESS_LEN` characters, and the signature must be
    /// non-empty unless the sender is the mining sender.
    pub fn validate(&self) -> Result<(), TransactionError> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(TransactionError::InvalidAmount(self.amount));
        }

        if self.sender.chars().count() < MIN_ADDRESS_LEN {
            return Err(TransactionError::InvalidSenderAddress(self.sender.clone()));
        }

        if self.recipient.chars().count() < MIN_ADDRESS_LEN {
            return Err(TransactionError::InvalidRecipientAddress(self.recipient.clone()));
        }

        if !self.is_mining_reward() && self.signature.is_empty() {
            return Err(TransactionError::MissingSignature);
        }

        Ok(())
    }

    /// Gets the canonical message the sender signs
    pub fn signing_payload(&self) -> Result<String, TransactionError> {
        signing_payload(&self.sender, &self.recipient, self.amount)
    }
}

/// Builds the canonical message a sender signs for a transfer
///
/// The message is the canonical JSON of `{amount, recipient, sender}`.
pub fn signing_payload(
    sender: &str,
    recipient: &str,
    amount: f64,
) -> Result<String, TransactionError> {
    let data = serde_json::json!({
        "sender": sender,
        "recipient": recipient,
        "amount": amount,
    });

    canonical_json(&data).map_err(|e| TransactionError::SerializationError(e.to_string()))
}

/// An entry in a block's transaction list
///
/// An entry keeps the JSON it was built from or received as and serializes
/// back to exactly that value, so a block re-hashes to the digest its author
/// computed. Objects matching neither the transfer nor the record shape
/// exactly are kept as `Unrecognized`.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    kind: EntryKind,
    raw: Value,
}

/// What an entry was recognized as
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    Medical(MedicalRecord),
    Transfer(Transaction),
    Unrecognized,
}

impl LedgerEntry {
    /// Wraps a JSON value, recognizing records and transfers
    pub fn from_raw(raw: Value) -> Self {
        let kind = if let Ok(record) = serde_json::from_value::<MedicalRecord>(raw.clone()) {
            EntryKind::Medical(record)
        } else if let Ok(transaction) = serde_json::from_value::<Transaction>(raw.clone()) {
            EntryKind::Transfer(transaction)
        } else {
            EntryKind::Unrecognized
        };

        LedgerEntry { kind, raw }
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// The JSON this entry serializes to
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Gets the medical record, if this entry is one
    pub fn as_medical(&self) -> Option<&MedicalRecord> {
        match self.kind() {
            EntryKind::Medical(record) => Some(record),
            _ => None,
        }
    }

    /// Gets the transaction, if this entry is one
    pub fn as_transfer(&self) -> Option<&Transaction> {
        match self.kind() {
            EntryKind::Transfer(transaction) => Some(transaction),
            _ => None,
        }
    }
}

impl Serialize for LedgerEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LedgerEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(LedgerEntry::from_raw)
    }
}

impl From<Transaction> for LedgerEntry {
    fn from(transaction: Transaction) -> Self {
        // Plain strings and a finite amount always convert
        let raw = serde_json::to_value(&transaction).unwrap_or_default();
        LedgerEntry {
            kind: EntryKind::Transfer(transaction),
            raw,
        }
    }
}

impl From<MedicalRecord> for LedgerEntry {
    fn from(record: MedicalRecord) -> Self {
        let raw = serde_json::to_value(&record).unwrap_or_default();
        LedgerEntry {
            kind: EntryKind::Medical(record),
            raw,
        }
    }
}
