use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::canonical::canonical_json;
use super::transaction::LedgerEntry;

/// Number of leading zero hex characters required in a proof hash.
/// Miner and validator must agree on this value.
pub const MINING_DIFFICULTY: usize = 2;

/// Reduces a transaction set to the fields covered by the proof of work
///
/// Transfers keep sender, recipient and amount; medical records keep type,
/// patient, doctor and record type. Ciphertext and signatures are excluded so
/// that validation does not depend on encryption state. Values are taken from
/// each entry's JSON as stored, so an integer amount stays an integer.
/// Entries with neither shape are left out.
pub fn proof_view(transactions: &[LedgerEntry]) -> Vec<Value> {
    transactions
        .iter()
        .filter_map(|entry| raw_proof_view(entry.raw()))
        .collect()
}

fn raw_proof_view(value: &Value) -> Option<Value> {
    let object = value.as_object()?;

    if ["sender", "recipient", "amount"].iter().all(|key| object.contains_key(*key)) {
        return Some(json!({
            "sender": object["sender"],
            "recipient": object["recipient"],
            "amount": object["amount"],
        }));
    }

    if object.get("type").and_then(Value::as_str) == Some("MEDICAL_RECORD") {
        let field = |key: &str| object.get(key).cloned().unwrap_or(Value::Null);
        return Some(json!({
            "type": "MEDICAL_RECORD",
            "patient_id": field("patient_id"),
            "doctor_id": field("doctor_id"),
            "record_type": field("record_type"),
        }));
    }

    None
}

/// Canonical string of a transaction set's proof view
fn proof_prefix(transactions: &[LedgerEntry], last_hash: &str) -> String {
    let view = canonical_json(&proof_view(transactions)).unwrap_or_default();
    format!("{}{}", view, last_hash)
}

fn meets_difficulty(prefix: &str, nonce: u64, difficulty: usize) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    let guess_hash = format!("{:x}", hasher.finalize());

    guess_hash.len() >= difficulty && guess_hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Validates a proof of work
///
/// The proof is valid if `sha256(view + last_hash + nonce)` starts with
/// `difficulty` zero characters, where `view` is the canonical JSON of the
/// transactions' proof view.
pub fn valid_proof(
    transactions: &[LedgerEntry],
    last_hash: &str,
    nonce: u64,
    difficulty: usize,
) -> bool {
    meets_difficulty(&proof_prefix(transactions, last_hash), nonce, difficulty)
}

/// Searches for a valid nonce, starting from zero
///
/// The loop is unbounded and has no cancellation point; callers needing a
/// deadline must run it on a worker they can abandon.
pub fn find_nonce(transactions: &[LedgerEntry], last_hash: &str, difficulty: usize) -> u64 {
    let prefix = proof_prefix(transactions, last_hash);

    let mut nonce = 0;
    while !meets_difficulty(&prefix, nonce, difficulty) {
        nonce += 1;
    }

    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::medical::{MedicalRecord, RecordType};
    use crate::blockchain::transaction::Transaction;

    fn entries() -> Vec<LedgerEntry> {
        vec![
            Transaction::new("sender-address-1", "recipient-address", 4.0, "deadbeef").into(),
            MedicalRecord::new(
                "patient-1",
                "doctor-1",
                RecordType::LabResult,
                Some("cipher".into()),
                None,
            )
            .into(),
        ]
    }

    #[test]
    fn test_found_nonce_is_valid() {
        let transactions = entries();
        let last_hash = "ab".repeat(32);

        let nonce = find_nonce(&transactions, &last_hash, MINING_DIFFICULTY);
        assert!(valid_proof(&transactions, &last_hash, nonce, MINING_DIFFICULTY));

        let view = canonical_json(&proof_view(&transactions)).unwrap();
        let guess = format!("{}{}{}", view, last_hash, nonce);
        let digest = format!("{:x}", Sha256::digest(guess.as_bytes()));
        assert!(digest.starts_with("00"));
    }

    #[test]
    fn test_first_valid_nonce_is_returned() {
        let transactions = entries();
        let nonce = find_nonce(&transactions, "00", MINING_DIFFICULTY);

        for smaller in 0..nonce {
            assert!(!valid_proof(&transactions, "00", smaller, MINING_DIFFICULTY));
        }
    }

    #[test]
    fn test_proof_view_excludes_ciphertext_and_signatures() {
        let view = proof_view(&entries());

        assert_eq!(
            view[0],
            json!({"sender": "sender-address-1", "recipient": "recipient-address", "amount": 4.0})
        );
        assert_eq!(
            view[1],
            json!({
                "type": "MEDICAL_RECORD",
                "patient_id": "patient-1",
                "doctor_id": "doctor-1",
                "record_type": "lab_result",
            })
        );

        // Re-encrypting a record does not change its proof view
        let mut reencrypted = entries();
        let mut record = reencrypted[1].as_medical().cloned().unwrap();
        record.data = Some("other cipher".into());
        reencrypted[1] = record.into();
        assert_eq!(proof_view(&reencrypted), view);
    }

    #[test]
    fn test_unrecognized_entries() {
        let transactions = vec![
            LedgerEntry::from_raw(json!({"memo": "ignored"})),
            LedgerEntry::from_raw(json!({"type": "MEDICAL_RECORD", "patient_id": "p"})),
        ];

        let view = proof_view(&transactions);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0]["patient_id"], "p");
        assert_eq!(view[0]["record_type"], Value::Null);
    }

    #[test]
    fn test_integer_amounts_keep_their_form() {
        let reward = LedgerEntry::from_raw(json!({
            "sender": "THE BLOCKCHAIN", "recipient": "miner-address", "amount": 1
        }));

        let view = canonical_json(&proof_view(&[reward])).unwrap();
        assert_eq!(
            view,
            r#"[{"amount": 1, "recipient": "miner-address", "sender": "THE BLOCKCHAIN"}]"#
        );
    }

    #[test]
    fn test_zero_difficulty_accepts_any_nonce() {
        assert!(valid_proof(&[], "00", 12345, 0));
        assert_eq!(find_nonce(&[], "00", 0), 0);
    }
}
