// Blockchain module
//
// This module contains the ledger engine including:
// - Block structure and canonical hashing
// - Financial transactions and medical records
// - Record encryption and signature verification
// - Proof of work algorithm
// - Peer registry and longest-chain consensus
// - Key store and block storage

pub mod block;
pub mod canonical;
pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod keystore;
pub mod medical;
pub mod proof_of_work;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Ledger, LedgerError};
pub use consensus::{ChainSnapshot, ChainSource, HttpChainSource};
pub use keystore::{FileSecretStore, MemorySecretStore, SecretStore};
pub use medical::{ConsentAction, RecordType, RecordView};
pub use transaction::{LedgerEntry, Transaction};
