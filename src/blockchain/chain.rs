use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use std::sync::Arc;

use super::block::{now_seconds, Block};
use super::consensus::{
    select_longest_chain, validate_chain, ChainSource, HttpChainSource, NodeRegistry, PeerError,
    DEFAULT_PEER_TIMEOUT,
};
use super::crypto::{verify_signature, CryptoError, RecordCipher};
use super::keystore::{KeyStoreError, SecretStore};
use super::medical::{
    ConsentAction, ConsentGrants, ConsentPayload, MedicalRecord, RecordError, RecordType,
    RecordView, ENCRYPTED_SENTINEL,
};
use super::proof_of_work::{find_nonce, MINING_DIFFICULTY};
use super::storage::{BlockStorage, StorageError};
use super::transaction::{LedgerEntry, Transaction, TransactionError, MINING_REWARD, MINING_SENDER};

/// Record signature accepted without verification in test builds
#[cfg(any(test, feature = "test-fixtures"))]
pub const SKIP_VERIFICATION_SIGNATURE: &str = "DEBUG_SKIP_VERIFICATION";

#[cfg(any(test, feature = "test-fixtures"))]
fn is_skip_fixture(signature: &str) -> bool {
    signature == SKIP_VERIFICATION_SIGNATURE
}

#[cfg(not(any(test, feature = "test-fixtures")))]
fn is_skip_fixture(_signature: &str) -> bool {
    false
}

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid record type: {0}")]
    InvalidRecordType(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Key store error: {0}")]
    KeyStoreError(#[from] KeyStoreError),

    #[error("Peer client error: {0}")]
    PeerError(#[from] PeerError),

    #[error("Block {0} not found")]
    BlockNotFound(u64),
}

impl From<RecordError> for LedgerError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::InvalidRecordType(record_type) => {
                LedgerError::InvalidRecordType(record_type)
            }
            RecordError::SerializationError(reason) => LedgerError::EncryptionFailure(reason),
        }
    }
}

impl From<CryptoError> for LedgerError {
    fn from(err: CryptoError) -> Self {
        LedgerError::EncryptionFailure(err.to_string())
    }
}

/// Chain and pending pool, guarded together
#[derive(Debug)]
struct ChainState {
    chain: Vec<Block>,
    pending: Vec<LedgerEntry>,
    /// Bumped whenever a block is sealed or the chain is replaced
    epoch: u64,
}

impl ChainState {
    fn last_hash(&self) -> String {
        self.chain.last().map(Block::calculate_hash).unwrap_or_default()
    }

    fn next_index(&self) -> u64 {
        self.chain.len() as u64 + 1
    }
}

/// The ledger engine
///
/// Cloning yields another handle onto the same ledger. Admission, sealing and
/// chain replacement serialize on one lock over the chain and pending pool;
/// proof-of-work search and signature checks run outside it.
#[derive(Clone)]
pub struct Ledger {
    state: Arc<RwLock<ChainState>>,

    /// Registered peers
    nodes: Arc<NodeRegistry>,

    /// Cipher for medical payloads, keyed once at construction
    cipher: Arc<RecordCipher>,

    /// Where peer chains are fetched from
    peers: Arc<dyn ChainSource>,

    /// Storage for blockchain data
    storage: Option<Arc<BlockStorage>>,

    /// Mining difficulty (number of leading zeros required in hash)
    difficulty: usize,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("length", &self.len())
            .field("nodes", &self.nodes.len())
            .field("difficulty", &self.difficulty)
            .finish()
    }
}

impl Ledger {
    /// Creates an in-memory ledger with a genesis block
    ///
    /// # Arguments
    ///
    /// * `secrets` - Source of the durable encryption secret
    pub fn new(secrets: &dyn SecretStore) -> Result<Self, LedgerError> {
        let secret = secrets.get_or_create_secret()?;
        let peers = HttpChainSource::new(DEFAULT_PEER_TIMEOUT)?;

        Ok(Ledger {
            state: Arc::new(RwLock::new(ChainState {
                chain: vec![Block::genesis()],
                pending: Vec::new(),
                epoch: 0,
            })),
            nodes: Arc::new(NodeRegistry::new()),
            cipher: Arc::new(RecordCipher::from_secret(&secret)),
            peers: Arc::new(peers),
            storage: None,
            difficulty: MINING_DIFFICULTY,
        })
    }

    /// Creates a ledger backed by persistent storage
    ///
    /// Loads the stored chain, or creates and persists a genesis block if the
    /// storage is empty. Fails if the stored head does not match its recorded
    /// hash.
    pub fn with_storage<P: AsRef<std::path::Path>>(
        storage_path: P,
        secrets: &dyn SecretStore,
    ) -> Result<Self, LedgerError> {
        let storage = BlockStorage::new(storage_path)?;
        let mut ledger = Ledger::new(secrets)?;

        let blocks = storage.load_chain()?;
        if blocks.is_empty() {
            info!("No existing blockchain found in storage, creating genesis block");
            storage.replace_chain(&ledger.chain())?;
        } else {
            info!("Loaded {} blocks from storage", blocks.len());
            ledger.state.write().chain = blocks;
        }

        ledger.storage = Some(Arc::new(storage));
        Ok(ledger)
    }

    /// Uses `source` to fetch peer chains during conflict resolution
    pub fn with_chain_source(mut self, source: Arc<dyn ChainSource>) -> Self {
        self.peers = source;
        self
    }

    /// Gets the entire blockchain
    pub fn chain(&self) -> Vec<Block> {
        self.state.read().chain.clone()
    }

    /// Gets the number of blocks in the chain
    pub fn len(&self) -> usize {
        self.state.read().chain.len()
    }

    /// Checks if the chain has no blocks
    pub fn is_empty(&self) -> bool {
        self.state.read().chain.is_empty()
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> Option<Block> {
        self.state.read().chain.last().cloned()
    }

    /// Gets a block by its index (the genesis block has index 1)
    pub fn block(&self, index: u64) -> Result<Block, LedgerError> {
        let state = self.state.read();
        index
            .checked_sub(1)
            .and_then(|position| state.chain.get(position as usize))
            .cloned()
            .ok_or(LedgerError::BlockNotFound(index))
    }

    /// Gets all pending transactions and records
    pub fn pending(&self) -> Vec<LedgerEntry> {
        self.state.read().pending.clone()
    }

    /// Hash of a block
    pub fn hash(block: &Block) -> String {
        block.calculate_hash()
    }

    /// Appends an entry to the pending pool
    ///
    /// # Returns
    ///
    /// The index of the block that will include the entry
    fn admit(&self, entry: LedgerEntry) -> u64 {
        let mut state = self.state.write();
        state.pending.push(entry);
        state.next_index()
    }

    /// Writes `block` to storage, then appends it and removes the first
    /// `sealed` pending entries, all under the caller's write lock
    fn append_block(
        &self,
        state: &mut ChainState,
        block: Block,
        sealed: usize,
    ) -> Result<Block, LedgerError> {
        if let Some(storage) = &self.storage {
            storage.save_block(&block)?;
        }

        state.pending.drain(..sealed);
        state.chain.push(block.clone());
        state.epoch += 1;

        info!("Sealed block {} with {} transactions", block.index, block.transactions.len());
        Ok(block)
    }

    /// Seals all pending transactions into a new block
    ///
    /// # Arguments
    ///
    /// * `nonce` - The proof of work for the block
    /// * `previous_hash` - Hash of the previous block; computed from the last
    ///   block when omitted
    ///
    /// # Returns
    ///
    /// The newly appended block
    pub fn new_block(
        &self,
        nonce: u64,
        previous_hash: Option<String>,
    ) -> Result<Block, LedgerError> {
        let mut state = self.state.write();

        let previous_hash = previous_hash.unwrap_or_else(|| state.last_hash());
        let transactions = state.pending.clone();
        let sealed = transactions.len();
        let block = Block::new(state.next_index(), transactions, nonce, previous_hash);

        self.append_block(&mut state, block, sealed)
    }

    /// Finds a nonce for the current pending pool and last block
    pub fn proof_of_work(&self) -> u64 {
        let (transactions, last_hash) = {
            let state = self.state.read();
            (state.pending.clone(), state.last_hash())
        };

        find_nonce(&transactions, &last_hash, self.difficulty)
    }

    /// Mines a new block with the pending transactions
    ///
    /// Admits a mining reward for `reward_recipient`, then searches for a proof
    /// over a snapshot of the pending pool without holding the lock. The
    /// snapshot is sealed only if no block was sealed in the meantime;
    /// otherwise the search restarts. Entries admitted during the search stay
    /// pending for the next block.
    ///
    /// This blocks the calling thread for the whole search.
    pub fn mine(&self, reward_recipient: &str) -> Result<Block, LedgerError> {
        let difficulty = self.difficulty;
        self.mine_with(reward_recipient, |transactions, last_hash| {
            find_nonce(transactions, last_hash, difficulty)
        })
    }

    /// `mine` with the nonce search supplied by the caller
    fn mine_with<F>(&self, reward_recipient: &str, mut search: F) -> Result<Block, LedgerError>
    where
        F: FnMut(&[LedgerEntry], &str) -> u64,
    {
        self.submit_transaction(MINING_SENDER, reward_recipient, MINING_REWARD, "")?;

        loop {
            let (transactions, last_hash, epoch) = {
                let state = self.state.read();
                (state.pending.clone(), state.last_hash(), state.epoch)
            };

            let nonce = search(&transactions, &last_hash);

            let mut state = self.state.write();
            if state.epoch != epoch {
                debug!("Chain head moved while mining, retrying");
                continue;
            }

            let sealed = transactions.len();
            let block = Block::new(state.next_index(), transactions, nonce, last_hash);
            return self.append_block(&mut state, block, sealed);
        }
    }

    /// Adds a financial transaction after verifying its signature
    ///
    /// Mining rewards (from `MINING_SENDER`) are admitted without a signature.
    ///
    /// # Returns
    ///
    /// The index of the block that will include the transaction
    pub fn submit_transaction(
        &self,
        sender: &str,
        recipient: &str,
        amount: f64,
        signature: &str,
    ) -> Result<u64, LedgerError> {
        let transaction = Transaction::new(sender, recipient, amount, signature);
        transaction.validate()?;

        if !transaction.is_mining_reward() {
            let message = transaction.signing_payload()?;
            if !verify_signature(sender, signature, &message) {
                warn!("Transaction signature verification failed for sender {}", sender);
                return Err(LedgerError::InvalidSignature);
            }
        }

        Ok(self.admit(transaction.into()))
    }

    /// Adds an encrypted medical record after verifying the author's signature
    ///
    /// # Arguments
    ///
    /// * `patient_id` - The patient the record belongs to
    /// * `doctor_id` - The author; its hex public key verifies `signature`
    /// * `record_type` - One of the `RecordType` names
    /// * `medical_data` - The payload to encrypt; null stores no payload
    /// * `access_list` - Readers of the record, defaulting to patient and doctor
    /// * `signature` - Signature over the record's signing payload
    ///
    /// # Returns
    ///
    /// The index of the block that will include the record
    pub fn new_medical_record(
        &self,
        patient_id: &str,
        doctor_id: &str,
        record_type: &str,
        medical_data: Value,
        access_list: Option<Vec<String>>,
        signature: Option<&str>,
    ) -> Result<u64, LedgerError> {
        let record_type: RecordType = record_type.parse()?;

        let encrypted = match self.cipher.encrypt(&medical_data) {
            Ok(encrypted) => encrypted,
            Err(err) => {
                error!("Failed to encrypt medical data: {}", err);
                return Err(err.into());
            }
        };

        let record = MedicalRecord::new(patient_id, doctor_id, record_type, encrypted, access_list);

        if doctor_id != MINING_SENDER && !self.verify_record_signature(&record, signature)? {
            warn!("Record signature verification failed for doctor_id: {}", doctor_id);
            return Err(LedgerError::InvalidSignature);
        }

        Ok(self.admit(record.into()))
    }

    fn verify_record_signature(
        &self,
        record: &MedicalRecord,
        signature: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let signature = match signature {
            Some(signature) if !signature.is_empty() => signature,
            _ => {
                error!("Missing signature for record verification");
                return Ok(false);
            }
        };

        if is_skip_fixture(signature) {
            warn!("Skipping record signature verification for test fixture");
            return Ok(true);
        }

        let message = record.signing_payload()?;
        Ok(verify_signature(&record.doctor_id, signature, &message))
    }

    /// Records a patient's consent decision for a provider
    ///
    /// The consent is a `patient_consent` record authored and signed by the
    /// patient, readable by the patient and the provider. `record_types`
    /// defaults to every record type.
    pub fn submit_consent(
        &self,
        patient_id: &str,
        provider_id: &str,
        action: ConsentAction,
        record_types: Option<Vec<RecordType>>,
        expiration: Option<f64>,
        signature: Option<&str>,
    ) -> Result<u64, LedgerError> {
        let consent = ConsentPayload {
            action,
            provider_id: provider_id.to_string(),
            record_types: record_types.unwrap_or_else(|| RecordType::ALL.to_vec()),
            timestamp: now_seconds(),
            expiration,
        };

        let payload = serde_json::to_value(&consent)
            .map_err(|e| LedgerError::EncryptionFailure(e.to_string()))?;

        self.new_medical_record(
            patient_id,
            patient_id,
            RecordType::PatientConsent.as_str(),
            payload,
            Some(vec![patient_id.to_string(), provider_id.to_string()]),
            signature,
        )
    }

    /// Retrieves the records of a patient that `requester_id` may read
    ///
    /// A record is readable if the requester is on its access list or holds an
    /// active consent grant from the patient for its record type. Readable
    /// payloads are decrypted; payloads that fail to decrypt are replaced by
    /// `"ENCRYPTED"`. Records are returned in chain order.
    pub fn get_patient_records(
        &self,
        patient_id: &str,
        requester_id: &str,
        record_type: Option<&str>,
    ) -> Vec<RecordView> {
        let candidates: Vec<(u64, MedicalRecord)> = {
            let state = self.state.read();
            state
                .chain
                .iter()
                .flat_map(|block| {
                    block
                        .transactions
                        .iter()
                        .filter_map(LedgerEntry::as_medical)
                        .filter(move |record| record.patient_id == patient_id)
                        .map(move |record| (block.index, record.clone()))
                })
                .collect()
        };

        let grants = self.consent_grants(patient_id, &candidates);
        let now = now_seconds();

        candidates
            .into_iter()
            .filter(|(_, record)| {
                record_type.map_or(true, |wanted| record.record_type.as_str() == wanted)
            })
            .filter(|(_, record)| {
                record.is_listed(requester_id)
                    || grants.allows(requester_id, record.record_type, now)
            })
            .map(|(block_index, record)| {
                let data = match record.data.as_deref() {
                    Some(ciphertext) if !ciphertext.is_empty() => self
                        .cipher
                        .decrypt(Some(ciphertext), true)
                        .unwrap_or_else(|| Value::String(ENCRYPTED_SENTINEL.to_string())),
                    _ => Value::Null,
                };
                RecordView::new(block_index, record, data)
            })
            .collect()
    }

    /// Folds the patient's own consent records, in chain order
    fn consent_grants(&self, patient_id: &str, records: &[(u64, MedicalRecord)]) -> ConsentGrants {
        let mut grants = ConsentGrants::default();

        for (block_index, record) in records {
            if record.record_type != RecordType::PatientConsent || record.doctor_id != patient_id {
                continue;
            }

            let payload = self
                .cipher
                .decrypt(record.data.as_deref(), true)
                .and_then(|value| serde_json::from_value::<ConsentPayload>(value).ok());

            match payload {
                Some(consent) => grants.apply(&consent),
                None => warn!("Skipping unreadable consent record in block {}", block_index),
            }
        }

        grants
    }

    /// Registers a peer node
    ///
    /// # Returns
    ///
    /// The stored `host:port` identifier
    pub fn register_node(&self, address: &str) -> Result<String, LedgerError> {
        self.nodes
            .register(address)
            .ok_or_else(|| LedgerError::InvalidAddress(address.to_string()))
    }

    /// Gets all registered peer nodes
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.list()
    }

    /// Validates a candidate chain
    pub fn valid_chain(&self, chain: &[Block]) -> bool {
        match validate_chain(chain, self.difficulty) {
            Ok(()) => true,
            Err(reason) => {
                warn!("Chain validation failed: {}", reason);
                false
            }
        }
    }

    /// Validates the local chain
    pub fn is_valid(&self) -> bool {
        let chain = self.state.read();
        self.valid_chain(&chain.chain)
    }

    /// Adopts the longest valid chain among registered peers
    ///
    /// Peer chains are fetched concurrently; unreachable peers and malformed or
    /// invalid chains are logged and skipped. The local chain is replaced only
    /// if the winning chain is still longer when the lock is taken.
    ///
    /// # Returns
    ///
    /// true if the local chain was replaced
    pub async fn resolve_conflicts(&self) -> Result<bool, LedgerError> {
        let nodes = self.nodes.list();
        if nodes.is_empty() {
            return Ok(false);
        }

        let local_length = self.len() as u64;
        let fetches = nodes.iter().map(|node| self.peers.fetch_chain(node));
        let responses = nodes.iter().cloned().zip(join_all(fetches).await).collect();

        let candidate = match select_longest_chain(local_length, responses, self.difficulty) {
            Some(candidate) => candidate,
            None => return Ok(false),
        };

        let mut state = self.state.write();
        if candidate.len() <= state.chain.len() {
            debug!("Local chain grew past the peer candidate during resolution");
            return Ok(false);
        }

        if let Some(storage) = &self.storage {
            storage.replace_chain(&candidate)?;
        }

        state.chain = candidate;
        state.epoch += 1;

        info!("Chain replaced with longer chain of length {}", state.chain.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::consensus::test_support::{
        chain_with_indices, mined_chain, StaticChainSource,
    };
    use crate::blockchain::consensus::ChainSnapshot;
    use crate::blockchain::crypto::test_keys::{alice, bob};
    use crate::blockchain::keystore::MemorySecretStore;
    use crate::blockchain::medical::record_signing_payload;
    use crate::blockchain::proof_of_work::valid_proof;
    use crate::blockchain::transaction::signing_payload;
    use serde_json::json;
    use tempfile::TempDir;

    const MINER: &str = "node-identifier-0001";
    const PATIENT: &str = "patient-000123";

    fn ledger() -> Ledger {
        Ledger::new(&MemorySecretStore::new(b"test secret".to_vec())).unwrap()
    }

    fn signed_transfer(ledger: &Ledger, amount: f64) -> Result<u64, LedgerError> {
        let recipient = bob().address();
        let payload = signing_payload(alice().address(), recipient, amount).unwrap();
        let signature = alice().sign(&payload);
        ledger.submit_transaction(alice().address(), recipient, amount, &signature)
    }

    /// Adds a record authored by alice, signed over the default access list
    fn signed_record(
        ledger: &Ledger,
        record_type: RecordType,
        data: Value,
    ) -> Result<u64, LedgerError> {
        let doctor = alice().address();
        let access_list = vec![PATIENT.to_string(), doctor.to_string()];
        let payload = record_signing_payload(PATIENT, doctor, record_type, &access_list).unwrap();
        let signature = alice().sign(&payload);
        let record_type = record_type.as_str();
        ledger.new_medical_record(PATIENT, doctor, record_type, data, None, Some(&signature))
    }

    #[test]
    fn test_new_blockchain() {
        let ledger = ledger();
        let chain = ledger.chain();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 1);
        assert_eq!(chain[0].nonce, 0);
        assert_eq!(chain[0].previous_hash, "00");
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn test_submit_signed_transaction() {
        let ledger = ledger();

        assert_eq!(signed_transfer(&ledger, 10.0).unwrap(), 2);

        let pending = ledger.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].as_transfer().unwrap().amount, 10.0);
    }

    #[test]
    fn test_forged_transaction_is_rejected() {
        let ledger = ledger();
        let recipient = bob().address();
        // Signed by bob, claims to come from alice
        let signature = bob().sign(&signing_payload(alice().address(), recipient, 5.0).unwrap());

        let result = ledger.submit_transaction(alice().address(), recipient, 5.0, &signature);
        assert!(matches!(result, Err(LedgerError::InvalidSignature)));

        // Signature over a different amount
        let signature = alice().sign(&signing_payload(alice().address(), recipient, 5.0).unwrap());
        let result = ledger.submit_transaction(alice().address(), recipient, 50.0, &signature);
        assert!(matches!(result, Err(LedgerError::InvalidSignature)));

        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn test_transaction_validation_happens_before_admission() {
        let ledger = ledger();

        let result = ledger.submit_transaction(alice().address(), bob().address(), -1.0, "abcd");
        assert!(matches!(
            result,
            Err(LedgerError::InvalidTransaction(TransactionError::InvalidAmount(_)))
        ));

        let result = ledger.submit_transaction(alice().address(), bob().address(), 1.0, "");
        assert!(matches!(
            result,
            Err(LedgerError::InvalidTransaction(TransactionError::MissingSignature))
        ));

        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn test_mining_reward_is_sealed_unchanged() {
        let ledger = ledger();

        assert_eq!(ledger.submit_transaction(MINING_SENDER, MINER, MINING_REWARD, "").unwrap(), 2);

        let nonce = ledger.proof_of_work();
        let block = ledger.new_block(nonce, None).unwrap();

        assert_eq!(block.index, 2);
        assert_eq!(block.transactions, vec![LedgerEntry::from(Transaction::mining_reward(MINER))]);
        assert_eq!(
            serde_json::to_value(&block.transactions[0]).unwrap(),
            json!({"sender": MINING_SENDER, "recipient": MINER, "amount": MINING_REWARD})
        );
        assert!(ledger.pending().is_empty());
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_proof_of_work_is_valid_for_pending_pool() {
        let ledger = ledger();
        signed_transfer(&ledger, 3.0).unwrap();

        let nonce = ledger.proof_of_work();
        let last_hash = ledger.last_block().unwrap().calculate_hash();

        assert!(valid_proof(&ledger.pending(), &last_hash, nonce, MINING_DIFFICULTY));
    }

    #[test]
    fn test_mine_block() {
        let ledger = ledger();
        signed_transfer(&ledger, 10.0).unwrap();

        let block = ledger.mine(MINER).unwrap();

        assert_eq!(block.index, 2);
        assert_eq!(block.transactions.len(), 2); // Original transaction + mining reward
        assert_eq!(block.transactions[1].as_transfer().unwrap().sender, MINING_SENDER);
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn test_entries_admitted_while_mining_stay_pending() {
        let ledger = ledger();
        let mut calls = 0;

        let block = ledger
            .mine_with(MINER, |transactions, last_hash| {
                calls += 1;
                if calls == 1 {
                    signed_transfer(&ledger, 7.0).unwrap();
                }
                find_nonce(transactions, last_hash, MINING_DIFFICULTY)
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].as_transfer().unwrap().is_mining_reward());

        let pending = ledger.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].as_transfer().unwrap().amount, 7.0);

        let next = ledger.mine(MINER).unwrap();
        assert_eq!(next.transactions[0], pending[0]);
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_mining_retries_when_a_block_is_sealed_meanwhile() {
        let ledger = ledger();
        let mut calls = 0;

        let block = ledger
            .mine_with(MINER, |transactions, last_hash| {
                calls += 1;
                if calls == 1 {
                    // Another miner seals the pending pool, reward included
                    let nonce = ledger.proof_of_work();
                    ledger.new_block(nonce, None).unwrap();
                }
                find_nonce(transactions, last_hash, MINING_DIFFICULTY)
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(block.index, 3);
        assert!(block.transactions.is_empty());

        let chain = ledger.chain();
        assert_eq!(chain.len(), 3);
        let rewards = chain
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter_map(LedgerEntry::as_transfer)
            .filter(|transfer| transfer.is_mining_reward())
            .count();
        assert_eq!(rewards, 1);
        assert!(ledger.pending().is_empty());
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_chain_linkage() {
        let ledger = ledger();
        for _ in 0..4 {
            signed_transfer(&ledger, 1.5).unwrap();
            ledger.mine(MINER).unwrap();
        }

        let chain = ledger.chain();
        assert_eq!(chain.len(), 5);
        for i in 1..chain.len() {
            assert_eq!(chain[i].previous_hash, chain[i - 1].calculate_hash());
            assert_eq!(chain[i].index, chain[i - 1].index + 1);
        }
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_block_lookup() {
        let ledger = ledger();
        ledger.mine(MINER).unwrap();

        assert_eq!(ledger.block(1).unwrap().previous_hash, "00");
        assert_eq!(ledger.block(2).unwrap().index, 2);
        assert!(matches!(ledger.block(0), Err(LedgerError::BlockNotFound(0))));
        assert!(matches!(ledger.block(3), Err(LedgerError::BlockNotFound(3))));
    }

    #[test]
    fn test_invalid_record_type_leaves_pool_unchanged() {
        let ledger = ledger();

        let result = ledger.new_medical_record(
            PATIENT,
            alice().address(),
            "not_a_type",
            json!({"note": "x"}),
            None,
            Some(SKIP_VERIFICATION_SIGNATURE),
        );

        assert!(matches!(result, Err(LedgerError::InvalidRecordType(t)) if t == "not_a_type"));
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn test_medical_record_is_encrypted_at_rest() {
        let ledger = ledger();
        let data = json!({"diagnosis": "Common cold"});
        let index = signed_record(&ledger, RecordType::DiagnosticReport, data).unwrap();
        assert_eq!(index, 2);

        let pending = ledger.pending();
        let record = pending[0].as_medical().unwrap();
        assert_eq!(record.access_list, vec![PATIENT, alice().address()]);

        let stored = serde_json::to_string(&pending[0]).unwrap();
        assert!(!stored.contains("Common cold"));
    }

    #[test]
    fn test_record_signature_is_checked() {
        let ledger = ledger();
        let doctor = alice().address();
        let access_list = vec![PATIENT.to_string(), doctor.to_string()];
        let message =
            record_signing_payload(PATIENT, doctor, RecordType::Prescription, &access_list)
                .unwrap();

        // Signed by the wrong key
        let result = ledger.new_medical_record(
            PATIENT,
            doctor,
            "prescription",
            json!("amoxicillin"),
            None,
            Some(&bob().sign(&message)),
        );
        assert!(matches!(result, Err(LedgerError::InvalidSignature)));

        // Missing signature
        let data = json!("amoxicillin");
        let result = ledger.new_medical_record(PATIENT, doctor, "prescription", data, None, None);
        assert!(matches!(result, Err(LedgerError::InvalidSignature)));

        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn test_system_records_skip_verification() {
        let ledger = ledger();
        let data = json!({"dose": 2});
        let result =
            ledger.new_medical_record(PATIENT, MINING_SENDER, "vaccination", data, None, None);
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_get_patient_records_enforces_access_list() {
        let ledger = ledger();
        signed_record(&ledger, RecordType::LabResult, json!({"hba1c": 5.4})).unwrap();
        signed_record(&ledger, RecordType::Prescription, json!("metformin")).unwrap();
        ledger.mine(MINER).unwrap();

        let records = ledger.get_patient_records(PATIENT, PATIENT, None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, json!({"hba1c": 5.4}));
        assert_eq!(records[1].data, json!("metformin"));
        assert_eq!(records[0].block_index, 2);

        let records = ledger.get_patient_records(PATIENT, alice().address(), Some("prescription"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, RecordType::Prescription);

        assert!(ledger.get_patient_records(PATIENT, "stranger-9999", None).is_empty());
        assert!(ledger.get_patient_records("someone-else", PATIENT, None).is_empty());
    }

    #[test]
    fn test_pending_records_are_not_returned() {
        let ledger = ledger();
        signed_record(&ledger, RecordType::VitalSigns, json!({"bpm": 70})).unwrap();

        assert!(ledger.get_patient_records(PATIENT, PATIENT, None).is_empty());
    }

    #[test]
    fn test_undecryptable_payload_degrades_to_sentinel() {
        let writer = ledger();
        signed_record(&writer, RecordType::ImagingReport, json!("no fracture")).unwrap();
        writer.mine(MINER).unwrap();

        // Another node with a different key adopts the chain
        let reader = Ledger::new(&MemorySecretStore::new(b"another secret".to_vec())).unwrap();
        {
            let mut state = reader.state.write();
            state.chain = writer.chain();
        }

        let records = reader.get_patient_records(PATIENT, PATIENT, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!(ENCRYPTED_SENTINEL));
    }

    #[test]
    fn test_consent_grants_and_revokes_access() {
        let ledger = ledger();
        let provider = "specialist-789";
        signed_record(&ledger, RecordType::LabResult, json!({"ldl": 130})).unwrap();
        signed_record(&ledger, RecordType::Prescription, json!("statin")).unwrap();
        ledger.mine(MINER).unwrap();

        assert!(ledger.get_patient_records(PATIENT, provider, None).is_empty());

        ledger
            .submit_consent(
                PATIENT,
                provider,
                ConsentAction::Grant,
                Some(vec![RecordType::LabResult]),
                None,
                Some(SKIP_VERIFICATION_SIGNATURE),
            )
            .unwrap();
        ledger.mine(MINER).unwrap();

        let records = ledger.get_patient_records(PATIENT, provider, None);
        let types: Vec<RecordType> = records.iter().map(|r| r.record_type).collect();
        // The lab result through consent, the consent record through its access list
        assert_eq!(types, vec![RecordType::LabResult, RecordType::PatientConsent]);

        ledger
            .submit_consent(
                PATIENT,
                provider,
                ConsentAction::Revoke,
                Some(vec![RecordType::LabResult]),
                None,
                Some(SKIP_VERIFICATION_SIGNATURE),
            )
            .unwrap();
        ledger.mine(MINER).unwrap();

        let records = ledger.get_patient_records(PATIENT, provider, Some("lab_result"));
        assert!(records.is_empty());
    }

    #[test]
    fn test_expired_consent_grants_nothing() {
        let ledger = ledger();
        let provider = "specialist-789";
        signed_record(&ledger, RecordType::AllergyRecord, json!("penicillin")).unwrap();
        ledger
            .submit_consent(
                PATIENT,
                provider,
                ConsentAction::Grant,
                None,
                Some(now_seconds() - 60.0),
                Some(SKIP_VERIFICATION_SIGNATURE),
            )
            .unwrap();
        ledger.mine(MINER).unwrap();

        assert!(ledger.get_patient_records(PATIENT, provider, Some("allergy_record")).is_empty());
    }

    #[test]
    fn test_consent_by_someone_else_is_ignored() {
        let ledger = ledger();
        let provider = "specialist-789";
        signed_record(&ledger, RecordType::SurgeryRecord, json!("appendectomy")).unwrap();

        // A consent-shaped record for the patient, authored by the provider
        let consent = ConsentPayload {
            action: ConsentAction::Grant,
            provider_id: provider.to_string(),
            record_types: RecordType::ALL.to_vec(),
            timestamp: now_seconds(),
            expiration: None,
        };
        ledger
            .new_medical_record(
                PATIENT,
                provider,
                "patient_consent",
                serde_json::to_value(consent).unwrap(),
                Some(vec![PATIENT.to_string(), provider.to_string()]),
                Some(SKIP_VERIFICATION_SIGNATURE),
            )
            .unwrap();
        ledger.mine(MINER).unwrap();

        assert!(ledger.get_patient_records(PATIENT, provider, Some("surgery_record")).is_empty());
    }

    #[test]
    fn test_register_node() {
        let ledger = ledger();

        assert_eq!(ledger.register_node("http://192.168.0.5:5000").unwrap(), "192.168.0.5:5000");
        assert_eq!(ledger.register_node("192.168.0.5:5000").unwrap(), "192.168.0.5:5000");
        assert!(matches!(ledger.register_node(""), Err(LedgerError::InvalidAddress(_))));

        assert_eq!(ledger.nodes(), vec!["192.168.0.5:5000"]);
    }

    #[tokio::test]
    async fn test_resolve_conflicts_adopts_longest_valid_chain() {
        let longest = mined_chain(4, "miner-address-b");
        let source = StaticChainSource::default()
            .with_peer("node-a:5000", ChainSnapshot::new(mined_chain(1, "miner-address-a")))
            .with_peer("node-b:5000", ChainSnapshot::new(longest.clone()))
            .with_peer("node-c:5000", ChainSnapshot::new(mined_chain(2, "miner-address-c")));

        let ledger = ledger().with_chain_source(Arc::new(source));
        ledger.mine(MINER).unwrap();
        for node in ["node-a:5000", "node-b:5000", "node-c:5000"] {
            ledger.register_node(node).unwrap();
        }

        assert!(ledger.resolve_conflicts().await.unwrap());
        assert_eq!(ledger.chain(), longest);

        // Nobody is longer any more
        assert!(!ledger.resolve_conflicts().await.unwrap());
        assert_eq!(ledger.chain(), longest);
    }

    #[tokio::test]
    async fn test_resolve_conflicts_with_unreachable_peers() {
        let ledger = ledger().with_chain_source(Arc::new(StaticChainSource::default()));
        assert!(!ledger.resolve_conflicts().await.unwrap());

        ledger.register_node("10.0.0.9:5000").unwrap();
        assert!(!ledger.resolve_conflicts().await.unwrap());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflicts_rejects_invalid_chain() {
        let mut forged = mined_chain(5, "miner-address-f");
        forged[3].transactions = vec![Transaction::mining_reward("thief-address-1").into()];

        let source =
            StaticChainSource::default().with_peer("forger:5000", ChainSnapshot::new(forged));
        let ledger = ledger().with_chain_source(Arc::new(source));
        ledger.register_node("forger:5000").unwrap();

        assert!(!ledger.resolve_conflicts().await.unwrap());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflicts_rejects_repeated_indices() {
        let dir = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new(b"test secret".to_vec());

        let local = {
            let repeated = chain_with_indices(&[2, 2, 2], "miner-address-r");
            let source =
                StaticChainSource::default().with_peer("node-r:5000", ChainSnapshot::new(repeated));
            let ledger = Ledger::with_storage(dir.path(), &secrets)
                .unwrap()
                .with_chain_source(Arc::new(source));
            ledger.mine(MINER).unwrap();
            ledger.register_node("node-r:5000").unwrap();

            assert!(!ledger.resolve_conflicts().await.unwrap());
            assert_eq!(ledger.len(), 2);
            ledger.chain()
        };

        let reopened = Ledger::with_storage(dir.path(), &secrets).unwrap();
        assert_eq!(reopened.chain(), local);
    }

    #[test]
    fn test_corrupt_stored_head_is_refused() {
        let dir = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new(b"test secret".to_vec());

        {
            let ledger = Ledger::with_storage(dir.path(), &secrets).unwrap();
            ledger.mine(MINER).unwrap();
        }
        {
            let db = sled::open(dir.path()).unwrap();
            let blocks = db.open_tree("blocks").unwrap();
            blocks.insert(2u64.to_be_bytes(), &b"not json"[..]).unwrap();
            db.flush().unwrap();
        }

        let result = Ledger::with_storage(dir.path(), &secrets);
        assert!(matches!(
            result,
            Err(LedgerError::StorageError(StorageError::Inconsistent(_)))
        ));
    }

    #[test]
    fn test_chain_persists_across_restarts() {
        let dir = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new(b"test secret".to_vec());

        let chain = {
            let ledger = Ledger::with_storage(dir.path(), &secrets).unwrap();
            let notes = json!("follow up in 2 weeks");
            signed_record(&ledger, RecordType::ConsultationNotes, notes).unwrap();
            ledger.mine(MINER).unwrap();
            ledger.chain()
        };

        let reopened = Ledger::with_storage(dir.path(), &secrets).unwrap();
        assert_eq!(reopened.chain(), chain);
        assert!(reopened.is_valid());

        let records = reopened.get_patient_records(PATIENT, PATIENT, None);
        assert_eq!(records[0].data, json!("follow up in 2 weeks"));
    }
}
