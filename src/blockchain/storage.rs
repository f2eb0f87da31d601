use std::path::Path;

use log::warn;
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Inconsistent storage: {0}")]
    Inconsistent(String),
}

/// Durable storage for the chain
///
/// Blocks are stored as JSON in the `blocks` tree, keyed by their big-endian
/// index so that iteration yields chain order.
pub struct BlockStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl std::fmt::Debug for BlockStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStorage").finish()
    }
}

impl BlockStorage {
    /// Opens the storage at `path`, creating it if needed
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self { db, blocks, metadata })
    }

    fn encode(block: &Block) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(block).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    /// Saves a block and records it as the latest block
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.index.to_be_bytes(), Self::encode(block)?)?;
        self.metadata
            .insert("latest_block_hash", block.calculate_hash().as_bytes())?;

        self.flush()
    }

    /// Replaces every stored block with `chain`
    pub fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for key in self.blocks.iter().keys() {
            batch.remove(key?);
        }
        for block in chain {
            batch.insert(&block.index.to_be_bytes()[..], Self::encode(block)?);
        }
        self.blocks.apply_batch(batch)?;

        match chain.last() {
            Some(last) => {
                self.metadata
                    .insert("latest_block_hash", last.calculate_hash().as_bytes())?;
            }
            None => {
                self.metadata.remove("latest_block_hash")?;
            }
        }

        self.flush()
    }

    /// Loads the stored chain
    ///
    /// The last readable block must hash to the recorded latest block hash,
    /// so a chain whose head was lost or corrupted is refused.
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let blocks = self.get_all_blocks()?;
        let head = blocks.last().map(Block::calculate_hash);
        let latest = self.latest_block_hash()?;

        if head != latest {
            return Err(StorageError::Inconsistent(format!(
                "last stored block hashes to {:?} but the latest block hash is {:?}",
                head, latest
            )));
        }

        Ok(blocks)
    }

    /// Gets all blocks in chain order
    ///
    /// Blocks that fail to deserialize are skipped with a warning; an error is
    /// returned only if none of the stored blocks can be read.
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            match serde_json::from_slice::<Block>(&value) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    deserialization_errors.push(format!(
                        "Failed to deserialize block {:?}: {}",
                        key.as_ref(),
                        e
                    ));
                }
            }
        }

        if !deserialization_errors.is_empty() {
            if blocks.is_empty() {
                return Err(StorageError::DeserializationError(format!(
                    "Failed to deserialize any blocks: {}",
                    deserialization_errors.join(", ")
                )));
            }
            warn!("Some blocks could not be deserialized: {}", deserialization_errors.join(", "));
        }

        Ok(blocks)
    }

    fn latest_block_hash(&self) -> Result<Option<String>, StorageError> {
        let value = self.metadata.get("latest_block_hash")?;
        Ok(value.map(|value| String::from_utf8_lossy(&value).to_string()))
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
