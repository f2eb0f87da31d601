use async_trait::async_trait;
use dashmap::DashSet;
use log::warn;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::time::Duration;

use super::block::{Block, GENESIS_INDEX};
use super::proof_of_work::valid_proof;

/// Default timeout for fetching a peer's chain
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that can occur while fetching a peer's chain
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {peer} is unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Peer {peer} answered with status {status}")]
    Status { peer: String, status: u16 },

    #[error("Peer {peer} sent a malformed chain: {reason}")]
    Malformed { peer: String, reason: String },

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Reasons a candidate chain is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainInvalid {
    #[error("Chain is empty")]
    Empty,

    #[error("Block {0} does not follow its predecessor's index")]
    BadIndex(usize),

    #[error("Invalid hash link at block {0}")]
    BrokenLink(usize),

    #[error("Invalid proof of work at block {0}")]
    InvalidProof(usize),
}

/// A chain together with its reported length, as served by `GET /chain`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChainSnapshot {
    pub chain: Vec<Block>,
    pub length: u64,
}

impl ChainSnapshot {
    pub fn new(chain: Vec<Block>) -> Self {
        let length = chain.len() as u64;
        ChainSnapshot { chain, length }
    }
}

/// Where peer chains come from
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn fetch_chain(&self, peer: &str) -> Result<ChainSnapshot, PeerError>;
}

/// Fetches peer chains over HTTP with `GET http://{peer}/chain`
#[derive(Debug, Clone)]
pub struct HttpChainSource {
    client: reqwest::Client,
}

impl HttpChainSource {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Client(e.to_string()))?;

        Ok(HttpChainSource { client })
    }
}

#[async_trait]
impl ChainSource for HttpChainSource {
    async fn fetch_chain(&self, peer: &str) -> Result<ChainSnapshot, PeerError> {
        let url = format!("http://{}/chain", peer);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PeerError::Unreachable {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PeerError::Status {
                peer: peer.to_string(),
                status: response.status().as_u16(),
            });
        }

        response.json::<ChainSnapshot>().await.map_err(|e| PeerError::Malformed {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Extracts the network location of a node address
///
/// Addresses with a scheme (`http://10.0.0.5:5000/`) yield the authority
/// exactly as written, including userinfo and an explicit default port;
/// bare addresses (`10.0.0.5:5000`) are kept as given. Returns `None` when
/// neither form is present or the address contains whitespace.
pub fn parse_node_address(address: &str) -> Option<String> {
    let address = address.trim();
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return None;
    }

    if let Some((_, rest)) = address.split_once("://") {
        Url::parse(address).ok()?.host_str().filter(|host| !host.is_empty())?;
        let netloc = rest.split(['/', '?', '#']).next().unwrap_or_default();
        return Some(netloc.to_string()).filter(|netloc| !netloc.is_empty());
    }

    let bare = address.trim_end_matches('/');
    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

/// Deduplicated set of peer identifiers
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashSet<String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        NodeRegistry::default()
    }

    /// Registers a node, returning its stored identifier
    pub fn register(&self, address: &str) -> Option<String> {
        let node = parse_node_address(address)?;
        self.nodes.insert(node.clone());
        Some(node)
    }

    /// Gets all registered nodes, sorted
    pub fn list(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.iter().map(|node| node.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validates a candidate chain
///
/// The first block must carry the genesis index. Every block after it must
/// carry the index following its
/// predecessor's, link to the predecessor's hash and carry a valid proof of
/// work over its transactions' proof view.
pub fn validate_chain(chain: &[Block], difficulty: usize) -> Result<(), ChainInvalid> {
    match chain.first() {
        None => return Err(ChainInvalid::Empty),
        Some(genesis) if genesis.index != GENESIS_INDEX => return Err(ChainInvalid::BadIndex(0)),
        Some(_) => {}
    }

    for (offset, pair) in chain.windows(2).enumerate() {
        let (last_block, block) = (&pair[0], &pair[1]);
        let position = offset + 1;

        if last_block.index.checked_add(1) != Some(block.index) {
            return Err(ChainInvalid::BadIndex(position));
        }

        if block.previous_hash != last_block.calculate_hash() {
            return Err(ChainInvalid::BrokenLink(position));
        }

        if !valid_proof(&block.transactions, &block.previous_hash, block.nonce, difficulty) {
            return Err(ChainInvalid::InvalidProof(position));
        }
    }

    Ok(())
}

/// Picks the longest valid chain among peer responses
///
/// A response replaces the current best only if its reported length exceeds
/// the best length so far (initially `local_length`) and the chain validates.
/// Failed fetches and invalid chains are logged and skipped.
pub fn select_longest_chain(
    local_length: u64,
    responses: Vec<(String, Result<ChainSnapshot, PeerError>)>,
    difficulty: usize,
) -> Option<Vec<Block>> {
    let mut max_length = local_length;
    let mut best = None;

    for (peer, response) in responses {
        let snapshot = match response {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Skipping node {}: {}", peer, err);
                continue;
            }
        };

        if snapshot.length != snapshot.chain.len() as u64 {
            warn!(
                "Skipping node {}: reported length {} but sent {} blocks",
                peer,
                snapshot.length,
                snapshot.chain.len()
            );
            continue;
        }

        if snapshot.length <= max_length {
            continue;
        }

        match validate_chain(&snapshot.chain, difficulty) {
            Ok(()) => {
                max_length = snapshot.length;
                best = Some(snapshot.chain);
            }
            Err(reason) => warn!("Rejecting chain from node {}: {}", peer, reason),
        }
    }

    best
}
