use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

use crate::api::auth::{CredentialValidator, Principal, Role};
use crate::blockchain::{
    Block, ChainSnapshot, ConsentAction, Ledger, LedgerEntry, LedgerError, RecordType, RecordView,
};

/// Shared ledger handle
pub type LedgerData = web::Data<Ledger>;

/// Credential validator shared by the medical routes
pub type ValidatorData = web::Data<dyn CredentialValidator>;

/// Address credited with this node's mining rewards
#[derive(Debug, Clone)]
pub struct NodeIdentifier(pub String);

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidateResponse {
    /// Whether the local chain is valid
    pub valid: bool,

    pub length: usize,
}

/// Response for the block endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BlockResponse {
    pub block: Block,

    /// Hash of the block
    pub hash: String,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address (hex-encoded public key)
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,

    /// Hex-encoded signature over the canonical transaction
    pub signature: String,
}

/// Response for the admission endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AdmissionResponse {
    /// The message
    pub message: String,

    /// The index of the block that will include the entry
    pub block_index: u64,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    pub index: u64,

    #[schema(value_type = Vec<Object>)]
    pub transactions: Vec<LedgerEntry>,

    pub nonce: u64,

    pub previous_hash: String,
}

/// Request for the node registration endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterNodesRequest {
    /// Peer addresses, e.g. `http://192.168.0.5:5000`
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Response listing the registered peers
#[derive(Serialize, Deserialize, ToSchema)]
pub struct NodesResponse {
    pub message: String,

    pub total_nodes: Vec<String>,
}

/// Response for the conflict resolution endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ResolveResponse {
    pub message: String,

    /// Whether the local chain was replaced
    pub replaced: bool,

    pub chain: Vec<Block>,
}

/// Request for the medical record endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MedicalRecordRequest {
    pub patient_id: String,

    /// One of the medical record types, e.g. `lab_result`
    pub record_type: String,

    /// Payload to encrypt
    #[serde(default)]
    #[schema(value_type = Object)]
    pub medical_data: Value,

    /// Readers of the record; defaults to the patient and the author
    pub access_list: Option<Vec<String>>,

    /// Hex-encoded signature of the author over the canonical record
    pub signature: Option<String>,
}

/// Query for the patient records endpoint
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RecordsQuery {
    /// Only return records of this type
    pub record_type: Option<String>,
}

/// Response for the patient records endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RecordsResponse {
    pub patient_id: String,

    pub records: Vec<RecordView>,

    pub count: usize,
}

/// Request for the consent endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ConsentRequest {
    /// The provider being granted or denied access
    pub provider_id: String,

    /// `grant` or `revoke`
    pub access_type: String,

    /// Record types covered; defaults to all of them
    pub record_types: Option<Vec<String>>,

    /// Unix timestamp after which a grant lapses
    pub expiration: Option<f64>,

    /// Hex-encoded signature of the patient over the canonical record
    pub signature: Option<String>,
}

fn error_body(message: impl std::fmt::Display) -> Value {
    serde_json::json!({ "error": message.to_string() })
}

/// Maps a ledger rejection to its HTTP response
fn ledger_error(err: LedgerError) -> HttpResponse {
    match err {
        LedgerError::InvalidSignature => HttpResponse::NotAcceptable().json(error_body(err)),
        LedgerError::InvalidAddress(_)
        | LedgerError::InvalidRecordType(_)
        | LedgerError::InvalidTransaction(_) => HttpResponse::BadRequest().json(error_body(err)),
        LedgerError::BlockNotFound(_) => HttpResponse::NotFound().json(error_body(err)),
        LedgerError::EncryptionFailure(_)
        | LedgerError::StorageError(_)
        | LedgerError::KeyStoreError(_)
        | LedgerError::PeerError(_) => {
            error!("Ledger operation failed: {}", err);
            HttpResponse::InternalServerError().json(error_body(err))
        }
    }
}

fn authenticate(validator: &ValidatorData, req: &HttpRequest) -> Result<Principal, HttpResponse> {
    validator.validate_credential(req).map_err(|err| {
        warn!("Rejected credentials: {}", err);
        HttpResponse::Unauthorized().json(error_body(err))
    })
}

fn forbidden(message: &str) -> HttpResponse {
    HttpResponse::Forbidden().json(error_body(message))
}

/// Get the full blockchain
#[utoipa::path(
    get,
    path = "/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainSnapshot)
    )
)]
pub async fn get_chain(ledger: LedgerData) -> impl Responder {
    HttpResponse::Ok().json(ChainSnapshot::new(ledger.chain()))
}

/// Check if the blockchain is valid
#[utoipa::path(
    get,
    path = "/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidateResponse)
    )
)]
pub async fn validate_chain(ledger: LedgerData) -> impl Responder {
    HttpResponse::Ok().json(ValidateResponse {
        valid: ledger.is_valid(),
        length: ledger.len(),
    })
}

/// Get a block by index
///
/// The genesis block has index 1
#[utoipa::path(
    get,
    path = "/block/{index}",
    params(
        ("index" = u64, Path, description = "Block index")
    ),
    responses(
        (status = 200, description = "Block retrieved successfully", body = BlockResponse),
        (status = 404, description = "Block not found")
    )
)]
pub async fn get_block(ledger: LedgerData, index: web::Path<u64>) -> impl Responder {
    match ledger.block(index.into_inner()) {
        Ok(block) => HttpResponse::Ok().json(BlockResponse {
            hash: Ledger::hash(&block),
            block,
        }),
        Err(err) => ledger_error(err),
    }
}

/// Get all pending transactions
///
/// Returns all transactions and records waiting to be included in a block
#[utoipa::path(
    get,
    path = "/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions and records, in admission order")
    )
)]
pub async fn get_pending_transactions(ledger: LedgerData) -> impl Responder {
    HttpResponse::Ok().json(ledger.pending())
}

/// Create a new transaction
///
/// Verifies the sender's signature and adds the transaction to the pending pool
#[utoipa::path(
    post,
    path = "/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = AdmissionResponse),
        (status = 400, description = "Invalid transaction data"),
        (status = 406, description = "Invalid transaction signature")
    )
)]
pub async fn new_transaction(
    ledger: LedgerData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let req = transaction_req.into_inner();

    match ledger.submit_transaction(&req.sender, &req.recipient, req.amount, &req.signature) {
        Ok(block_index) => HttpResponse::Created().json(AdmissionResponse {
            message: format!("Transaction will be added to Block {}", block_index),
            block_index,
        }),
        Err(err) => ledger_error(err),
    }
}

/// Mine a new block
///
/// Rewards this node and seals all pending transactions into a new block
#[utoipa::path(
    get,
    path = "/mine",
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(ledger: LedgerData, node: web::Data<NodeIdentifier>) -> impl Responder {
    let ledger = ledger.get_ref().clone();
    let recipient = node.0.clone();

    match web::block(move || ledger.mine(&recipient)).await {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Forged".to_string(),
            index: block.index,
            transactions: block.transactions,
            nonce: block.nonce,
            previous_hash: block.previous_hash,
        }),
        Ok(Err(err)) => ledger_error(err),
        Err(err) => {
            error!("Mining task failed: {}", err);
            HttpResponse::InternalServerError().json(error_body("Mining task failed"))
        }
    }
}

/// Register peer nodes
///
/// Every address must be valid; nothing is registered otherwise
#[utoipa::path(
    post,
    path = "/nodes/register",
    request_body = RegisterNodesRequest,
    responses(
        (status = 201, description = "Nodes registered successfully", body = NodesResponse),
        (status = 400, description = "Missing or invalid node addresses")
    )
)]
pub async fn register_nodes(
    ledger: LedgerData,
    nodes_req: web::Json<RegisterNodesRequest>,
) -> impl Responder {
    let nodes = nodes_req.into_inner().nodes;
    if nodes.is_empty() {
        return HttpResponse::BadRequest().json(error_body("Please supply a valid list of nodes"));
    }

    let invalid: Vec<&String> = nodes
        .iter()
        .filter(|node| crate::blockchain::consensus::parse_node_address(node).is_none())
        .collect();
    if !invalid.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Invalid node addresses",
            "invalid": invalid,
        }));
    }

    for node in &nodes {
        if let Err(err) = ledger.register_node(node) {
            return ledger_error(err);
        }
    }

    HttpResponse::Created().json(NodesResponse {
        message: "New nodes have been added".to_string(),
        total_nodes: ledger.nodes(),
    })
}

/// Get all registered peer nodes
#[utoipa::path(
    get,
    path = "/nodes/get",
    responses(
        (status = 200, description = "Registered nodes", body = NodesResponse)
    )
)]
pub async fn get_nodes(ledger: LedgerData) -> impl Responder {
    HttpResponse::Ok().json(NodesResponse {
        message: "Registered nodes".to_string(),
        total_nodes: ledger.nodes(),
    })
}

/// Resolve conflicts with peers
///
/// Adopts the longest valid chain among the registered peers
#[utoipa::path(
    get,
    path = "/nodes/resolve",
    responses(
        (status = 200, description = "Conflict resolution result", body = ResolveResponse)
    )
)]
pub async fn resolve_conflicts(ledger: LedgerData) -> impl Responder {
    match ledger.resolve_conflicts().await {
        Ok(replaced) => {
            let message = if replaced {
                "Our chain was replaced"
            } else {
                "Our chain is authoritative"
            };

            HttpResponse::Ok().json(ResolveResponse {
                message: message.to_string(),
                replaced,
                chain: ledger.chain(),
            })
        }
        Err(err) => ledger_error(err),
    }
}

/// Add a medical record
///
/// The authenticated provider is the record's author
#[utoipa::path(
    post,
    path = "/medical/record",
    request_body = MedicalRecordRequest,
    responses(
        (
            status = 201,
            description = "Record will be added to the next block",
            body = AdmissionResponse
        ),
        (status = 400, description = "Invalid record type"),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 403, description = "Caller is not a healthcare provider"),
        (status = 406, description = "Invalid record signature")
    )
)]
pub async fn add_medical_record(
    req: HttpRequest,
    ledger: LedgerData,
    validator: ValidatorData,
    record_req: web::Json<MedicalRecordRequest>,
) -> impl Responder {
    let principal = match authenticate(&validator, &req) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    if !principal.is_provider() {
        return forbidden("Only healthcare providers can add medical records");
    }

    let record = record_req.into_inner();
    let result = ledger.new_medical_record(
        &record.patient_id,
        &principal.id,
        &record.record_type,
        record.medical_data,
        record.access_list,
        record.signature.as_deref(),
    );

    match result {
        Ok(block_index) => HttpResponse::Created().json(AdmissionResponse {
            message: format!("Medical record will be added to Block {}", block_index),
            block_index,
        }),
        Err(err) => ledger_error(err),
    }
}

/// Get a patient's medical records
///
/// Returns only the records the caller may read
#[utoipa::path(
    get,
    path = "/medical/records/{patient_id}",
    params(
        ("patient_id" = String, Path, description = "Patient identifier"),
        RecordsQuery
    ),
    responses(
        (status = 200, description = "Readable records", body = RecordsResponse),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 403, description = "Caller may not read this patient's records")
    )
)]
pub async fn get_patient_records(
    req: HttpRequest,
    ledger: LedgerData,
    validator: ValidatorData,
    patient_id: web::Path<String>,
    query: web::Query<RecordsQuery>,
) -> impl Responder {
    let principal = match authenticate(&validator, &req) {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    let patient_id = patient_id.into_inner();
    if principal.id != patient_id && !principal.is_provider() {
        return forbidden("Patients can only view their own records");
    }

    let records =
        ledger.get_patient_records(&patient_id, &principal.id, query.record_type.as_deref());

    HttpResponse::Ok().json(RecordsResponse {
        count: records.len(),
        patient_id,
        records,
    })
}

/// Grant or revoke a provider's access
///
/// Only patients manage consent, and only for themselves
#[utoipa::path(
    post,
    path = "/medical/consent",
    request_body = ConsentRequest,
    responses(
        (
            status = 201,
            description = "Consent will be added to the next block",
            body = AdmissionResponse
        ),
        (status = 400, description = "Invalid access type or record type"),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 403, description = "Caller is not a patient"),
        (status = 406, description = "Invalid consent signature")
    )
)]
pub async fn manage_consent(
    req: HttpRequest,
    ledger: LedgerData,
    validator: ValidatorData,
    consent_req: web::Json<ConsentRequest>,
) -> impl Responder {
    let principal = match authenticate(&validator, &req) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    if principal.role != Role::Patient {
        return forbidden("Only patients can manage consent");
    }

    let consent = consent_req.into_inner();

    let action: ConsentAction = match consent.access_type.parse() {
        Ok(action) => action,
        Err(message) => return HttpResponse::BadRequest().json(error_body(message)),
    };

    let record_types = match consent.record_types {
        Some(names) => {
            let parsed: Result<Vec<RecordType>, _> =
                names.iter().map(|name| name.parse()).collect();
            match parsed {
                Ok(types) => Some(types),
                Err(err) => return ledger_error(err.into()),
            }
        }
        None => None,
    };

    let result = ledger.submit_consent(
        &principal.id,
        &consent.provider_id,
        action,
        record_types,
        consent.expiration,
        consent.signature.as_deref(),
    );

    match result {
        Ok(block_index) => HttpResponse::Created().json(AdmissionResponse {
            message: format!("Consent will be added to Block {}", block_index),
            block_index,
        }),
        Err(err) => ledger_error(err),
    }
}
