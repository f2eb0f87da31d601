use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;

mod api;
mod blockchain;
mod config;

use api::handlers::NodeIdentifier;
use api::{CredentialValidator, TrustedHeaderValidator};
use blockchain::{FileSecretStore, HttpChainSource, Ledger, MemorySecretStore, SecretStore};
use config::NodeConfig;

// Open the ledger, falling back to an in-memory chain or key when the
// configured ones are unusable
fn initialize_ledger(config: &NodeConfig) -> anyhow::Result<Ledger> {
    let file_store = FileSecretStore::new(&config.key_file);
    let secrets: Box<dyn SecretStore> = match file_store.get_or_create_secret() {
        Ok(_) => Box::new(file_store),
        Err(err) => {
            warn!("Key file unusable ({}), using a temporary in-memory key", err);
            warn!("Records encrypted by this process will be unreadable after a restart");
            Box::new(MemorySecretStore::ephemeral())
        }
    };

    let ledger = match &config.data_dir {
        Some(data_dir) => match Ledger::with_storage(data_dir, secrets.as_ref()) {
            Ok(ledger) => {
                info!("Loaded blockchain from storage at {}", data_dir.display());
                ledger
            }
            Err(err) => {
                warn!("Failed to load blockchain from storage: {}", err);
                warn!("Creating in-memory blockchain instead");
                Ledger::new(secrets.as_ref())?
            }
        },
        None => Ledger::new(secrets.as_ref())?,
    };

    let peers =
        HttpChainSource::new(config.peer_timeout).context("failed to build the peer client")?;
    Ok(ledger.with_chain_source(Arc::new(peers)))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::get_block,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::register_nodes,
        api::handlers::get_nodes,
        api::handlers::resolve_conflicts,
        api::handlers::add_medical_record,
        api::handlers::get_patient_records,
        api::handlers::manage_consent
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::RecordType,
            blockchain::RecordView,
            blockchain::ConsentAction,
            blockchain::medical::RecordKind,
            blockchain::ChainSnapshot,
            api::handlers::ValidateResponse,
            api::handlers::BlockResponse,
            api::handlers::TransactionRequest,
            api::handlers::AdmissionResponse,
            api::handlers::MineResponse,
            api::handlers::RegisterNodesRequest,
            api::handlers::NodesResponse,
            api::handlers::ResolveResponse,
            api::handlers::MedicalRecordRequest,
            api::handlers::RecordsResponse,
            api::handlers::ConsentRequest
        )
    ),
    tags(
        (name = "medchain", description = "Medical records ledger API endpoints")
    ),
    info(
        title = "Medchain API",
        version = "1.0.0",
        description = "A medical records blockchain node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env().context("invalid node configuration")?;

    let ledger = web::Data::new(initialize_ledger(&config)?);

    let node_identifier = uuid::Uuid::new_v4().simple().to_string();
    info!("Node identifier: {}", node_identifier);
    let node_identifier = web::Data::new(NodeIdentifier(node_identifier));

    let validator: Arc<dyn CredentialValidator> = Arc::new(TrustedHeaderValidator);
    let validator = web::Data::from(validator);

    let (host, port) = config.bind_address();
    info!("Starting HTTP server at http://{}:{}", host, port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger.clone())
            .app_data(node_identifier.clone())
            .app_data(validator.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((host.as_str(), port))
    .with_context(|| format!("failed to bind {}:{}", host, port))?
    .run()
    .await?;

    Ok(())
}
