use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/chain", web::get().to(handlers::get_chain))
        .route("/validate", web::get().to(handlers::validate_chain))
        .route("/block/{index}", web::get().to(handlers::get_block))
        .route("/mine", web::get().to(handlers::mine_block))
        .service(
            web::scope("/transactions")
                .route("/pending", web::get().to(handlers::get_pending_transactions))
                .route("/new", web::post().to(handlers::new_transaction)),
        )
        .service(
            web::scope("/nodes")
                .route("/register", web::post().to(handlers::register_nodes))
                .route("/get", web::get().to(handlers::get_nodes))
                .route("/resolve", web::get().to(handlers::resolve_conflicts)),
        )
        .service(
            web::scope("/medical")
                .route("/record", web::post().to(handlers::add_medical_record))
                .route("/records/{patient_id}", web::get().to(handlers::get_patient_records))
                .route("/consent", web::post().to(handlers::manage_consent)),
        );
}
