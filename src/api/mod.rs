// API module
//
// This module contains the HTTP layer of the node: routes, handlers and
// credential validation for the medical endpoints

pub mod auth;
pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use auth::{CredentialValidator, TrustedHeaderValidator};
pub use routes::configure_routes;
