use actix_web::HttpRequest;
use thiserror::Error;

use std::str::FromStr;

pub const PRINCIPAL_ID_HEADER: &str = "X-Principal-Id";
pub const PRINCIPAL_ROLE_HEADER: &str = "X-Principal-Role";
pub const PRINCIPAL_NAME_HEADER: &str = "X-Principal-Name";

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("Missing credential header {0}")]
    MissingHeader(&'static str),

    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Patient,
    HealthcareProvider,
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Role::Patient),
            "healthcare_provider" => Ok(Role::HealthcareProvider),
            other => Err(AuthError::UnknownRole(other.to_string())),
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    /// Display name, if the gateway supplied one
    pub profile: Option<String>,
}

impl Principal {
    pub fn is_provider(&self) -> bool {
        self.role == Role::HealthcareProvider
    }
}

/// Turns request credentials into a principal
///
/// The ledger itself takes principal ids as plain parameters; only the route
/// layer validates credentials.
pub trait CredentialValidator: Send + Sync {
    fn validate_credential(&self, req: &HttpRequest) -> Result<Principal, AuthError>;
}

/// Trusts the principal headers set by an upstream authentication gateway
#[derive(Debug, Default, Clone)]
pub struct TrustedHeaderValidator;

fn header<'a>(req: &'a HttpRequest, name: &'static str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl CredentialValidator for TrustedHeaderValidator {
    fn validate_credential(&self, req: &HttpRequest) -> Result<Principal, AuthError> {
        let id = header(req, PRINCIPAL_ID_HEADER)
            .ok_or(AuthError::MissingHeader(PRINCIPAL_ID_HEADER))?;
        let role = header(req, PRINCIPAL_ROLE_HEADER)
            .ok_or(AuthError::MissingHeader(PRINCIPAL_ROLE_HEADER))?
            .parse()?;

        Ok(Principal {
            id: id.to_string(),
            role,
            profile: header(req, PRINCIPAL_NAME_HEADER).map(str::to_string),
        })
    }
}
