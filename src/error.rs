use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error type shared across the store, the issuance pipeline and the
/// providers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid key type '{0}'")]
    InvalidKeyType(String),
    #[error("invalid distinguished name '{0}'")]
    InvalidDn(String),
    #[error("invalid issuer '{0}'")]
    InvalidIssuer(String),
    #[error("invalid ACME CA '{0}'")]
    InvalidAcmeCa(String),
    #[error("certificate generation failed")]
    GenerateFailure(#[source] Box<Error>),
    #[error("store entry '{0}' already exists")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("illegal state path '{0}'")]
    InvalidPath(PathBuf),
    #[error("store is corrupt: {0}")]
    StoreCorrupt(String),
    #[error("PEM error: {0}")]
    Pem(String),
    #[error("ACME order failed: {0}")]
    Acme(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
