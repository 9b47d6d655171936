use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::x509::X509Ref;
use serde::Serialize;
use tracing::{info, warn};

use crate::dn::format_name;
use crate::error::{Error, Result};
use crate::keys::public_key_type;
use crate::pipeline::{
    AcmeGenerateRequest, IssuancePipeline, LocalGenerateRequest, RemoteGenerateRequest,
};
use crate::providers::acme::config::AcmeConfig;
use crate::providers::{ACME_PROVIDER_PREFIX, LOCAL_PROVIDER_NAME, REMOTE_PROVIDER_NAME};
use crate::store::{FsStore, StoreEntry};

#[derive(Clone)]
struct ApiState {
    store: Arc<FsStore>,
    pipeline: Arc<IssuancePipeline>,
    acme_config_path: PathBuf,
}

#[derive(Serialize)]
struct AboutResponse {
    version: String,
    timestamp: String,
}

#[derive(Serialize)]
struct StoreEntriesResponse {
    entries: Vec<StoreEntryResponse>,
}

#[derive(Serialize)]
struct StoreEntryResponse {
    name: String,
    dn: String,
    key: bool,
    crt: bool,
    csr: bool,
    crl: bool,
    ca: bool,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
}

#[derive(Serialize)]
struct StoreEntryDetailsResponse {
    #[serde(flatten)]
    entry: StoreEntryResponse,
    crt_details: StoreEntryCrtDetailsResponse,
}

#[derive(Default, Serialize)]
struct StoreEntryCrtDetailsResponse {
    version: i32,
    serial: String,
    key_type: String,
    issuer: String,
    sig_alg: String,
}

#[derive(Serialize)]
struct StoreCasResponse {
    cas: Vec<StoreCaResponse>,
}

#[derive(Serialize)]
struct StoreCaResponse {
    name: String,
}

#[derive(Serialize)]
struct StoreLocalIssuersResponse {
    issuers: Vec<StoreLocalIssuerResponse>,
}

#[derive(Serialize)]
struct StoreLocalIssuerResponse {
    name: String,
}

#[derive(Serialize)]
struct ServerErrorResponse {
    message: String,
}

/// Serve the REST API until interrupted.
pub async fn run(
    listen_address: &str,
    store: Arc<FsStore>,
    acme_config_path: PathBuf,
) -> anyhow::Result<()> {
    let pipeline = Arc::new(IssuancePipeline::new(store.clone(), acme_config_path.clone()));
    let state = ApiState {
        store,
        pipeline,
        acme_config_path,
    };
    let router = Router::new()
        .route("/api/about", get(about))
        .route("/api/store/entries", get(store_entries))
        .route("/api/store/entry/details/:name", get(store_entry_details))
        .route("/api/store/cas", get(store_cas))
        .route("/api/store/local/issuers", get(store_local_issuers))
        .route("/api/store/local/generate", put(store_local_generate))
        .route("/api/store/remote/generate", put(store_remote_generate))
        .route("/api/store/acme/generate", put(store_acme_generate))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("Failed to bind server address '{}'", listen_address))?;
    info!(addr = %listen_address, "Serving certd API");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server failed")?;
    Ok(())
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidRequest(_)
            | Error::InvalidKeyType(_)
            | Error::InvalidDn(_)
            | Error::InvalidIssuer(_)
            | Error::InvalidAcmeCa(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = Json(ServerErrorResponse {
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

fn join_error(err: tokio::task::JoinError) -> ApiError {
    ApiError(Error::Io(std::io::Error::other(err)))
}

async fn about() -> Json<AboutResponse> {
    Json(AboutResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn store_entries(
    State(state): State<ApiState>,
) -> std::result::Result<Json<StoreEntriesResponse>, ApiError> {
    let store = state.store.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<StoreEntriesResponse> {
        let mut responses = Vec::new();
        let mut entries = store.entries();
        while let Some(entry) = entries.next() {
            responses.push(entry_response(&entry)?);
        }
        Ok(StoreEntriesResponse { entries: responses })
    })
    .await
    .map_err(join_error)??;
    Ok(Json(response))
}

async fn store_entry_details(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> std::result::Result<Json<StoreEntryDetailsResponse>, ApiError> {
    let store = state.store.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<StoreEntryDetailsResponse> {
        let entry = store.entry(&name)?;
        let entry_response = entry_response(&entry)?;
        let mut crt_details = StoreEntryCrtDetailsResponse::default();
        if entry_response.crt {
            if let Some(certificate) = entry.certificate()? {
                crt_details.version = certificate.version() + 1;
                crt_details.serial = format!(
                    "0x{}",
                    certificate.serial_number().to_bn()?.to_hex_str()?
                );
                let public_key = certificate.public_key()?;
                crt_details.key_type = public_key_type(&public_key);
                crt_details.issuer = format_name(certificate.issuer_name());
                crt_details.sig_alg = certificate.signature_algorithm().object().to_string();
            }
        }
        Ok(StoreEntryDetailsResponse {
            entry: entry_response,
            crt_details,
        })
    })
    .await
    .map_err(join_error)??;
    Ok(Json(response))
}

async fn store_cas(
    State(state): State<ApiState>,
) -> std::result::Result<Json<StoreCasResponse>, ApiError> {
    let mut cas = vec![
        StoreCaResponse {
            name: LOCAL_PROVIDER_NAME.to_string(),
        },
        StoreCaResponse {
            name: REMOTE_PROVIDER_NAME.to_string(),
        },
    ];
    let acme_config = AcmeConfig::load(&state.acme_config_path)?;
    for provider in acme_config.providers.values() {
        cas.push(StoreCaResponse {
            name: format!("{}{}", ACME_PROVIDER_PREFIX, provider.name),
        });
    }
    Ok(Json(StoreCasResponse { cas }))
}

async fn store_local_issuers(
    State(state): State<ApiState>,
) -> std::result::Result<Json<StoreLocalIssuersResponse>, ApiError> {
    let store = state.store.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<StoreLocalIssuersResponse> {
        let mut issuers = Vec::new();
        let mut entries = store.entries();
        while let Some(entry) = entries.next() {
            if let Some(certificate) = entry.certificate()? {
                if certificate_is_ca(&certificate) && entry.has_key() {
                    issuers.push(StoreLocalIssuerResponse {
                        name: entry.name().to_string(),
                    });
                }
            }
        }
        Ok(StoreLocalIssuersResponse { issuers })
    })
    .await
    .map_err(join_error)??;
    Ok(Json(response))
}

async fn store_local_generate(
    State(state): State<ApiState>,
    Json(request): Json<LocalGenerateRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.create_local(&request))
        .await
        .map_err(join_error)??;
    Ok(StatusCode::OK)
}

async fn store_remote_generate(
    State(state): State<ApiState>,
    Json(request): Json<RemoteGenerateRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.create_remote(&request))
        .await
        .map_err(join_error)??;
    Ok(StatusCode::OK)
}

async fn store_acme_generate(
    State(state): State<ApiState>,
    Json(request): Json<AcmeGenerateRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || pipeline.create_acme(&request))
        .await
        .map_err(join_error)??;
    Ok(StatusCode::OK)
}

fn entry_response(entry: &StoreEntry<'_>) -> Result<StoreEntryResponse> {
    let has_key = entry.has_key();
    let has_certificate = entry.has_certificate();
    let has_certificate_request = entry.has_certificate_request();
    let has_revocation_list = entry.has_revocation_list();
    let epoch = DateTime::from_timestamp(0, 0).unwrap_or_default();
    let (dn, ca, valid_from, valid_to) = if has_certificate {
        match entry.certificate()? {
            Some(certificate) => (
                format_name(certificate.subject_name()),
                certificate_is_ca(&certificate),
                asn1_to_datetime(certificate.not_before())?,
                asn1_to_datetime(certificate.not_after())?,
            ),
            None => (String::new(), false, epoch, epoch),
        }
    } else if has_certificate_request {
        match entry.certificate_request()? {
            Some(certificate_request) => (
                format_name(certificate_request.subject_name()),
                false,
                epoch,
                epoch,
            ),
            None => (String::new(), false, epoch, epoch),
        }
    } else {
        return Err(Error::InvalidRequest(format!(
            "invalid store entry '{}'",
            entry.name()
        )));
    };
    Ok(StoreEntryResponse {
        name: entry.name().to_string(),
        dn,
        key: has_key,
        crt: has_certificate,
        csr: has_certificate_request,
        crl: has_revocation_list,
        ca,
        valid_from,
        valid_to,
    })
}

/// X509_check_ca is not exposed by the bindings; the printed extension text
/// carries the basic-constraints CA flag instead.
fn certificate_is_ca(certificate: &X509Ref) -> bool {
    certificate
        .to_text()
        .map(|text| String::from_utf8_lossy(&text).contains("CA:TRUE"))
        .unwrap_or(false)
}

fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Ok(DateTime::from_timestamp(seconds, 0).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                Error::InvalidRequest("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::InvalidKeyType("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (Error::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (Error::AlreadyExists("x".to_string()), StatusCode::CONFLICT),
            (
                Error::StoreCorrupt("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).into_response().status(), status);
        }
    }

    #[test]
    fn test_asn1_to_datetime() {
        let time = Asn1Time::from_unix(1_700_000_000).unwrap();
        let datetime = asn1_to_datetime(&time).unwrap();
        assert_eq!(datetime.timestamp(), 1_700_000_000);
    }

    fn self_signed(dn: &str, ca: bool) -> openssl::x509::X509 {
        use openssl::asn1::Asn1Time;
        use openssl::bn::{BigNum, MsbOption};
        use openssl::x509::extension::BasicConstraints;

        use crate::keys::KeyPairFactory;
        use crate::providers::{CertificateTemplate, LocalCertificateFactory};

        let mut serial = BigNum::new().unwrap();
        serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
        let mut extensions = Vec::new();
        if ca {
            extensions.push(BasicConstraints::new().critical().ca().build().unwrap());
        }
        let template = CertificateTemplate {
            subject: crate::dn::parse_dn(dn).unwrap(),
            serial,
            not_before: Asn1Time::days_from_now(0).unwrap(),
            not_after: Asn1Time::days_from_now(1).unwrap(),
            extensions,
        };
        let factory = LocalCertificateFactory::new(template, KeyPairFactory::Ed25519, None);
        let (_, certificate) = factory.produce().unwrap();
        certificate
    }

    #[test]
    fn test_certificate_is_ca() {
        assert!(certificate_is_ca(&self_signed("CN=ca", true)));
        assert!(!certificate_is_ca(&self_signed("CN=leaf", false)));
    }
}
