use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::X509Extension;
use serde::Deserialize;
use tracing::info;

use crate::dn::parse_dn;
use crate::error::{Error, Result};
use crate::keys::{self, KeyPairFactory};
use crate::providers::acme::{validate_order_key_type, AcmeCertificateFactory};
use crate::providers::{
    CertificateFactory, CertificateRequestFactory, CertificateTemplate, Issuer,
    LocalCertificateFactory, RemoteCertificateRequestFactory, ACME_PROVIDER_PREFIX,
};
use crate::store::{FsStore, STORE_EXTENSIONS};

/// Turns validated issuance requests into persisted store entries by
/// resolving a key factory plus a provider strategy and handing the result
/// to the store for atomic commit.
pub struct IssuancePipeline {
    store: Arc<FsStore>,
    acme_config_path: PathBuf,
}

/// Request for a locally issued certificate, self-signed or chained onto
/// an issuer entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalGenerateRequest {
    pub name: String,
    pub dn: String,
    pub key_type: String,
    #[serde(default)]
    pub issuer: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    #[serde(default)]
    pub key_usage: KeyUsageSpec,
    #[serde(default)]
    pub ext_key_usage: ExtKeyUsageSpec,
    #[serde(default)]
    pub basic_constraint: BasicConstraintSpec,
}

/// Request for a key plus certificate signing request, to be signed by an
/// external CA.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteGenerateRequest {
    pub name: String,
    pub dn: String,
    pub key_type: String,
}

/// Request for an ACME-issued certificate; `ca` selects the configured
/// provider as `ACME:<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct AcmeGenerateRequest {
    pub name: String,
    pub ca: String,
    pub domains: Vec<String>,
    pub key_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyUsageSpec {
    pub enabled: bool,
    pub digital_signature: bool,
    pub content_commitment: bool,
    pub key_encipherment: bool,
    pub data_encipherment: bool,
    pub key_agreement: bool,
    pub cert_sign: bool,
    pub crl_sign: bool,
    pub encipher_only: bool,
    pub decipher_only: bool,
}

impl KeyUsageSpec {
    fn to_extension(&self) -> Result<Option<X509Extension>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut key_usage = KeyUsage::new();
        key_usage.critical();
        let mut any_flag = false;
        if self.digital_signature {
            key_usage.digital_signature();
            any_flag = true;
        }
        if self.content_commitment {
            key_usage.non_repudiation();
            any_flag = true;
        }
        if self.key_encipherment {
            key_usage.key_encipherment();
            any_flag = true;
        }
        if self.data_encipherment {
            key_usage.data_encipherment();
            any_flag = true;
        }
        if self.key_agreement {
            key_usage.key_agreement();
            any_flag = true;
        }
        if self.cert_sign {
            key_usage.key_cert_sign();
            any_flag = true;
        }
        if self.crl_sign {
            key_usage.crl_sign();
            any_flag = true;
        }
        if self.encipher_only {
            key_usage.encipher_only();
            any_flag = true;
        }
        if self.decipher_only {
            key_usage.decipher_only();
            any_flag = true;
        }
        if !any_flag {
            return Ok(None);
        }
        Ok(Some(key_usage.build()?))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtKeyUsageSpec {
    pub enabled: bool,
    pub any: bool,
    pub server_auth: bool,
    pub client_auth: bool,
    pub code_signing: bool,
    pub email_protection: bool,
    pub time_stamping: bool,
    pub ocsp_signing: bool,
}

impl ExtKeyUsageSpec {
    fn to_extension(&self) -> Result<Option<X509Extension>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut ext_key_usage = ExtendedKeyUsage::new();
        let mut any_flag = false;
        if self.any {
            ext_key_usage.other("anyExtendedKeyUsage");
            any_flag = true;
        }
        if self.server_auth {
            ext_key_usage.server_auth();
            any_flag = true;
        }
        if self.client_auth {
            ext_key_usage.client_auth();
            any_flag = true;
        }
        if self.code_signing {
            ext_key_usage.code_signing();
            any_flag = true;
        }
        if self.email_protection {
            ext_key_usage.email_protection();
            any_flag = true;
        }
        if self.time_stamping {
            ext_key_usage.time_stamping();
            any_flag = true;
        }
        if self.ocsp_signing {
            ext_key_usage.other("OCSPSigning");
            any_flag = true;
        }
        if !any_flag {
            return Ok(None);
        }
        Ok(Some(ext_key_usage.build()?))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BasicConstraintSpec {
    pub enabled: bool,
    pub ca: bool,
    /// A negative value means "no path length limit".
    pub path_len: i32,
}

impl Default for BasicConstraintSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            ca: false,
            path_len: -1,
        }
    }
}

impl BasicConstraintSpec {
    fn to_extension(&self) -> Result<Option<X509Extension>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut basic_constraints = BasicConstraints::new();
        basic_constraints.critical();
        if self.ca {
            basic_constraints.ca();
            if self.path_len >= 0 {
                basic_constraints.pathlen(self.path_len as u32);
            }
        }
        Ok(Some(basic_constraints.build()?))
    }
}

impl IssuancePipeline {
    pub fn new<P: Into<PathBuf>>(store: Arc<FsStore>, acme_config_path: P) -> Self {
        Self {
            store,
            acme_config_path: acme_config_path.into(),
        }
    }

    /// Create a self-signed or issuer-signed certificate entry.
    pub fn create_local(&self, request: &LocalGenerateRequest) -> Result<()> {
        validate_entry_name(&request.name)?;
        let key_factory = keys::factory(&request.key_type)?;
        let issuer = if request.issuer.is_empty() {
            None
        } else {
            Some(self.resolve_issuer(&request.issuer)?)
        };
        let subject = parse_dn(&request.dn)?;
        let mut extensions = Vec::new();
        if let Some(extension) = request.key_usage.to_extension()? {
            extensions.push(extension);
        }
        if let Some(extension) = request.ext_key_usage.to_extension()? {
            extensions.push(extension);
        }
        if let Some(extension) = request.basic_constraint.to_extension()? {
            extensions.push(extension);
        }
        let template = CertificateTemplate {
            subject,
            serial: generate_serial()?,
            not_before: asn1_time(&request.valid_from)?,
            not_after: asn1_time(&request.valid_to)?,
            extensions,
        };
        info!(entry = %request.name, key_type = %request.key_type, "Generating local certificate entry");
        let factory =
            CertificateFactory::Local(LocalCertificateFactory::new(template, key_factory, issuer));
        self.commit_certificate(&request.name, factory)
    }

    /// Create a key plus CSR entry for external signing.
    pub fn create_remote(&self, request: &RemoteGenerateRequest) -> Result<()> {
        validate_entry_name(&request.name)?;
        let key_factory = keys::factory(&request.key_type)?;
        let subject = parse_dn(&request.dn)?;
        info!(entry = %request.name, key_type = %request.key_type, "Generating certificate request entry");
        let factory = CertificateRequestFactory::Remote(RemoteCertificateRequestFactory::new(
            subject,
            key_factory,
        ));
        match self.store.create_certificate_request(&request.name, factory) {
            Ok(_) => Ok(()),
            Err(err @ Error::AlreadyExists(_)) => Err(err),
            Err(err) => Err(Error::GenerateFailure(Box::new(err))),
        }
    }

    /// Create a certificate entry through an ACME order.
    pub fn create_acme(&self, request: &AcmeGenerateRequest) -> Result<()> {
        validate_entry_name(&request.name)?;
        let key_factory = keys::factory(&request.key_type)?;
        validate_order_key_type(&key_factory)?;
        let provider_name = acme_provider_name(&request.ca)?;
        info!(entry = %request.name, ca = %request.ca, domains = ?request.domains, "Generating ACME certificate entry");
        let factory = CertificateFactory::Acme(AcmeCertificateFactory::new(
            request.domains.clone(),
            self.acme_config_path.clone(),
            provider_name,
            key_factory,
        ));
        self.commit_certificate(&request.name, factory)
    }

    fn commit_certificate(&self, name: &str, factory: CertificateFactory) -> Result<()> {
        match self.store.create_certificate(name, factory) {
            Ok(_) => Ok(()),
            Err(err @ Error::AlreadyExists(_)) => Err(err),
            Err(err) => Err(Error::GenerateFailure(Box::new(err))),
        }
    }

    /// Resolve an issuer entry into its certificate and signing key. The
    /// entry must carry both.
    fn resolve_issuer(&self, issuer: &str) -> Result<Issuer> {
        let entry = self
            .store
            .entry(issuer)
            .map_err(|_| Error::InvalidIssuer(issuer.to_string()))?;
        let certificate = entry
            .certificate()?
            .ok_or_else(|| Error::InvalidIssuer(issuer.to_string()))?;
        let key = entry
            .key()?
            .ok_or_else(|| Error::InvalidIssuer(issuer.to_string()))?;
        Ok(Issuer {
            certificate: certificate.as_ref().clone(),
            key,
        })
    }
}

/// Split the provider name out of an `ACME:<provider>` CA selector.
pub fn acme_provider_name(ca: &str) -> Result<String> {
    ca.strip_prefix(ACME_PROVIDER_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidAcmeCa(ca.to_string()))
}

/// Entry names become file stems; path separators, a leading dot or a
/// recognized artifact suffix inside the name are rejected.
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRequest("empty entry name".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidRequest(format!(
            "entry name '{}' contains a path separator",
            name
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidRequest(format!(
            "entry name '{}' starts with a dot",
            name
        )));
    }
    for extension in STORE_EXTENSIONS {
        if name.contains(extension) {
            return Err(Error::InvalidRequest(format!(
                "entry name '{}' contains reserved suffix '{}'",
                name, extension
            )));
        }
    }
    Ok(())
}

/// A cryptographically random, non-negative 128-bit serial number.
fn generate_serial() -> Result<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

fn asn1_time(timestamp: &DateTime<Utc>) -> Result<Asn1Time> {
    Ok(Asn1Time::from_unix(timestamp.timestamp())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    fn pipeline(store_path: &std::path::Path) -> IssuancePipeline {
        let store = Arc::new(FsStore::init(store_path).unwrap());
        IssuancePipeline::new(store, store_path.join("acme.yaml"))
    }

    fn local_request(name: &str, dn: &str, issuer: &str, ca: bool) -> LocalGenerateRequest {
        LocalGenerateRequest {
            name: name.to_string(),
            dn: dn.to_string(),
            key_type: "ED25519".to_string(),
            issuer: issuer.to_string(),
            valid_from: Utc::now(),
            valid_to: Utc::now() + TimeDelta::hours(24),
            key_usage: KeyUsageSpec {
                enabled: ca,
                cert_sign: ca,
                crl_sign: ca,
                ..KeyUsageSpec::default()
            },
            ext_key_usage: ExtKeyUsageSpec {
                enabled: !ca,
                server_auth: !ca,
                ..ExtKeyUsageSpec::default()
            },
            basic_constraint: BasicConstraintSpec {
                enabled: ca,
                ca,
                path_len: -1,
            },
        }
    }

    #[test]
    fn test_validate_entry_name() {
        assert!(validate_entry_name("cert1").is_ok());
        assert!(validate_entry_name("example.com").is_ok());
        assert!(matches!(
            validate_entry_name(""),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_entry_name("a/b"),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_entry_name(".hidden"),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_entry_name("server.key"),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_entry_name("server.crt.bak"),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_generate_serial_is_bounded_and_non_negative() {
        for _ in 0..16 {
            let serial = generate_serial().unwrap();
            assert!(serial.num_bits() <= 128);
            assert!(!serial.is_negative());
        }
    }

    #[test]
    fn test_create_local_ca_then_leaf() {
        let home = tempdir().unwrap();
        let store_path = home.path().join("store");
        let pipeline = pipeline(&store_path);
        pipeline
            .create_local(&local_request("cert1", "CN=cert1,OU=pki", "", true))
            .unwrap();
        pipeline
            .create_local(&local_request("cert2", "CN=cert2,OU=pki", "cert1", false))
            .unwrap();

        let store = FsStore::open(&store_path).unwrap();
        let cert1 = store.entry("cert1").unwrap().certificate().unwrap().unwrap();
        let cert2 = store.entry("cert2").unwrap().certificate().unwrap().unwrap();
        assert_eq!(
            crate::dn::format_name(cert2.issuer_name()),
            crate::dn::format_name(cert1.subject_name())
        );
    }

    #[test]
    fn test_create_local_validation_failures_leave_no_entries() {
        let home = tempdir().unwrap();
        let store_path = home.path().join("store");
        let pipeline = pipeline(&store_path);

        let mut bad_name = local_request("bad/name", "CN=x", "", false);
        assert!(matches!(
            pipeline.create_local(&bad_name),
            Err(Error::InvalidRequest(_))
        ));
        bad_name.name = "cert1".to_string();
        bad_name.key_type = "DSA 1024".to_string();
        assert!(matches!(
            pipeline.create_local(&bad_name),
            Err(Error::InvalidKeyType(_))
        ));
        bad_name.key_type = "ED25519".to_string();
        bad_name.dn = "not a dn".to_string();
        assert!(matches!(
            pipeline.create_local(&bad_name),
            Err(Error::InvalidDn(_))
        ));
        bad_name.dn = "CN=x".to_string();
        bad_name.issuer = "missing".to_string();
        assert!(matches!(
            pipeline.create_local(&bad_name),
            Err(Error::InvalidIssuer(_))
        ));

        let store = FsStore::open(&store_path).unwrap();
        assert!(store.entries().next().is_none());
    }

    #[test]
    fn test_create_local_duplicate_name() {
        let home = tempdir().unwrap();
        let pipeline = pipeline(&home.path().join("store"));
        let request = local_request("cert1", "CN=cert1", "", false);
        pipeline.create_local(&request).unwrap();
        assert!(matches!(
            pipeline.create_local(&request),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_create_remote_entry() {
        let home = tempdir().unwrap();
        let store_path = home.path().join("store");
        let pipeline = pipeline(&store_path);
        pipeline
            .create_remote(&RemoteGenerateRequest {
                name: "csr0".to_string(),
                dn: "CN=csr0".to_string(),
                key_type: "ED25519".to_string(),
            })
            .unwrap();
        let store = FsStore::open(&store_path).unwrap();
        let entry = store.entry("csr0").unwrap();
        assert!(!entry.has_certificate());
        assert!(entry.has_certificate_request());
        assert!(entry.has_key());
    }

    #[test]
    fn test_create_acme_request_validation() {
        let home = tempdir().unwrap();
        let pipeline = pipeline(&home.path().join("store"));
        let mut request = AcmeGenerateRequest {
            name: "acme0".to_string(),
            ca: "Local".to_string(),
            domains: vec!["localhost".to_string()],
            key_type: "ECDSA P-256".to_string(),
        };
        assert!(matches!(
            pipeline.create_acme(&request),
            Err(Error::InvalidAcmeCa(_))
        ));
        request.ca = "ACME:Test".to_string();
        request.key_type = "ED25519".to_string();
        assert!(matches!(
            pipeline.create_acme(&request),
            Err(Error::InvalidKeyType(_))
        ));
    }

    #[test]
    fn test_acme_provider_name() {
        assert_eq!(acme_provider_name("ACME:Test").unwrap(), "Test");
        assert!(matches!(
            acme_provider_name("Test"),
            Err(Error::InvalidAcmeCa(_))
        ));
    }
}
