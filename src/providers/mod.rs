pub mod acme;
pub mod local;
pub mod remote;

use openssl::hash::MessageDigest;
use openssl::pkey::{HasPrivate, Id, PKey, PKeyRef, Private};
use openssl::x509::{X509Req, X509};

use crate::error::Result;

pub use acme::AcmeCertificateFactory;
pub use local::{CertificateTemplate, Issuer, LocalCertificateFactory};
pub use remote::RemoteCertificateRequestFactory;

pub const LOCAL_PROVIDER_NAME: &str = "Local";
pub const REMOTE_PROVIDER_NAME: &str = "Remote";
pub const ACME_PROVIDER_PREFIX: &str = "ACME:";

/// The strategies able to produce a `(private key, certificate)` pair for a
/// new store entry.
pub enum CertificateFactory {
    Local(LocalCertificateFactory),
    Acme(AcmeCertificateFactory),
}

impl CertificateFactory {
    /// The provider name recorded in the entry attributes.
    pub fn name(&self) -> String {
        match self {
            CertificateFactory::Local(_) => LOCAL_PROVIDER_NAME.to_string(),
            CertificateFactory::Acme(factory) => factory.name().to_string(),
        }
    }

    pub fn produce(self) -> Result<(PKey<Private>, X509)> {
        match self {
            CertificateFactory::Local(factory) => factory.produce(),
            CertificateFactory::Acme(factory) => factory.produce(),
        }
    }
}

/// The strategies able to produce a `(private key, certificate request)`
/// pair for a new store entry.
pub enum CertificateRequestFactory {
    Remote(RemoteCertificateRequestFactory),
}

impl CertificateRequestFactory {
    pub fn name(&self) -> String {
        match self {
            CertificateRequestFactory::Remote(_) => REMOTE_PROVIDER_NAME.to_string(),
        }
    }

    pub fn produce(self) -> Result<(PKey<Private>, X509Req)> {
        match self {
            CertificateRequestFactory::Remote(factory) => factory.produce(),
        }
    }
}

/// Ed25519 keys sign without a separate digest; everything else uses SHA-256.
pub(crate) fn signature_digest<T: HasPrivate>(key: &PKeyRef<T>) -> MessageDigest {
    if key.id() == Id::ED25519 {
        MessageDigest::null()
    } else {
        MessageDigest::sha256()
    }
}
