use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509Req, X509ReqBuilder};
use tracing::debug;

use crate::error::Result;
use crate::keys::KeyPairFactory;
use crate::providers::signature_digest;

/// Produces a key pair plus a PKCS#10 certificate signing request. The
/// request is meant to be signed by an external CA; the resulting
/// certificate is not correlated back to the entry automatically.
pub struct RemoteCertificateRequestFactory {
    subject: X509Name,
    key_factory: KeyPairFactory,
}

impl RemoteCertificateRequestFactory {
    pub fn new(subject: X509Name, key_factory: KeyPairFactory) -> Self {
        Self {
            subject,
            key_factory,
        }
    }

    pub(crate) fn produce(self) -> Result<(PKey<Private>, X509Req)> {
        debug!(key_type = %self.key_factory.name(), "Generating certificate request");
        let key = self.key_factory.generate()?;
        let mut builder = X509ReqBuilder::new()?;
        builder.set_subject_name(&self.subject)?;
        builder.set_pubkey(&key)?;
        builder.sign(&key, signature_digest(&key))?;
        Ok((key, builder.build()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dn::{format_name, parse_dn};

    #[test]
    fn test_certificate_request() {
        let factory = RemoteCertificateRequestFactory::new(
            parse_dn("CN=csr0").unwrap(),
            KeyPairFactory::Ed25519,
        );
        let (key, request) = factory.produce().unwrap();
        assert_eq!(format_name(request.subject_name()), "CN=csr0");
        assert!(request.verify(&key).unwrap());
    }
}
