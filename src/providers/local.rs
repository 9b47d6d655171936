use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509};
use tracing::debug;

use crate::error::Result;
use crate::keys::KeyPairFactory;
use crate::providers::signature_digest;

// X509 version 3 is represented by 2
const X509_VERSION_3: i32 = 2;

/// The partially populated certificate a local issuance starts from. The
/// issuance pipeline fills in subject, serial, validity window and the
/// requested extensions.
pub struct CertificateTemplate {
    pub subject: X509Name,
    pub serial: BigNum,
    pub not_before: Asn1Time,
    pub not_after: Asn1Time,
    pub extensions: Vec<X509Extension>,
}

/// Parent certificate and signing key of a chained issuance.
pub struct Issuer {
    pub certificate: X509,
    pub key: PKey<Private>,
}

/// Produces a key pair plus an X.509 certificate, self-signed or signed by
/// a parent entry's key.
pub struct LocalCertificateFactory {
    template: CertificateTemplate,
    key_factory: KeyPairFactory,
    issuer: Option<Issuer>,
}

impl LocalCertificateFactory {
    pub fn new(
        template: CertificateTemplate,
        key_factory: KeyPairFactory,
        issuer: Option<Issuer>,
    ) -> Self {
        Self {
            template,
            key_factory,
            issuer,
        }
    }

    pub(crate) fn produce(self) -> Result<(PKey<Private>, X509)> {
        debug!(key_type = %self.key_factory.name(), "Generating local certificate");
        let key = self.key_factory.generate()?;
        let mut builder = X509Builder::new()?;
        builder.set_version(X509_VERSION_3)?;
        let serial = self.template.serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&self.template.subject)?;
        match &self.issuer {
            Some(issuer) => builder.set_issuer_name(issuer.certificate.subject_name())?,
            None => builder.set_issuer_name(&self.template.subject)?,
        }
        builder.set_not_before(&self.template.not_before)?;
        builder.set_not_after(&self.template.not_after)?;
        builder.set_pubkey(&key)?;
        for extension in self.template.extensions {
            builder.append_extension(extension)?;
        }
        match &self.issuer {
            Some(issuer) => builder.sign(&issuer.key, signature_digest(&issuer.key))?,
            None => builder.sign(&key, signature_digest(&key))?,
        }
        Ok((key, builder.build()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::bn::MsbOption;
    use openssl::x509::extension::{BasicConstraints, KeyUsage};

    use crate::dn::parse_dn;
    use crate::keys::{EcdsaCurve, KeyPairFactory};

    fn template(dn: &str, ca: bool) -> CertificateTemplate {
        let mut serial = BigNum::new().unwrap();
        serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
        let mut extensions = Vec::new();
        if ca {
            extensions.push(BasicConstraints::new().critical().ca().build().unwrap());
            extensions.push(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .unwrap(),
            );
        }
        CertificateTemplate {
            subject: parse_dn(dn).unwrap(),
            serial,
            not_before: Asn1Time::days_from_now(0).unwrap(),
            not_after: Asn1Time::days_from_now(365).unwrap(),
            extensions,
        }
    }

    #[test]
    fn test_self_signed_certificate() {
        let factory = LocalCertificateFactory::new(
            template("CN=root,OU=pki", true),
            KeyPairFactory::Ed25519,
            None,
        );
        let (key, certificate) = factory.produce().unwrap();
        assert_eq!(
            crate::dn::format_name(certificate.subject_name()),
            "CN=root,OU=pki"
        );
        assert_eq!(
            crate::dn::format_name(certificate.issuer_name()),
            "CN=root,OU=pki"
        );
        // Self-signed: the certificate verifies against its own key.
        assert!(certificate.verify(&key).unwrap());
    }

    #[test]
    fn test_parent_signed_certificate() {
        let root_factory = LocalCertificateFactory::new(
            template("CN=root", true),
            KeyPairFactory::Ecdsa(EcdsaCurve::P256),
            None,
        );
        let (root_key, root_certificate) = root_factory.produce().unwrap();
        let root_public = root_certificate.public_key().unwrap();
        let leaf_factory = LocalCertificateFactory::new(
            template("CN=leaf", false),
            KeyPairFactory::Ecdsa(EcdsaCurve::P256),
            Some(Issuer {
                certificate: root_certificate.clone(),
                key: root_key,
            }),
        );
        let (_, leaf_certificate) = leaf_factory.produce().unwrap();
        assert_eq!(
            crate::dn::format_name(leaf_certificate.issuer_name()),
            "CN=root"
        );
        assert!(leaf_certificate.verify(&root_public).unwrap());
    }
}
