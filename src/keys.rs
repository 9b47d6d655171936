use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;

use crate::error::{Error, Result};

pub const ECDSA_PROVIDER: &str = "ECDSA";
pub const ED25519_PROVIDER: &str = "ED25519";
pub const RSA_PROVIDER: &str = "RSA";

/// The NIST curves offered by the ECDSA family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaCurve {
    P224,
    P256,
    P384,
    P521,
}

impl EcdsaCurve {
    fn nid(self) -> Nid {
        match self {
            EcdsaCurve::P224 => Nid::SECP224R1,
            EcdsaCurve::P256 => Nid::X9_62_PRIME256V1,
            EcdsaCurve::P384 => Nid::SECP384R1,
            EcdsaCurve::P521 => Nid::SECP521R1,
        }
    }

    fn bits(self) -> u32 {
        match self {
            EcdsaCurve::P224 => 224,
            EcdsaCurve::P256 => 256,
            EcdsaCurve::P384 => 384,
            EcdsaCurve::P521 => 521,
        }
    }
}

/// A key-pair generation strategy. Two factories with equal names produce
/// indistinguishable key configurations, so the name doubles as identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPairFactory {
    Ecdsa(EcdsaCurve),
    Ed25519,
    Rsa(u32),
}

impl KeyPairFactory {
    pub fn name(&self) -> String {
        match self {
            KeyPairFactory::Ecdsa(curve) => format!("{} P-{}", ECDSA_PROVIDER, curve.bits()),
            KeyPairFactory::Ed25519 => ED25519_PROVIDER.to_string(),
            KeyPairFactory::Rsa(bits) => format!("{} {}", RSA_PROVIDER, bits),
        }
    }

    /// Generate a fresh key pair. RSA generation is CPU-bound and may take
    /// noticeable time for large moduli.
    pub fn generate(&self) -> Result<PKey<Private>> {
        let key = match self {
            KeyPairFactory::Ecdsa(curve) => {
                let group = EcGroup::from_curve_name(curve.nid())?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
            KeyPairFactory::Ed25519 => PKey::generate_ed25519()?,
            KeyPairFactory::Rsa(bits) => PKey::from_rsa(Rsa::generate(*bits)?)?,
        };
        Ok(key)
    }
}

/// The key provider families the registry knows about.
pub fn providers() -> &'static [&'static str] {
    &[ECDSA_PROVIDER, ED25519_PROVIDER, RSA_PROVIDER]
}

/// The standard factories of one provider family.
pub fn standard_factories(provider: &str) -> Vec<KeyPairFactory> {
    match provider {
        ECDSA_PROVIDER => vec![
            KeyPairFactory::Ecdsa(EcdsaCurve::P224),
            KeyPairFactory::Ecdsa(EcdsaCurve::P256),
            KeyPairFactory::Ecdsa(EcdsaCurve::P384),
            KeyPairFactory::Ecdsa(EcdsaCurve::P521),
        ],
        ED25519_PROVIDER => vec![KeyPairFactory::Ed25519],
        RSA_PROVIDER => vec![
            KeyPairFactory::Rsa(2048),
            KeyPairFactory::Rsa(3072),
            KeyPairFactory::Rsa(4096),
        ],
        _ => Vec::new(),
    }
}

/// Look up a standard factory by its full name.
pub fn factory(name: &str) -> Result<KeyPairFactory> {
    providers()
        .iter()
        .flat_map(|provider| standard_factories(provider))
        .find(|factory| factory.name() == name)
        .ok_or_else(|| Error::InvalidKeyType(name.to_string()))
}

/// Derive the factory-style display name from a certificate public key,
/// e.g. `ECDSA P-256` or `RSA 4096`.
pub fn public_key_type<T: HasPublic>(key: &PKeyRef<T>) -> String {
    match key.id() {
        Id::EC => match key.ec_key() {
            Ok(ec_key) => format!(
                "{} P-{}",
                ECDSA_PROVIDER,
                ec_key.group().degree()
            ),
            Err(_) => ECDSA_PROVIDER.to_string(),
        },
        Id::ED25519 => ED25519_PROVIDER.to_string(),
        Id::RSA => match key.rsa() {
            Ok(rsa) => format!("{} {}", RSA_PROVIDER, rsa.n().num_bits()),
            Err(_) => RSA_PROVIDER.to_string(),
        },
        _ => "<unrecognized>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_names() {
        assert_eq!(KeyPairFactory::Ecdsa(EcdsaCurve::P256).name(), "ECDSA P-256");
        assert_eq!(KeyPairFactory::Ed25519.name(), "ED25519");
        assert_eq!(KeyPairFactory::Rsa(2048).name(), "RSA 2048");
    }

    #[test]
    fn test_standard_factories() {
        assert_eq!(standard_factories(ECDSA_PROVIDER).len(), 4);
        assert_eq!(standard_factories(ED25519_PROVIDER).len(), 1);
        let rsa_names: Vec<String> = standard_factories(RSA_PROVIDER)
            .iter()
            .map(|factory| factory.name())
            .collect();
        assert_eq!(rsa_names, ["RSA 2048", "RSA 3072", "RSA 4096"]);
    }

    #[test]
    fn test_factory_lookup() {
        assert_eq!(
            factory("ECDSA P-521").unwrap(),
            KeyPairFactory::Ecdsa(EcdsaCurve::P521)
        );
        assert_eq!(factory("ED25519").unwrap(), KeyPairFactory::Ed25519);
        assert!(matches!(
            factory("RSA 1234"),
            Err(Error::InvalidKeyType(_))
        ));
        assert!(matches!(factory("DSA 1024"), Err(Error::InvalidKeyType(_))));
    }

    #[test]
    fn test_non_standard_rsa_size_is_constructible() {
        let factory = KeyPairFactory::Rsa(1024);
        assert_eq!(factory.name(), "RSA 1024");
        let key = factory.generate().unwrap();
        assert_eq!(key.rsa().unwrap().n().num_bits(), 1024);
    }

    #[test]
    fn test_generate_ecdsa_and_ed25519() {
        let ec_key = KeyPairFactory::Ecdsa(EcdsaCurve::P256).generate().unwrap();
        assert_eq!(public_key_type(&ec_key), "ECDSA P-256");
        let ed_key = KeyPairFactory::Ed25519.generate().unwrap();
        assert_eq!(public_key_type(&ed_key), "ED25519");
    }
}
