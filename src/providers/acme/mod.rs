pub mod challenge;
pub mod config;
pub mod registrations;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509ReqBuilder, X509};
use tracing::{debug, info, warn};

use crate::encryption::{
    decode_single_block, CERTIFICATE_TAG, EC_PRIVATE_KEY_TAG, RSA_PRIVATE_KEY_TAG,
};
use crate::error::{Error, Result};
use crate::keys::KeyPairFactory;
use crate::providers::ACME_PROVIDER_PREFIX;

use self::config::{AcmeConfig, AcmeProvider, DomainConfig};
use self::registrations::ProviderRegistration;

const ORDER_READY_TIMEOUT: Duration = Duration::from_secs(120);
const CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(60);

/// The order key profiles the directory client supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderKeyType {
    Ec256,
    Ec384,
    Rsa2048,
    Rsa4096,
    Rsa8192,
}

/// Obtains a certificate by driving one ACME order: account resolution,
/// challenge responders, order submission and artifact decoding.
pub struct AcmeCertificateFactory {
    name: String,
    domains: Vec<String>,
    config_path: PathBuf,
    provider_name: String,
    key_factory: KeyPairFactory,
}

impl AcmeCertificateFactory {
    pub fn new(
        domains: Vec<String>,
        config_path: PathBuf,
        provider_name: String,
        key_factory: KeyPairFactory,
    ) -> Self {
        let name = format!("{}{}", ACME_PROVIDER_PREFIX, provider_name);
        Self {
            name,
            domains,
            config_path,
            provider_name,
            key_factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn produce(self) -> Result<(PKey<Private>, X509)> {
        let config = AcmeConfig::load(&self.config_path)?;
        let provider = config
            .provider(&self.provider_name)
            .cloned()
            .ok_or_else(|| Error::InvalidAcmeCa(self.provider_name.clone()))?;
        let domain_config = config.domain_config(&self.domains)?.clone();
        let order_key_type = self.order_key_type()?;
        let mut registration = registrations::get(&provider, self.key_factory)?;
        // The order is network-bound and blocks for as long as the
        // directory plus challenge verification require.
        let runtime = tokio::runtime::Runtime::new()?;
        let (key_pem, certificate_pem) = runtime.block_on(self.obtain(
            &provider,
            &domain_config,
            &mut registration,
            order_key_type,
        ))?;
        let key = decode_private_key(key_pem.as_bytes())?;
        let certificate = decode_certificate(certificate_pem.as_bytes())?;
        Ok((key, certificate))
    }

    fn order_key_type(&self) -> Result<OrderKeyType> {
        order_key_type_by_name(&self.key_factory.name())
    }

    async fn obtain(
        &self,
        provider: &AcmeProvider,
        domain_config: &DomainConfig,
        registration: &mut ProviderRegistration,
        order_key_type: OrderKeyType,
    ) -> Result<(String, String)> {
        let account = self.resolve_account(provider, registration).await?;
        let identifiers: Vec<Identifier> = self
            .domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();
        info!(provider = %provider.name, domains = ?self.domains, "Creating certificate order");
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(acme_error)?;

        let mut http01_tokens = HashMap::new();
        let mut tls_alpn01_authorizations = HashMap::new();
        let mut challenge_urls = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(acme_error)?;
                let identifier = authz.identifier();
                let domain = match &identifier.identifier {
                    Identifier::Dns(domain) => domain.clone(),
                    _ => continue,
                };
                if authz.status == AuthorizationStatus::Valid {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                let has_http01 = authz
                    .challenges
                    .iter()
                    .any(|c| c.r#type == ChallengeType::Http01);
                let has_tls_alpn01 = authz
                    .challenges
                    .iter()
                    .any(|c| c.r#type == ChallengeType::TlsAlpn01);
                if domain_config.http01_challenge.enabled && has_http01 {
                    if let Some(challenge) = authz.challenge(ChallengeType::Http01) {
                        let key_authorization = challenge.key_authorization();
                        http01_tokens.insert(
                            challenge.token.clone(),
                            key_authorization.as_str().to_string(),
                        );
                        challenge_urls.push(challenge.url.clone());
                        continue;
                    }
                }
                else if domain_config.tls_alpn01_challenge.enabled && has_tls_alpn01 {
                    if let Some(challenge) = authz.challenge(ChallengeType::TlsAlpn01) {
                        let key_authorization = challenge.key_authorization();
                        tls_alpn01_authorizations
                            .insert(domain.clone(), key_authorization.as_str().to_string());
                        challenge_urls.push(challenge.url.clone());
                        continue;
                    }
                }
                return Err(Error::InvalidRequest(format!(
                    "no enabled challenge for domain '{}'",
                    domain
                )));
            }
        }

        // The responders hold their ports only until the order returns.
        let _http01_responder = if http01_tokens.is_empty() {
            None
        } else {
            Some(
                challenge::Http01Responder::serve(
                    &domain_config.http01_challenge.iface,
                    domain_config.http01_challenge.port,
                    http01_tokens,
                )
                .await?,
            )
        };
        let _tls_alpn01_responder = if tls_alpn01_authorizations.is_empty() {
            None
        } else {
            Some(challenge::TlsAlpn01Responder::serve(
                &domain_config.tls_alpn01_challenge.iface,
                domain_config.tls_alpn01_challenge.port,
                tls_alpn01_authorizations,
            )?)
        };

        for challenge_url in &challenge_urls {
            set_challenge_ready(&mut order, challenge_url).await?;
        }
        wait_for_order_ready(&mut order).await?;

        let key = self.key_factory.generate()?;
        let csr_der = order_csr(&key, &self.domains)?;
        order.finalize_csr(&csr_der).await.map_err(acme_error)?;
        let chain = wait_for_certificate(&mut order).await?;
        let certificate_pem = first_certificate_block(&chain)?;
        let key_pem = match order_key_type {
            OrderKeyType::Ec256 | OrderKeyType::Ec384 => {
                String::from_utf8(key.ec_key()?.private_key_to_pem()?)
                    .map_err(|_| Error::Pem("key PEM is not valid UTF-8".to_string()))?
            }
            _ => String::from_utf8(key.rsa()?.private_key_to_pem()?)
                .map_err(|_| Error::Pem("key PEM is not valid UTF-8".to_string()))?,
        };
        info!(provider = %provider.name, domains = ?self.domains, "Certificate obtained");
        Ok((key_pem, certificate_pem))
    }

    /// Bind the persisted account, or register anew when no registration is
    /// stored or the directory rejects the stored one. A fresh registration
    /// is persisted before the order proceeds.
    async fn resolve_account(
        &self,
        provider: &AcmeProvider,
        registration: &mut ProviderRegistration,
    ) -> Result<Account> {
        if let Some(stored) = &registration.registration {
            match serde_json::from_value::<AccountCredentials>(stored.clone()) {
                Ok(credentials) => {
                    match Account::builder()
                        .map_err(acme_error)?
                        .from_credentials(credentials)
                        .await
                    {
                        Ok(account) => return Ok(account),
                        Err(err) => {
                            warn!(provider = %provider.name, error = %err,
                                "Stored ACME registration rejected, re-registering");
                        }
                    }
                }
                Err(err) => {
                    warn!(provider = %provider.name, error = %err,
                        "Stored ACME registration unreadable, re-registering");
                }
            }
        }
        info!(provider = %provider.name, email = %provider.registration_email,
            "Registering at ACME provider");
        let contact = format!("mailto:{}", provider.registration_email);
        let new_account = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::builder()
            .map_err(acme_error)?
            .create(&new_account, provider.url.clone(), None)
            .await
            .map_err(acme_error)?;
        registration.registration = Some(serde_json::to_value(&credentials)?);
        registrations::update(registration)?;
        Ok(account)
    }
}

fn acme_error<E: std::fmt::Display>(err: E) -> Error {
    Error::Acme(err.to_string())
}

fn order_key_type_by_name(name: &str) -> Result<OrderKeyType> {
    match name {
        "ECDSA P-256" => Ok(OrderKeyType::Ec256),
        "ECDSA P-384" => Ok(OrderKeyType::Ec384),
        "RSA 2048" => Ok(OrderKeyType::Rsa2048),
        "RSA 4096" => Ok(OrderKeyType::Rsa4096),
        "RSA 8192" => Ok(OrderKeyType::Rsa8192),
        other => Err(Error::InvalidKeyType(other.to_string())),
    }
}

/// Check that a key factory maps onto a directory key profile before any
/// order work starts.
pub fn validate_order_key_type(key_factory: &KeyPairFactory) -> Result<()> {
    order_key_type_by_name(&key_factory.name()).map(|_| ())
}

/// Find the challenge behind `challenge_url` and mark it ready for
/// validation.
async fn set_challenge_ready(order: &mut Order, challenge_url: &str) -> Result<()> {
    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz = result.map_err(acme_error)?;
        let matching_type = authz
            .challenges
            .iter()
            .find(|challenge| challenge.url == challenge_url)
            .map(|challenge| challenge.r#type.clone());
        if let Some(challenge_type) = matching_type {
            if let Some(mut challenge) = authz.challenge(challenge_type) {
                challenge.set_ready().await.map_err(acme_error)?;
                return Ok(());
            }
        }
    }
    Err(Error::Acme(format!(
        "challenge not found for URL '{}'",
        challenge_url
    )))
}

async fn wait_for_order_ready(order: &mut Order) -> Result<()> {
    let deadline = tokio::time::Instant::now() + ORDER_READY_TIMEOUT;
    loop {
        let status = order.refresh().await.map_err(acme_error)?.status;
        match status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                return Err(Error::Acme("order became invalid".to_string()));
            }
            _ => {
                if tokio::time::Instant::now() > deadline {
                    return Err(Error::Acme(
                        "timed out waiting for order to become ready".to_string(),
                    ));
                }
                debug!(status = ?status, "Order not ready yet, waiting...");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn wait_for_certificate(order: &mut Order) -> Result<String> {
    let deadline = tokio::time::Instant::now() + CERTIFICATE_TIMEOUT;
    loop {
        let status = order.refresh().await.map_err(acme_error)?.status;
        match status {
            OrderStatus::Valid => {
                let certificate = order.certificate().await.map_err(acme_error)?;
                return certificate
                    .ok_or_else(|| Error::Acme("no certificate in response".to_string()));
            }
            OrderStatus::Invalid => {
                return Err(Error::Acme("order became invalid".to_string()));
            }
            _ => {
                if tokio::time::Instant::now() > deadline {
                    return Err(Error::Acme(
                        "timed out waiting for certificate".to_string(),
                    ));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Build the order CSR: subject alternative names for every order domain,
/// signed with the end-entity key.
fn order_csr(key: &PKeyRef<Private>, domains: &[String]) -> Result<Vec<u8>> {
    let mut builder = X509ReqBuilder::new()?;
    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let extension = san.build(&builder.x509v3_context(None))?;
    let mut extensions = Stack::new()?;
    extensions.push(extension)?;
    builder.add_extensions(&extensions)?;
    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build().to_der()?)
}

/// Extract the end-entity certificate from the returned PEM chain.
fn first_certificate_block(chain: &str) -> Result<String> {
    let end_marker = "-----END CERTIFICATE-----";
    let end = chain.find(end_marker).ok_or_else(|| {
        Error::Pem("missing certificate block in ACME response".to_string())
    })?;
    let mut block = chain[..end + end_marker.len()].to_string();
    block.push('\n');
    Ok(block)
}

/// Decode the single returned key block; the directory client hands keys
/// back in SEC1 (`EC PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) form.
fn decode_private_key(key_bytes: &[u8]) -> Result<PKey<Private>> {
    let block = decode_single_block(key_bytes)?;
    match block.tag.as_str() {
        EC_PRIVATE_KEY_TAG => Ok(PKey::from_ec_key(EcKey::private_key_from_der(&block.data)?)?),
        RSA_PRIVATE_KEY_TAG => Ok(PKey::from_rsa(Rsa::private_key_from_der(&block.data)?)?),
        other => Err(Error::Pem(format!("unexpected PEM block type '{}'", other))),
    }
}

fn decode_certificate(certificate_bytes: &[u8]) -> Result<X509> {
    let block = decode_single_block(certificate_bytes)?;
    block.expect_tag(CERTIFICATE_TAG)?;
    Ok(X509::from_der(&block.data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EcdsaCurve;

    fn factory(key_factory: KeyPairFactory) -> AcmeCertificateFactory {
        AcmeCertificateFactory::new(
            vec!["localhost".to_string()],
            PathBuf::from("acme.yaml"),
            "Test".to_string(),
            key_factory,
        )
    }

    #[test]
    fn test_factory_name_carries_provider_prefix() {
        assert_eq!(factory(KeyPairFactory::Ed25519).name(), "ACME:Test");
    }

    #[test]
    fn test_order_key_type_mapping() {
        assert_eq!(
            factory(KeyPairFactory::Ecdsa(EcdsaCurve::P256))
                .order_key_type()
                .unwrap(),
            OrderKeyType::Ec256
        );
        assert_eq!(
            factory(KeyPairFactory::Ecdsa(EcdsaCurve::P384))
                .order_key_type()
                .unwrap(),
            OrderKeyType::Ec384
        );
        assert_eq!(
            factory(KeyPairFactory::Rsa(2048)).order_key_type().unwrap(),
            OrderKeyType::Rsa2048
        );
        assert_eq!(
            factory(KeyPairFactory::Rsa(4096)).order_key_type().unwrap(),
            OrderKeyType::Rsa4096
        );
        assert_eq!(
            factory(KeyPairFactory::Rsa(8192)).order_key_type().unwrap(),
            OrderKeyType::Rsa8192
        );
        assert!(matches!(
            factory(KeyPairFactory::Ed25519).order_key_type(),
            Err(Error::InvalidKeyType(_))
        ));
        assert!(matches!(
            factory(KeyPairFactory::Ecdsa(EcdsaCurve::P224)).order_key_type(),
            Err(Error::InvalidKeyType(_))
        ));
        assert!(matches!(
            factory(KeyPairFactory::Rsa(3072)).order_key_type(),
            Err(Error::InvalidKeyType(_))
        ));
    }

    #[test]
    fn test_decode_private_key_ec() {
        let key = KeyPairFactory::Ecdsa(EcdsaCurve::P256).generate().unwrap();
        let pem = key.ec_key().unwrap().private_key_to_pem().unwrap();
        let decoded = decode_private_key(&pem).unwrap();
        assert_eq!(
            decoded.private_key_to_pkcs8().unwrap(),
            key.private_key_to_pkcs8().unwrap()
        );
    }

    #[test]
    fn test_decode_private_key_rsa() {
        let key = KeyPairFactory::Rsa(2048).generate().unwrap();
        let pem = key.rsa().unwrap().private_key_to_pem().unwrap();
        let decoded = decode_private_key(&pem).unwrap();
        assert_eq!(
            decoded.private_key_to_pkcs8().unwrap(),
            key.private_key_to_pkcs8().unwrap()
        );
    }

    #[test]
    fn test_decode_private_key_rejects_other_tags() {
        let key = KeyPairFactory::Ed25519.generate().unwrap();
        let pem = key.private_key_to_pem_pkcs8().unwrap();
        assert!(matches!(decode_private_key(&pem), Err(Error::Pem(_))));
    }

    #[test]
    fn test_first_certificate_block_extracts_leaf() {
        let chain = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n\
-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n";
        let leaf = first_certificate_block(chain).unwrap();
        assert!(leaf.contains("AAAA"));
        assert!(!leaf.contains("BBBB"));
        assert!(matches!(
            first_certificate_block("no pem here"),
            Err(Error::Pem(_))
        ));
    }

    #[test]
    fn test_decode_certificate_rejects_chain() {
        let chain = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n\
-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            decode_certificate(chain.as_bytes()),
            Err(Error::Pem(_))
        ));
    }
}
