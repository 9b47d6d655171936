use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// ACME client configuration: the reachable directories and the challenge
/// setup per domain suffix.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, AcmeProvider>,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
}

/// One ACME directory; the map key becomes the provider's external name.
#[derive(Debug, Clone, Deserialize)]
pub struct AcmeProvider {
    #[serde(skip)]
    pub name: String,
    pub url: String,
    pub registration_email: String,
}

/// Challenge configuration for one domain suffix.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainConfig {
    #[serde(skip)]
    pub domain: String,
    #[serde(rename = "http-01", default)]
    pub http01_challenge: ChallengeConfig,
    #[serde(rename = "tls-apn-01", default)]
    pub tls_alpn01_challenge: ChallengeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChallengeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub iface: String,
    #[serde(default)]
    pub port: u16,
}

impl AcmeConfig {
    /// Load the configuration and back-fill the map keys into the provider
    /// and domain records.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_bytes = fs::read(path).map_err(|err| {
            Error::InvalidRequest(format!(
                "failed to read ACME configuration file '{}': {}",
                path.display(),
                err
            ))
        })?;
        let mut config: AcmeConfig = serde_yaml::from_slice(&config_bytes)?;
        for (name, provider) in config.providers.iter_mut() {
            provider.name = name.clone();
        }
        for (domain, domain_config) in config.domains.iter_mut() {
            domain_config.domain = domain.clone();
        }
        Ok(config)
    }

    pub fn provider(&self, name: &str) -> Option<&AcmeProvider> {
        self.providers.get(name)
    }

    /// Select the domain configuration for an order: the entry whose domain
    /// value is the longest suffix of the dot-terminated first order domain.
    pub fn domain_config(&self, domains: &[String]) -> Result<&DomainConfig> {
        let first = domains
            .first()
            .ok_or_else(|| Error::InvalidRequest("missing domain information".to_string()))?;
        let mut prepared = first.clone();
        if !prepared.ends_with('.') {
            prepared.push('.');
        }
        let mut selected: Option<&DomainConfig> = None;
        for domain_config in self.domains.values() {
            if !prepared.ends_with(&domain_config.domain) {
                continue;
            }
            match selected {
                Some(current) if current.domain.len() >= domain_config.domain.len() => {}
                _ => selected = Some(domain_config),
            }
        }
        selected.ok_or_else(|| {
            Error::InvalidRequest(format!("missing domain configuration for '{}'", prepared))
        })
    }
}
