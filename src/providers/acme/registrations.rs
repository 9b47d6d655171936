use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use openssl::pkey::{PKey, Private};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::keys::KeyPairFactory;
use crate::providers::acme::config::AcmeProvider;
use crate::state;

const REGISTRATIONS_FILE: &str = "acme-registrations.json";

/// Orders registry reads and read-modify-write updates; independent of the
/// state handler's own locking.
static REGISTRATIONS_LOCK: Lazy<RwLock<()>> = Lazy::new(|| RwLock::new(()));

/// One persisted ACME account: directory provider name, registration email,
/// the wrapped account key and the directory's registration resource. The
/// registration is opaque here beyond its JSON round-trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderRegistration {
    pub provider: String,
    pub email: String,
    pub key: String,
    #[serde(default)]
    pub registration: Option<serde_json::Value>,
}

impl ProviderRegistration {
    /// Unwrap the stored account key (base64-encoded PKCS#8).
    pub fn private_key(&self) -> Option<PKey<Private>> {
        if self.key.is_empty() {
            return None;
        }
        let key_bytes = BASE64.decode(self.key.as_bytes()).ok()?;
        PKey::private_key_from_pkcs8(&key_bytes).ok()
    }
}

/// Look up the account record for `(provider, email)`. When no record
/// exists yet, a fresh one carrying a newly generated key is returned
/// without being persisted.
pub fn get(provider: &AcmeProvider, key_factory: KeyPairFactory) -> Result<ProviderRegistration> {
    let _guard = REGISTRATIONS_LOCK
        .read()
        .expect("registrations lock poisoned");
    let registrations = load_all()?;
    for registration in registrations {
        if registration.provider == provider.name
            && registration.email == provider.registration_email
        {
            return Ok(registration);
        }
    }
    debug!(provider = %provider.name, "Creating new ACME account record");
    let key = key_factory.generate()?;
    let key_bytes = key.private_key_to_pkcs8()?;
    Ok(ProviderRegistration {
        provider: provider.name.clone(),
        email: provider.registration_email.clone(),
        key: BASE64.encode(key_bytes),
        registration: None,
    })
}

/// Persist an account record, replacing any record with the same
/// `(provider, email)` pair. The whole read-modify-write runs under the
/// exclusive registry lock.
pub fn update(update: &ProviderRegistration) -> Result<()> {
    let _guard = REGISTRATIONS_LOCK
        .write()
        .expect("registrations lock poisoned");
    let mut registrations = load_all()?;
    let existing = registrations.iter_mut().find(|registration| {
        registration.provider == update.provider && registration.email == update.email
    });
    match existing {
        Some(registration) => *registration = update.clone(),
        None => registrations.push(update.clone()),
    }
    let registration_bytes = serde_json::to_vec_pretty(&registrations)?;
    state::write(REGISTRATIONS_FILE, &registration_bytes)
}

fn load_all() -> Result<Vec<ProviderRegistration>> {
    let registration_bytes = match state::read(REGISTRATIONS_FILE) {
        Ok(registration_bytes) => registration_bytes,
        Err(Error::NotFound(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(serde_json::from_slice(&registration_bytes)?)
}
