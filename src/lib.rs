//! CertD - Certificate Store and Issuance Daemon Library
//!
//! A long-running service that issues, stores and serves X.509 certificates
//! for an operator's infrastructure. This library provides the persistent
//! certificate store and the issuance pipeline behind the daemon.
//!
//! # Overview
//!
//! Three issuance paths feed one file-backed store:
//!
//! ```text
//! LocalGenerateRequest  ──┐
//! RemoteGenerateRequest ──┼──▶ IssuancePipeline ──▶ FsStore (atomic commit)
//! AcmeGenerateRequest   ──┘          │
//!                                    ▼
//!                     Local / Remote / ACME provider
//! ```
//!
//! - **Local**: self-signed certificates or certificates chained onto any
//!   store entry that carries a certificate and a key.
//! - **Remote**: a private key plus a PKCS#10 signing request for an
//!   external CA; the signed certificate is imported out of band.
//! - **ACME**: a full RFC 8555 order against a configured directory,
//!   including HTTP-01 and TLS-ALPN-01 challenge responders and a persisted
//!   account registry.
//!
//! # Store layout
//!
//! A store is a flat directory: per entry `<name>` up to five artifacts
//! (`<name>.key`, `<name>.crt`, `<name>.csr`, `<name>.crl`, `<name>.json`)
//! plus the `.store` settings file holding the key-encryption secret.
//! Private keys are written as AES-256 encrypted PEM and are decrypted on
//! every read; parsed certificates, requests, revocation lists and
//! attributes are served from bounded in-memory caches.
//!
//! Entry creation is atomic: the target files are opened create-exclusive
//! first, and any failure before commit removes every staged file again.
//!
//! # Security Considerations
//!
//! - The store secret is obfuscated in memory ([`secret::SecretWrapper`]),
//!   not protected; treat process memory as sensitive.
//! - Store directory and files are created with modes `0700`/`0600`; the
//!   scanner warns when it finds looser permissions.

pub mod configs;
pub mod dn;
pub mod encryption;
pub mod error;
pub mod keys;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod secret;
pub mod server;
pub mod state;
pub mod store;

pub use error::{Error, Result};
pub use pipeline::IssuancePipeline;
pub use store::{FsStore, StoreEntry, StoreEntryAttributes};
