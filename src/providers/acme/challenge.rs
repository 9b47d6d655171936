use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    AlpnError, NameType, SniError, SslAcceptor, SslContext, SslContextBuilder, SslMethod,
};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509Extension, X509Name, X509};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// id-pe-acmeIdentifier, the TLS-ALPN-01 validation extension.
const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";
/// ALPN protocol list containing only `acme-tls/1`, in wire format.
const ACME_TLS_ALPN_PROTOCOLS: &[u8] = b"\x0aacme-tls/1";
const CHALLENGE_CERTIFICATE_DAYS: u32 = 7;

fn bind_host(iface: &str) -> &str {
    if iface.is_empty() {
        "0.0.0.0"
    } else {
        iface
    }
}

/// Serves `/.well-known/acme-challenge/<token>` for the duration of one
/// order; the port is released again on drop.
pub struct Http01Responder {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Http01Responder {
    pub async fn serve(
        iface: &str,
        port: u16,
        key_authorizations: HashMap<String, String>,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind((bind_host(iface), port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Serving HTTP-01 challenge responses");
        let router = Router::new()
            .route("/.well-known/acme-challenge/:token", get(challenge_response))
            .with_state(Arc::new(key_authorizations));
        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_signal.await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "HTTP-01 challenge responder failed");
            }
        });
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Http01Responder {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

async fn challenge_response(
    Path(token): Path<String>,
    State(key_authorizations): State<Arc<HashMap<String, String>>>,
) -> Response {
    match key_authorizations.get(&token) {
        Some(key_authorization) => {
            debug!(token = %token, "Answering HTTP-01 challenge request");
            key_authorization.clone().into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Answers `acme-tls/1` handshakes with the per-domain challenge
/// certificate; the port is released again on drop.
pub struct TlsAlpn01Responder {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TlsAlpn01Responder {
    pub fn serve(
        iface: &str,
        port: u16,
        key_authorizations: HashMap<String, String>,
    ) -> Result<Self> {
        let mut contexts = HashMap::new();
        let mut default_identity = None;
        for (domain, key_authorization) in &key_authorizations {
            let (certificate, key) = challenge_certificate(domain, key_authorization)?;
            let context = challenge_context(&certificate, &key)?;
            if default_identity.is_none() {
                default_identity = Some((certificate, key));
            }
            contexts.insert(domain.clone(), context);
        }
        let (default_certificate, default_key) = default_identity.ok_or_else(|| {
            Error::InvalidRequest("no domains for TLS-ALPN-01 challenge".to_string())
        })?;
        let contexts = Arc::new(contexts);

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        builder.set_certificate(&default_certificate)?;
        builder.set_private_key(&default_key)?;
        builder.set_alpn_select_callback(|_, client_protocols| {
            openssl::ssl::select_next_proto(ACME_TLS_ALPN_PROTOCOLS, client_protocols)
                .ok_or(AlpnError::ALERT_FATAL)
        });
        let sni_contexts = contexts.clone();
        builder.set_servername_callback(move |ssl, _alert| {
            if let Some(servername) = ssl.servername(NameType::HOST_NAME) {
                if let Some(context) = sni_contexts.get(servername) {
                    ssl.set_ssl_context(context).map_err(|_| SniError::ALERT_FATAL)?;
                }
            }
            Ok(())
        });
        let acceptor = builder.build();

        let listener = std::net::TcpListener::bind((bind_host(iface), port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Serving TLS-ALPN-01 challenge handshakes");
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let thread = thread::spawn(move || {
            while !shutdown_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Answering TLS-ALPN-01 handshake");
                        let _ = stream.set_nonblocking(false);
                        let acceptor = acceptor.clone();
                        thread::spawn(move || {
                            // The handshake itself is the challenge answer.
                            let _ = acceptor.accept(stream);
                        });
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(err) => {
                        warn!(error = %err, "TLS-ALPN-01 challenge responder failed");
                        break;
                    }
                }
            }
        });
        Ok(Self {
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TlsAlpn01Responder {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn challenge_context(certificate: &X509, key: &PKey<Private>) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    builder.set_certificate(certificate)?;
    builder.set_private_key(key)?;
    builder.set_alpn_select_callback(|_, client_protocols| {
        openssl::ssl::select_next_proto(ACME_TLS_ALPN_PROTOCOLS, client_protocols)
            .ok_or(AlpnError::ALERT_FATAL)
    });
    Ok(builder.build())
}

/// Build the self-signed TLS-ALPN-01 validation certificate: SAN for the
/// domain plus the critical acmeIdentifier extension carrying the SHA-256
/// digest of the key authorization.
fn challenge_certificate(domain: &str, key_authorization: &str) -> Result<(X509, PKey<Private>)> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_text("CN", domain)?;
    let name = name_builder.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(CHALLENGE_CERTIFICATE_DAYS)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&key)?;
    let san = SubjectAlternativeName::new()
        .dns(domain)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;
    let digest = hash(MessageDigest::sha256(), key_authorization.as_bytes())?;
    // acmeIdentifier payload: DER OCTET STRING wrapping the digest
    let mut extension_der = vec![0x04, digest.len() as u8];
    extension_der.extend_from_slice(&digest);
    let oid = Asn1Object::from_str(ACME_IDENTIFIER_OID)?;
    let contents = Asn1OctetString::new_from_bytes(&extension_der)?;
    let extension = X509Extension::new_from_der(&oid, true, &contents)?;
    builder.append_extension(extension)?;
    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http01_responder_serves_token() {
        let mut key_authorizations = HashMap::new();
        key_authorizations.insert("token0".to_string(), "token0.keyauth".to_string());
        let responder = Http01Responder::serve("127.0.0.1", 0, key_authorizations)
            .await
            .unwrap();
        let mut stream = tokio::net::TcpStream::connect(responder.local_addr())
            .await
            .unwrap();
        stream
            .write_all(b"GET /.well-known/acme-challenge/token0 HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 200"));
        assert!(response.ends_with("token0.keyauth"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http01_responder_unknown_token() {
        let responder = Http01Responder::serve("127.0.0.1", 0, HashMap::new())
            .await
            .unwrap();
        let mut stream = tokio::net::TcpStream::connect(responder.local_addr())
            .await
            .unwrap();
        stream
            .write_all(b"GET /.well-known/acme-challenge/missing HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 404"));
    }

    #[test]
    fn test_challenge_certificate_carries_acme_identifier() {
        let (certificate, _key) =
            challenge_certificate("example.com", "token0.keyauth").unwrap();
        let text = String::from_utf8(certificate.to_text().unwrap()).unwrap();
        assert!(text.contains(ACME_IDENTIFIER_OID));
        let san = certificate.subject_alt_names().unwrap();
        assert_eq!(san.len(), 1);
        assert_eq!(san[0].dnsname(), Some("example.com"));
    }

    #[test]
    fn test_tls_alpn01_responder_handshake() {
        let mut key_authorizations = HashMap::new();
        key_authorizations.insert("localhost".to_string(), "token0.keyauth".to_string());
        let responder =
            TlsAlpn01Responder::serve("127.0.0.1", 0, key_authorizations).unwrap();

        let mut builder =
            openssl::ssl::SslConnector::builder(SslMethod::tls()).unwrap();
        builder.set_verify(openssl::ssl::SslVerifyMode::NONE);
        builder.set_alpn_protos(ACME_TLS_ALPN_PROTOCOLS).unwrap();
        let connector = builder.build();
        let stream = std::net::TcpStream::connect(responder.local_addr()).unwrap();
        let mut configuration = connector.configure().unwrap();
        configuration.set_verify_hostname(false);
        let tls_stream = configuration.connect("localhost", stream).unwrap();
        assert_eq!(
            tls_stream.ssl().selected_alpn_protocol(),
            Some(b"acme-tls/1".as_ref())
        );
    }
}
