//! TLS termination
//!
//! The proxy presents its own certificate to the client and opens a separate
//! TLS client session to the upstream, so rules see decrypted plaintext.

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{AbortHandle, Peer, Protocol, StreamBinding, TcpBinding};
use crate::address::Endpoint;
use crate::error::{ProxyError, Result};
use crate::logger::log;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a server config from PEM certificate and key files
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path).map_err(|e| {
        ProxyError::Tls(format!("cannot open {}: {}", cert_path.display(), e))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| ProxyError::Tls(format!("cannot open {}: {}", key_path.display(), e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .ok_or_else(|| {
            ProxyError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    server_config_from_der(certs, key)
}

/// Build a server config from DER certificate chain and key
pub fn server_config_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Server config with a freshly generated self-signed certificate
pub fn self_signed_server_config(names: &[&str]) -> Result<Arc<ServerConfig>> {
    let (cert, key) = generate_self_signed(names)?;
    server_config_from_der(vec![cert], key)
}

/// Generate a self-signed leaf certificate and PKCS#8 key for `names`
pub fn generate_self_signed(
    names: &[&str],
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ProxyError::Tls(format!("generate certificate: {}", e)))?;
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((cert, PrivateKeyDer::Pkcs8(key)))
}

/// Client config that accepts any upstream certificate.
///
/// The proxy sits in front of servers under test, so upstream identity is
/// not verified.
pub fn insecure_client_config() -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let verifier = Arc::new(NoVerify {
        schemes: provider
            .signature_verification_algorithms
            .supported_schemes(),
    });
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Certificate verifier that skips all verification
#[derive(Debug)]
struct NoVerify {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// TLS over TCP on both legs
pub struct TlsBinding {
    tcp: TcpBinding,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl TlsBinding {
    /// `server_name` overrides the SNI sent upstream; by default the
    /// upstream host is used.
    pub fn new(
        tcp: TcpBinding,
        server_config: Arc<ServerConfig>,
        client_config: Arc<ClientConfig>,
        server_name: Option<&str>,
    ) -> Result<Self> {
        let server_name = server_name.map(parse_server_name).transpose()?;
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(server_config),
            connector: TlsConnector::from(client_config),
            server_name,
        })
    }
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| ProxyError::Config(format!("invalid server name '{}': {}", name, e)))
}

#[async_trait]
impl StreamBinding for TlsBinding {
    fn protocol(&self) -> Protocol {
        Protocol::Tls
    }

    async fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<Peer> {
        self.tcp.configure(&stream);
        let abort = AbortHandle::for_tcp(&stream);
        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| ProxyError::Handshake(format!("client {}: {}", addr, e)))?;
        log::debug!(peer = %addr, "TLS handshake with client successful");
        Ok(Peer::new(Box::pin(tls_stream), addr).with_abort_handle(abort))
    }

    async fn connect(&self, upstream: &Endpoint) -> Result<Peer> {
        let server_name = match &self.server_name {
            Some(name) => name.clone(),
            None => parse_server_name(upstream.bind_host())?,
        };
        let (stream, addr) = self.tcp.connect_tcp(upstream).await?;
        let abort = AbortHandle::for_tcp(&stream);
        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Handshake(format!("upstream {}: {}", upstream, e)))?;
        log::debug!(upstream = %addr, "TLS handshake with upstream successful");
        Ok(Peer::new(Box::pin(tls_stream), addr).with_abort_handle(abort))
    }
}
