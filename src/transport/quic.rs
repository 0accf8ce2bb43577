//! QUIC transport implementation
//!
//! The obfuscated side of every circuit: one QUIC connection (quinn over
//! rustls, ALPN `netshaper-pt`) carrying exactly one bidirectional stream.
//! The server role accepts them through [`QuicAcceptor`], the client role
//! opens them through [`QuicDialer`].

use super::{AcceptError, Acceptor, Connection, Dialer, OpenError};
use crate::config::Config;
use crate::constants::CLOSE_OK;
use anyhow::{anyhow, Context, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, Incoming, RecvStream, SendStream, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(config: &Config) -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        Duration::from_millis(config.quic.idle_timeout_ms).try_into()?,
    ));
    if config.quic.keep_alive_interval_ms > 0 {
        transport.keep_alive_interval(Some(Duration::from_millis(config.quic.keep_alive_interval_ms)));
    }
    Ok(Arc::new(transport))
}

fn alpn(config: &Config) -> Vec<Vec<u8>> {
    config.alpn_protocols.iter().map(|s| s.as_bytes().to_vec()).collect()
}

/// Load the server certificate pair from PEM files and build the QUIC server config
pub fn load_server_config(cert_path: &Path, key_path: &Path, config: &Config) -> Result<quinn::ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read certificate file {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read private key file {}", key_path.display()))?;
    server_config_from_pem(&cert_pem, &key_pem, config)
}

/// Build the QUIC server config from in-memory PEM data
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8], config: &Config) -> Result<quinn::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificate found"));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .context("Failed to parse private key")?
        .ok_or_else(|| anyhow!("No private key found"))?;

    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to create TLS config")?;
    tls.alpn_protocols = alpn(config);

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(tls)?));
    server_config.transport_config(transport_config(config)?);
    Ok(server_config)
}

/// Build the QUIC client config.
///
/// Without `tls.ca_cert_path` any server certificate is accepted: bridge
/// certificates are self-signed and distributed out of band.
pub fn client_config(config: &Config) -> Result<quinn::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let mut tls = match &config.tls.ca_cert_path {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read CA certificate file {}", path))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())) {
                roots
                    .add(cert.context("Failed to parse CA certificate")?)
                    .map_err(|e| anyhow!("Failed to add root cert: {}", e))?;
            }
            if roots.is_empty() {
                return Err(anyhow!("No CA certificate found in {}", path));
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => {
            debug!("Server certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth()
        }
    };
    tls.alpn_protocols = alpn(config);

    let mut client_config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls)?));
    client_config.transport_config(transport_config(config)?);
    Ok(client_config)
}

/// Self-signed certificate and key, PEM encoded
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl GeneratedCert {
    /// Write `cert.pem` and `key.pem` into `dir`, creating it if needed
    pub fn write_to(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create certificate directory {}", dir.display()))?;
        let (cert_path, key_path) = Config::cert_files_in(dir);
        std::fs::write(&cert_path, &self.cert_pem)
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        std::fs::write(&key_path, &self.key_pem)
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {}", key_path.display()))?;
        }
        Ok((cert_path, key_path))
    }
}

/// Generate a self-signed certificate for the given subject names
pub fn generate_self_signed(subject_alt_names: Vec<String>) -> Result<GeneratedCert> {
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)?;
    Ok(GeneratedCert {
        cert_pem: certified_key.cert.pem(),
        key_pem: certified_key.signing_key.serialize_pem(),
    })
}

/// Certificate verifier that accepts any server certificate but still
/// checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            supported_algs: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// One bidirectional QUIC stream plus the connection that carries it
pub struct QuicStream {
    connection: quinn::Connection,
    send: SendStream,
    recv: RecvStream,
    linger: Duration,
    closed: bool,
}

impl QuicStream {
    pub fn new(connection: quinn::Connection, send: SendStream, recv: RecvStream, linger: Duration) -> Self {
        Self {
            connection,
            send,
            recv,
            linger,
            closed: false,
        }
    }

    /// Complete the handshake of an incoming connection and accept its stream
    pub async fn accept(incoming: Incoming, linger: Duration) -> io::Result<Self> {
        let connection = incoming.await?;
        debug!(peer = %connection.remote_address(), "QUIC handshake complete");
        let (send, recv) = connection.accept_bi().await?;
        Ok(Self::new(connection, send, recv, linger))
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Tear the connection down with an application error code.
    ///
    /// This is how the server tells the client its circuit could not be
    /// completed.
    pub fn refuse(self, code: u32, reason: &str) {
        self.connection.close(VarInt::from_u32(code), reason.as_bytes());
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncRead::poll_read(Pin::new(&mut this.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        AsyncWrite::poll_write(Pin::new(&mut this.send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncWrite::poll_flush(Pin::new(&mut this.send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncWrite::poll_shutdown(Pin::new(&mut this.send), cx)
    }
}

/// Write half of a split [`QuicStream`]; keeps the connection handle so the
/// stream can be put back together for the full close.
pub struct QuicSendHalf {
    connection: quinn::Connection,
    send: SendStream,
    linger: Duration,
}

impl AsyncWrite for QuicSendHalf {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        AsyncWrite::poll_write(Pin::new(&mut this.send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncWrite::poll_flush(Pin::new(&mut this.send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncWrite::poll_shutdown(Pin::new(&mut this.send), cx)
    }
}

impl Connection for QuicStream {
    type Reader = RecvStream;
    type Writer = QuicSendHalf;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            self.recv,
            QuicSendHalf {
                connection: self.connection,
                send: self.send,
                linger: self.linger,
            },
        )
    }

    fn reunite(reader: Self::Reader, writer: Self::Writer) -> io::Result<Self> {
        Ok(Self::new(writer.connection, writer.send, reader, writer.linger))
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Already finished by the relay's half-close in the common case
        let _ = self.send.finish();
        // Closing the connection discards unacknowledged data, so give the
        // peer a bounded chance to receive everything first.
        match tokio::time::timeout(self.linger, self.send.stopped()).await {
            Ok(_) => {}
            Err(_) => debug!(
                peer = %self.connection.remote_address(),
                "Peer did not acknowledge stream data within {:?}",
                self.linger
            ),
        }
        let _ = self.recv.stop(VarInt::from_u32(CLOSE_OK));
        self.connection.close(VarInt::from_u32(CLOSE_OK), b"connection closed");
        Ok(())
    }
}

/// Server-side QUIC endpoint handing out incoming connections
pub struct QuicAcceptor {
    endpoint: Endpoint,
    closed: bool,
}

impl QuicAcceptor {
    /// Bind a QUIC server endpoint
    pub fn bind(addr: SocketAddr, server_config: quinn::ServerConfig) -> io::Result<Self> {
        let endpoint = Endpoint::server(server_config, addr)?;
        Ok(Self {
            endpoint,
            closed: false,
        })
    }

    /// Handle used to wait for the endpoint to go idle at exit
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }
}

impl Acceptor for QuicAcceptor {
    type Item = Incoming;

    async fn accept_next(&mut self) -> Result<Incoming, AcceptError> {
        if self.closed {
            return Err(AcceptError::Closed);
        }
        self.endpoint.accept().await.ok_or(AcceptError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            // Refuse new handshakes but leave established connections running
            self.endpoint.set_server_config(None);
            self.closed = true;
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }
}

/// Opens one QUIC connection and stream per circuit
pub struct QuicDialer {
    v4: Endpoint,
    v6: Option<Endpoint>,
    client_config: quinn::ClientConfig,
    connect_timeout: Duration,
    linger: Duration,
}

impl QuicDialer {
    pub fn new(config: &Config) -> Result<Self> {
        let client_config = client_config(config)?;
        let v4 = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .context("Failed to bind IPv4 QUIC client endpoint")?;
        let v6 = match Endpoint::client(SocketAddr::from(([0u16; 8], 0))) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!("IPv6 QUIC client endpoint unavailable: {}", e);
                None
            }
        };
        Ok(Self {
            v4,
            v6,
            client_config,
            connect_timeout: config.connect_timeout(),
            linger: config.close_linger(),
        })
    }

    /// Client endpoints, for waiting until they go idle at exit
    pub fn endpoints(&self) -> Vec<Endpoint> {
        std::iter::once(self.v4.clone()).chain(self.v6.clone()).collect()
    }

    async fn connect(&self, target: &str) -> Result<QuicStream, OpenError> {
        let addr = tokio::net::lookup_host(target)
            .await
            .map_err(|e| OpenError::Unreachable(format!("{}: {}", target, e)))?
            .next()
            .ok_or_else(|| OpenError::Unreachable(format!("{}: no addresses", target)))?;

        let endpoint = if addr.is_ipv4() {
            &self.v4
        } else {
            self.v6
                .as_ref()
                .ok_or_else(|| OpenError::Unreachable(format!("{}: IPv6 unavailable", target)))?
        };

        let server_name = server_name(target);
        let connecting = endpoint
            .connect_with(self.client_config.clone(), addr, server_name)
            .map_err(|e| OpenError::Unreachable(format!("{}: {}", target, e)))?;
        let connection = connecting
            .await
            .map_err(|e| OpenError::Unreachable(format!("{}: {}", target, e)))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| OpenError::Unreachable(format!("{}: {}", target, e)))?;

        info!(peer = %addr, "QUIC stream opened");
        Ok(QuicStream::new(connection, send, recv, self.linger))
    }
}

impl Dialer for QuicDialer {
    type Conn = QuicStream;

    async fn open_to(&self, target: &str) -> Result<QuicStream, OpenError> {
        tokio::time::timeout(self.connect_timeout, self.connect(target))
            .await
            .map_err(|_| OpenError::Timeout)?
    }
}

/// TLS server name for a `host:port` target
fn server_name(target: &str) -> &str {
    let host = target.rsplit_once(':').map(|(host, _)| host).unwrap_or(target);
    host.trim_start_matches('[').trim_end_matches(']')
}
