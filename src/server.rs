//! Server role
//!
//! Accepts QUIC connections from netshaper clients on every requested
//! method and relays each one to Tor's ORPort.

use crate::accept::{run_accept_loop, ListenEndpoint};
use crate::config::Config;
use crate::constants::CLOSE_UPSTREAM_UNREACHABLE;
use crate::registration::env::{process_env, server_setup};
use crate::registration::{PtAnnouncer, ServerBindaddr, ServerRegistrar};
use crate::relay::{bridge_with_buffer, classify, Sides, Teardown};
use crate::shutdown::{self, ShutdownCause, ShutdownSet, StdinWatch};
use crate::transport::quic::{load_server_config, QuicAcceptor, QuicStream};
use crate::transport::tcp::TcpDialer;
use crate::transport::{Acceptor, Dialer};
use anyhow::{anyhow, Context, Result};
use quinn::{Endpoint, Incoming};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// State every circuit of this server shares
struct CircuitContext {
    dialer: TcpDialer,
    orport: String,
    linger: Duration,
    buffer_size: usize,
}

/// netshaper server instance
pub struct Server {
    config: Config,
    server_config: quinn::ServerConfig,
    shutdown: ShutdownSet,
    endpoints: Vec<Endpoint>,
}

impl Server {
    /// Create a server, loading `cert.pem` and `key.pem` from `cert_dir`
    /// (or `tls.cert_dir` when not given)
    pub fn new(config: Config, cert_dir: Option<&Path>) -> Result<Self> {
        let (cert_path, key_path) = match cert_dir {
            Some(dir) => Config::cert_files_in(dir),
            None => config.cert_files(),
        };
        let server_config = load_server_config(&cert_path, &key_path, &config)
            .context("Failed to load server certificate")?;
        info!("Loaded server certificate from {}", cert_path.display());
        Ok(Self::with_server_config(config, server_config))
    }

    /// Create a server around an already built QUIC server config
    pub fn with_server_config(config: Config, server_config: quinn::ServerConfig) -> Self {
        Self {
            config,
            server_config,
            shutdown: ShutdownSet::new(),
            endpoints: Vec::new(),
        }
    }

    /// Handle on the set tracking this server's listeners and bridges
    pub fn shutdown(&self) -> ShutdownSet {
        self.shutdown.clone()
    }

    /// Bind every requested method and start its accept loop.
    ///
    /// Each method is announced exactly once as ready or failed, followed
    /// by the final done announcement. Returns the endpoints now listening.
    pub async fn bind_all<R>(
        &mut self,
        bindaddrs: &[ServerBindaddr],
        orport: SocketAddr,
        registrar: &R,
    ) -> Result<Vec<ListenEndpoint>>
    where
        R: ServerRegistrar,
    {
        let context = Arc::new(CircuitContext {
            dialer: TcpDialer::new(self.config.connect_timeout()),
            orport: orport.to_string(),
            linger: self.config.close_linger(),
            buffer_size: self.config.relay.buffer_size,
        });

        let mut listening = Vec::new();
        for bindaddr in bindaddrs {
            if !self.config.serves_method(&bindaddr.method) {
                warn!("Skipping unsupported transport method {}", bindaddr.method);
                registrar.announce_failed(&bindaddr.method, "no such method")?;
                continue;
            }

            let acceptor = match QuicAcceptor::bind(bindaddr.addr, self.server_config.clone()) {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    error!("Failed to listen on {} for {}: {}", bindaddr.addr, bindaddr.method, e);
                    registrar.announce_failed(&bindaddr.method, &format!("failed to listen on QUIC: {}", e))?;
                    continue;
                }
            };
            let address = match acceptor.local_addr() {
                Ok(address) => address,
                Err(e) => {
                    registrar.announce_failed(&bindaddr.method, &format!("no local address: {}", e))?;
                    continue;
                }
            };
            let listener = self.shutdown.register_listener();

            registrar.announce_ready(&bindaddr.method, address)?;
            let endpoint = ListenEndpoint {
                method: bindaddr.method.clone(),
                address,
            };
            self.endpoints.push(acceptor.endpoint());

            let handler = {
                let context = context.clone();
                let shutdown = self.shutdown.clone();
                move |incoming: Incoming| {
                    let span = info_span!(
                        "circuit",
                        id = shutdown.next_circuit_id(),
                        peer = %incoming.remote_address()
                    );
                    serve_circuit(incoming, context.clone()).instrument(span)
                }
            };
            tokio::spawn(run_accept_loop(
                acceptor,
                endpoint.clone(),
                self.shutdown.clone(),
                listener,
                handler,
            ));
            listening.push(endpoint);
        }

        registrar.announce_all_done()?;
        Ok(listening)
    }

    /// Give closing QUIC connections a bounded chance to reach their peers
    pub async fn wait_idle(&self) {
        let linger = self.config.close_linger();
        for endpoint in &self.endpoints {
            if tokio::time::timeout(linger, endpoint.wait_idle()).await.is_err() {
                debug!("QUIC endpoint still busy after {:?}", linger);
            }
        }
    }
}

async fn serve_circuit(incoming: Incoming, context: Arc<CircuitContext>) {
    let stream = match QuicStream::accept(incoming, context.linger).await {
        Ok(stream) => stream,
        Err(e) => {
            match classify(&e) {
                Teardown::Expected => debug!("Client went away during handshake: {}", e),
                Teardown::Failure => warn!("QUIC handshake failed: {}", e),
            }
            return;
        }
    };
    debug!("Accepted QUIC stream");

    let upstream = match context.dialer.open_to(&context.orport).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!("Failed to connect to ORPort {}: {}", context.orport, e);
            stream.refuse(CLOSE_UPSTREAM_UNREACHABLE, "upstream unreachable");
            return;
        }
    };

    let sides = Sides {
        a: "client",
        b: "orport",
    };
    let report = bridge_with_buffer(stream, upstream, sides, context.buffer_size).await;
    if report.failed() {
        warn!("Circuit ended with errors: {}", report);
    } else {
        info!("Circuit closed: {}", report);
    }
}

async fn resolve_orport(orport: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(orport)
        .await
        .with_context(|| format!("Failed to resolve ORPort {}", orport))?
        .next()
        .ok_or_else(|| anyhow!("ORPort {} resolved to no addresses", orport))
}

/// Run the server role under Tor until shut down
pub async fn run(config: Config, cert_dir: Option<&Path>) -> Result<()> {
    let announcer = PtAnnouncer::stdout();
    let info = server_setup(&announcer, process_env)?;

    let orport = match resolve_orport(&info.orport).await {
        Ok(orport) => orport,
        Err(e) => {
            announcer.env_error(&format!("{:#}", e))?;
            return Err(e);
        }
    };
    info!("Relaying circuits to ORPort {}", orport);

    let mut server = Server::new(config, cert_dir)?;
    let stdin = info.exit_on_stdin_close.then(StdinWatch::spawn);

    let endpoints = server.bind_all(&info.bindaddrs, orport, &announcer).await?;
    if endpoints.is_empty() {
        return Err(anyhow!("No transport method could be started"));
    }

    let cause = shutdown::wait_for_signal(stdin.as_ref()).await?;
    info!(?cause, "Shutdown signal received, stopping server");

    let stdin = if cause == ShutdownCause::StdinClosed { None } else { stdin.as_ref() };
    shutdown::drain(&server.shutdown(), stdin).await;
    server.wait_idle().await;
    info!("Server stopped");
    Ok(())
}
