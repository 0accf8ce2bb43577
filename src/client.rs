//! Client role
//!
//! Exposes one local SOCKS5 listener per requested method. Tor connects to
//! it with the bridge address as the CONNECT target; every request becomes
//! one QUIC connection to that bridge.

use crate::accept::{run_accept_loop, ListenEndpoint};
use crate::config::Config;
use crate::constants::CLIENT_PROXY_KIND;
use crate::registration::env::{client_setup, process_env};
use crate::registration::{ClientRegistrar, PtAnnouncer};
use crate::relay::{bridge_with_buffer, Sides};
use crate::shutdown::{self, ShutdownCause, ShutdownSet, StdinWatch};
use crate::transport::quic::QuicDialer;
use crate::transport::socks5::{handshake, SocksListener};
use crate::transport::{Acceptor, Connection, Dialer};
use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// SOCKS listeners only ever face the local Tor process
const SOCKS_BIND_ADDR: &str = "127.0.0.1:0";

struct CircuitContext {
    dialer: Arc<QuicDialer>,
    handshake_timeout: Duration,
    buffer_size: usize,
}

/// netshaper client instance
pub struct Client {
    config: Config,
    dialer: Arc<QuicDialer>,
    shutdown: ShutdownSet,
}

impl Client {
    /// Create a client; binds the QUIC client endpoints, so it needs a runtime
    pub fn new(config: Config) -> Result<Self> {
        let dialer = Arc::new(QuicDialer::new(&config)?);
        Ok(Self {
            config,
            dialer,
            shutdown: ShutdownSet::new(),
        })
    }

    /// Handle on the set tracking this client's listeners and bridges
    pub fn shutdown(&self) -> ShutdownSet {
        self.shutdown.clone()
    }

    /// Start one SOCKS listener per method, announcing each exactly once,
    /// then announce that all methods are done.
    pub async fn bind_all<R>(&self, methods: &[String], registrar: &R) -> Result<Vec<ListenEndpoint>>
    where
        R: ClientRegistrar,
    {
        let context = Arc::new(CircuitContext {
            dialer: self.dialer.clone(),
            handshake_timeout: self.config.connect_timeout(),
            buffer_size: self.config.relay.buffer_size,
        });

        let mut listening = Vec::new();
        for method in methods {
            if !self.config.serves_method(method) {
                warn!("Skipping unsupported transport method {}", method);
                registrar.announce_client_failed(method, "no such method")?;
                continue;
            }

            let listener = match SocksListener::bind(SOCKS_BIND_ADDR).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to start SOCKS listener for {}: {}", method, e);
                    registrar.announce_client_failed(method, &format!("failed to listen: {}", e))?;
                    continue;
                }
            };
            let address = match listener.local_addr() {
                Ok(address) => address,
                Err(e) => {
                    registrar.announce_client_failed(method, &format!("no local address: {}", e))?;
                    continue;
                }
            };
            let guard = self.shutdown.register_listener();
            registrar.announce_client_ready(method, CLIENT_PROXY_KIND, address)?;

            let endpoint = ListenEndpoint {
                method: method.clone(),
                address,
            };
            let handler = {
                let context = context.clone();
                let shutdown = self.shutdown.clone();
                move |(socket, peer): (TcpStream, SocketAddr)| {
                    let span = info_span!("circuit", id = shutdown.next_circuit_id(), peer = %peer);
                    serve_circuit(socket, context.clone()).instrument(span)
                }
            };
            tokio::spawn(run_accept_loop(
                listener,
                endpoint.clone(),
                self.shutdown.clone(),
                guard,
                handler,
            ));
            listening.push(endpoint);
        }

        registrar.announce_all_client_done()?;
        Ok(listening)
    }

    /// Give closing QUIC connections a bounded chance to reach the bridges
    pub async fn wait_idle(&self) {
        let linger = self.config.close_linger();
        for endpoint in self.dialer.endpoints() {
            if tokio::time::timeout(linger, endpoint.wait_idle()).await.is_err() {
                debug!("QUIC endpoint still busy after {:?}", linger);
            }
        }
    }
}

async fn serve_circuit(socket: TcpStream, context: Arc<CircuitContext>) {
    let request = match tokio::time::timeout(context.handshake_timeout, handshake(socket)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            warn!("SOCKS handshake failed: {}", e);
            return;
        }
        Err(_) => {
            warn!("SOCKS handshake timed out after {:?}", context.handshake_timeout);
            return;
        }
    };
    if let Some(args) = request.args() {
        debug!("Ignoring transport arguments {:?}", args);
    }
    debug!(bridge = %request.target(), "Dialing bridge");

    let mut stream = match context.dialer.open_to(request.target()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to reach bridge {}: {}", request.target(), e);
            if let Err(reply_err) = request.reject_for(&e).await {
                debug!("Failed to send SOCKS rejection: {}", reply_err);
            }
            return;
        }
    };

    let socket = match request.grant().await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to grant SOCKS request: {}", e);
            if let Err(e) = stream.close().await {
                debug!("Failed to close QUIC stream: {}", e);
            }
            return;
        }
    };

    let sides = Sides {
        a: "socks",
        b: "bridge",
    };
    let report = bridge_with_buffer(socket, stream, sides, context.buffer_size).await;
    if report.failed() {
        warn!("Circuit ended with errors: {}", report);
    } else {
        info!("Circuit closed: {}", report);
    }
}

/// Run the client role under Tor until shut down
pub async fn run(config: Config) -> Result<()> {
    let announcer = PtAnnouncer::stdout();
    let info = client_setup(&announcer, process_env)?;
    let methods = info.requested_methods(&config.transport_methods);

    let client = Client::new(config)?;
    let stdin = info.exit_on_stdin_close.then(StdinWatch::spawn);

    let endpoints = client.bind_all(&methods, &announcer).await?;
    if endpoints.is_empty() {
        return Err(anyhow!("No transport method could be started"));
    }

    let cause = shutdown::wait_for_signal(stdin.as_ref()).await?;
    info!(?cause, "Shutdown signal received, stopping client");

    let stdin = if cause == ShutdownCause::StdinClosed { None } else { stdin.as_ref() };
    shutdown::drain(&client.shutdown(), stdin).await;
    client.wait_idle().await;
    info!("Client stopped");
    Ok(())
}
