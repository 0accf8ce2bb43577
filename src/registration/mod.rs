//! Registration with the parent Tor process
//!
//! Tor launches netshaper as a managed pluggable transport: configuration
//! arrives through `TOR_PT_*` environment variables and readiness is
//! reported back as lines on stdout. The accept machinery only sees the
//! [`ServerRegistrar`] and [`ClientRegistrar`] traits; [`PtAnnouncer`] is the
//! stdout implementation.

pub mod announce;
pub mod env;

pub use announce::PtAnnouncer;
pub use env::{ClientInfo, PtEnvError, ServerBindaddr, ServerInfo};

use std::io;
use std::net::SocketAddr;

/// Readiness reporting for the server role
pub trait ServerRegistrar: Send + Sync {
    /// The method is listening on `addr`
    fn announce_ready(&self, method: &str, addr: SocketAddr) -> io::Result<()>;

    /// The method could not be started
    fn announce_failed(&self, method: &str, reason: &str) -> io::Result<()>;

    /// Every configured method has been announced
    fn announce_all_done(&self) -> io::Result<()>;
}

/// Readiness reporting for the client role
pub trait ClientRegistrar: Send + Sync {
    /// The method accepts `proxy_kind` requests on `addr`
    fn announce_client_ready(&self, method: &str, proxy_kind: &str, addr: SocketAddr) -> io::Result<()>;

    fn announce_client_failed(&self, method: &str, reason: &str) -> io::Result<()>;

    fn announce_all_client_done(&self) -> io::Result<()>;
}
