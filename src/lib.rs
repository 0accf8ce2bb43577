//! netshaper pluggable transport library
//!
//! Relays Tor traffic between a QUIC-based transport and the plaintext
//! endpoints Tor expects: the ORPort on the bridge side and a local SOCKS5
//! listener on the client side.

pub mod accept;
pub mod client;
pub mod config;
pub mod constants;
pub mod logging;
pub mod registration;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod transport;
