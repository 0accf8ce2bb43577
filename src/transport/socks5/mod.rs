//! SOCKS5 endpoint for the client role
//!
//! Tor hands each circuit to the client role as a SOCKS5 CONNECT request
//! whose target is the bridge address. The request stays pending until the
//! obfuscated side is open, then it is granted or rejected.

pub mod protocol;
pub mod server;
pub use protocol::*;
pub use server::{handshake, SocksError, SocksListener, SocksRequest};
