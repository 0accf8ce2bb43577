//! Global constants for the netshaper transport

// ============================================================================
// TRANSPORT IDENTITY
// ============================================================================

/// Transport method name announced to Tor
pub const TRANSPORT_NAME: &str = "netshaper";

/// ALPN protocol negotiated on every QUIC connection
pub const ALPN_PROTOCOL: &str = "netshaper-pt";

/// Managed transport protocol version we speak
pub const MANAGED_TRANSPORT_VERSION: &str = "1";

/// Proxy kind advertised in CMETHOD lines
pub const CLIENT_PROXY_KIND: &str = "socks5";

// ============================================================================
// BUFFER SIZES
// ============================================================================

/// Default relay buffer size (8KB)
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum relay buffer size (64KB)
pub const MAX_BUFFER_SIZE: usize = 65536;

// ============================================================================
// QUIC APPLICATION CLOSE CODES
// ============================================================================

/// Normal end of a circuit
pub const CLOSE_OK: u32 = 0;

/// The plaintext side of the circuit could not be opened
pub const CLOSE_UPSTREAM_UNREACHABLE: u32 = 1;

// ============================================================================
// CERTIFICATE FILES
// ============================================================================

/// Certificate chain file name inside the certificate directory
pub const CERT_FILE_NAME: &str = "cert.pem";

/// Private key file name inside the certificate directory
pub const KEY_FILE_NAME: &str = "key.pem";

// ============================================================================
// END OF CONSTANTS
// ============================================================================
