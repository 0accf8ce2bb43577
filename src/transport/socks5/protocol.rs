//! SOCKS5 protocol constants (RFC 1928, RFC 1929)

pub const SOCKS_VERSION: u8 = 0x05;

pub mod commands {
    pub const CONNECT: u8 = 0x01;
}

pub mod atyp {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

pub mod reply {
    pub const SUCCESS: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

pub mod auth {
    pub const NO_AUTH: u8 = 0x00;
    pub const USERNAME_PASSWORD: u8 = 0x02;
    pub const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

    /// Sub-negotiation version for username/password (RFC 1929)
    pub const USERPASS_VERSION: u8 = 0x01;
    pub const USERPASS_SUCCESS: u8 = 0x00;
}
