//! Local SOCKS5 listener and request handling

use super::protocol::{atyp, auth, commands, reply, SOCKS_VERSION};
use crate::transport::{AcceptError, Acceptor, OpenError};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Maximum number of SOCKS5 authentication methods allowed
const MAX_SOCKS5_METHODS: usize = 10;

/// Errors from the SOCKS5 handshake
#[derive(Error, Debug)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),
    #[error("too many authentication methods: {0}")]
    TooManyMethods(usize),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unsupported username/password version: {0}")]
    UnsupportedAuthVersion(u8),
    #[error("unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("invalid domain name in request")]
    InvalidDomain,
}

/// Local TCP listener accepting SOCKS5 clients
pub struct SocksListener {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl SocksListener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            local_addr,
        })
    }
}

impl Acceptor for SocksListener {
    type Item = (TcpStream, SocketAddr);

    async fn accept_next(&mut self) -> Result<Self::Item, AcceptError> {
        let listener = self.listener.as_ref().ok_or(AcceptError::Closed)?;
        let (socket, peer_addr) = listener.accept().await.map_err(AcceptError::Transient)?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        Ok((socket, peer_addr))
    }

    fn close(&mut self) {
        self.listener = None;
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// A CONNECT request waiting for its outbound side.
///
/// Consume it with [`SocksRequest::grant`] or one of the reject methods;
/// the client gets exactly one reply either way.
#[derive(Debug)]
pub struct SocksRequest<S> {
    stream: S,
    target: String,
    args: Option<String>,
}

impl<S> SocksRequest<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `host:port` the client asked for
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Transport arguments passed through the username/password fields
    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }

    /// Tell the client the connection is up and hand back the stream
    pub async fn grant(mut self) -> io::Result<S> {
        send_socks5_reply(&mut self.stream, reply::SUCCESS).await?;
        Ok(self.stream)
    }

    /// Refuse the request with an explicit reply code
    pub async fn reject(mut self, rep: u8) -> io::Result<()> {
        send_socks5_reply(&mut self.stream, rep).await?;
        self.stream.shutdown().await
    }

    /// Refuse the request with the reply code matching an open failure
    pub async fn reject_for(self, err: &OpenError) -> io::Result<()> {
        self.reject(reply_code_for(err)).await
    }
}

/// SOCKS5 reply code reported for an outbound open failure
pub fn reply_code_for(err: &OpenError) -> u8 {
    match err {
        OpenError::Unreachable(_) => reply::HOST_UNREACHABLE,
        OpenError::Timeout => reply::TTL_EXPIRED,
    }
}

/// Run the server side of the SOCKS5 handshake up to the CONNECT request
pub async fn handshake<S>(mut socket: S) -> Result<SocksRequest<S>, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER NMETHODS METHODS
    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await?;
    let version = buf[0];
    let nmethods = buf[1] as usize;

    if version != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if nmethods > MAX_SOCKS5_METHODS {
        return Err(SocksError::TooManyMethods(nmethods));
    }

    let mut methods = vec![0u8; nmethods];
    socket.read_exact(&mut methods).await?;

    // Tor sends transport arguments as username/password, so prefer it
    let args = if methods.contains(&auth::USERNAME_PASSWORD) {
        socket.write_all(&[SOCKS_VERSION, auth::USERNAME_PASSWORD]).await?;
        Some(read_credentials(&mut socket).await?)
    } else if methods.contains(&auth::NO_AUTH) {
        socket.write_all(&[SOCKS_VERSION, auth::NO_AUTH]).await?;
        None
    } else {
        socket.write_all(&[SOCKS_VERSION, auth::NO_ACCEPTABLE_METHODS]).await?;
        return Err(SocksError::NoAcceptableMethod);
    };

    // VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await?;
    let ver = buf[0];
    let cmd = buf[1];
    let atyp = buf[3];

    if ver != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(ver));
    }
    if cmd != commands::CONNECT {
        send_socks5_reply(&mut socket, reply::COMMAND_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(cmd));
    }

    let target = match parse_socks5_address(&mut socket, atyp).await {
        Ok(target) => target,
        Err(SocksError::UnsupportedAddressType(t)) => {
            send_socks5_reply(&mut socket, reply::ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(SocksError::UnsupportedAddressType(t));
        }
        Err(e) => {
            send_socks5_reply(&mut socket, reply::GENERAL_FAILURE).await?;
            return Err(e);
        }
    };

    Ok(SocksRequest {
        stream: socket,
        target,
        args,
    })
}

/// RFC 1929 sub-negotiation; username and password are concatenated into
/// the transport argument string.
async fn read_credentials<S>(socket: &mut S) -> Result<String, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = socket.read_u8().await?;
    if ver != auth::USERPASS_VERSION {
        return Err(SocksError::UnsupportedAuthVersion(ver));
    }
    let ulen = socket.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    socket.read_exact(&mut uname).await?;
    let plen = socket.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    socket.read_exact(&mut passwd).await?;

    socket.write_all(&[auth::USERPASS_VERSION, auth::USERPASS_SUCCESS]).await?;

    // A lone NUL password is padding for arguments that fit in the username
    if passwd == [0] {
        passwd.clear();
    }
    uname.extend_from_slice(&passwd);
    Ok(String::from_utf8_lossy(&uname).into_owned())
}

/// Parse SOCKS5 address from the request into `host:port`
async fn parse_socks5_address<S>(socket: &mut S, atyp: u8) -> Result<String, SocksError>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        atyp::IPV4 => {
            let mut buf = [0u8; 6]; // 4 bytes IP + 2 bytes port
            socket.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(SocketAddr::from((ip, port)).to_string())
        }
        atyp::DOMAIN => {
            let len = socket.read_u8().await? as usize;
            let mut domain_buf = vec![0u8; len + 2]; // domain + port
            socket.read_exact(&mut domain_buf).await?;
            let domain = std::str::from_utf8(&domain_buf[..len]).map_err(|_| SocksError::InvalidDomain)?;
            if domain.is_empty() {
                return Err(SocksError::InvalidDomain);
            }
            let port = u16::from_be_bytes([domain_buf[len], domain_buf[len + 1]]);
            Ok(format!("{}:{}", domain, port))
        }
        atyp::IPV6 => {
            let mut buf = [0u8; 18]; // 16 bytes IP + 2 bytes port
            socket.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(SocketAddr::from((Ipv6Addr::from(octets), port)).to_string())
        }
        _ => Err(SocksError::UnsupportedAddressType(atyp)),
    }
}

/// Send SOCKS5 reply
async fn send_socks5_reply<S>(socket: &mut S, rep: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VER REP RSV ATYP BND.ADDR BND.PORT
    let reply = [SOCKS_VERSION, rep, 0x00, atyp::IPV4, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    socket.write_all(&reply).await?;
    socket.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_reply(client: &mut tokio::io::DuplexStream) -> [u8; 10] {
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_no_auth_connect_ipv4_granted() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));

        client.write_all(&[SOCKS_VERSION, 1, auth::NO_AUTH]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS_VERSION, auth::NO_AUTH]);

        client
            .write_all(&[SOCKS_VERSION, commands::CONNECT, 0, atyp::IPV4, 192, 0, 2, 7, 0x1f, 0x90])
            .await
            .unwrap();

        let request = handshake.await.unwrap().unwrap();
        assert_eq!(request.target(), "192.0.2.7:8080");
        assert_eq!(request.args(), None);

        let mut stream = request.grant().await.unwrap();
        assert_eq!(read_reply(&mut client).await[1], reply::SUCCESS);

        stream.write_all(b"payload").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn test_username_password_carries_args() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));

        client
            .write_all(&[SOCKS_VERSION, 2, auth::NO_AUTH, auth::USERNAME_PASSWORD])
            .await
            .unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method[1], auth::USERNAME_PASSWORD);

        let uname = b"cert=abc;iat-mode=0";
        let mut msg = vec![auth::USERPASS_VERSION, uname.len() as u8];
        msg.extend_from_slice(uname);
        msg.extend_from_slice(&[1, 0]);
        client.write_all(&msg).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [auth::USERPASS_VERSION, auth::USERPASS_SUCCESS]);

        let mut req = vec![SOCKS_VERSION, commands::CONNECT, 0, atyp::DOMAIN, 14];
        req.extend_from_slice(b"bridge.example");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = handshake.await.unwrap().unwrap();
        assert_eq!(request.target(), "bridge.example:443");
        assert_eq!(request.args(), Some("cert=abc;iat-mode=0"));
    }

    #[tokio::test]
    async fn test_ipv6_target_is_bracketed() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));

        client.write_all(&[SOCKS_VERSION, 1, auth::NO_AUTH]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let mut req = vec![SOCKS_VERSION, commands::CONNECT, 0, atyp::IPV6];
        req.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        req.extend_from_slice(&9001u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = handshake.await.unwrap().unwrap();
        assert_eq!(request.target(), "[2001:db8::1]:9001");
    }

    #[tokio::test]
    async fn test_reject_for_timeout_sends_ttl_expired() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));

        client.write_all(&[SOCKS_VERSION, 1, auth::NO_AUTH]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[SOCKS_VERSION, commands::CONNECT, 0, atyp::IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let request = handshake.await.unwrap().unwrap();
        request.reject_for(&OpenError::Timeout).await.unwrap();
        assert_eq!(read_reply(&mut client).await[1], reply::TTL_EXPIRED);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bind_command_is_refused() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));

        client.write_all(&[SOCKS_VERSION, 1, auth::NO_AUTH]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[SOCKS_VERSION, 0x02, 0, atyp::IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        assert_eq!(read_reply(&mut client).await[1], reply::COMMAND_NOT_SUPPORTED);
        assert!(matches!(
            handshake.await.unwrap(),
            Err(SocksError::UnsupportedCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));
        client.write_all(&[0x04, 1, 0]).await.unwrap();
        assert!(matches!(
            handshake.await.unwrap(),
            Err(SocksError::UnsupportedVersion(0x04))
        ));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(handshake(server));
        client.write_all(&[SOCKS_VERSION, 1, 0x01]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS_VERSION, auth::NO_ACCEPTABLE_METHODS]);
        assert!(matches!(handshake.await.unwrap(), Err(SocksError::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn test_listener_close_stops_accepting() {
        let mut listener = SocksListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);

        let _client = TcpStream::connect(addr).await.unwrap();
        assert!(listener.accept_next().await.is_ok());

        listener.close();
        assert!(matches!(listener.accept_next().await, Err(AcceptError::Closed)));
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
