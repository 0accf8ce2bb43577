//! Transport layer for netshaper
//!
//! Both roles see their two sides through the same two capabilities: an
//! [`Acceptor`] that yields inbound connections and a [`Dialer`] that opens
//! outbound ones. Whatever either produces is a [`Connection`] the relay
//! can split, half-close and close.

pub mod quic;
pub mod socks5;
pub mod tcp;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Failure to accept the next inbound connection
#[derive(Error, Debug)]
pub enum AcceptError {
    /// The endpoint is closed; the accept loop must stop.
    #[error("endpoint closed")]
    Closed,
    /// One incoming attempt failed; the accept loop keeps going.
    #[error("transient accept failure: {0}")]
    Transient(#[source] io::Error),
}

/// Failure to open an outbound connection
#[derive(Error, Debug)]
pub enum OpenError {
    /// The target could not be reached or refused the connection.
    #[error("target unreachable: {0}")]
    Unreachable(String),
    /// The target did not answer within the connect timeout.
    #[error("connection attempt timed out")]
    Timeout,
}

/// A bound endpoint handing out inbound connections one at a time
pub trait Acceptor: Send + 'static {
    /// What one successful accept produces
    type Item: Send + 'static;

    /// Wait for the next inbound connection.
    ///
    /// Must be cancel-safe: the accept loop races it against the drain signal.
    fn accept_next(&mut self) -> impl Future<Output = Result<Self::Item, AcceptError>> + Send;

    /// Close the endpoint. Every later `accept_next` returns [`AcceptError::Closed`];
    /// connections already handed out stay untouched.
    fn close(&mut self);

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Opens outbound connections to a named target
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    fn open_to(&self, target: &str) -> impl Future<Output = Result<Self::Conn, OpenError>> + Send;
}

/// An owned, live byte stream that the relay can drive in both directions.
///
/// `split` hands each direction an exclusively owned half, so no lock is
/// needed while relaying. Half-close is `AsyncWrite::shutdown` on the write
/// half; `close` is the full close and must be safe to call repeatedly.
pub trait Connection: Send + Sized + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);

    fn reunite(reader: Self::Reader, writer: Self::Writer) -> io::Result<Self>;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Errors that only mean the other side already went away
fn already_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

impl Connection for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.into_split()
    }

    fn reunite(reader: Self::Reader, writer: Self::Writer) -> io::Result<Self> {
        reader
            .reunite(writer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    async fn close(&mut self) -> io::Result<()> {
        // The socket itself is released on drop; shutting down the write side
        // again is harmless and flushes a FIN if the relay never sent one.
        match AsyncWriteExt::shutdown(self).await {
            Ok(()) => Ok(()),
            Err(e) if already_closed(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Connection for DuplexStream {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self)
    }

    fn reunite(reader: Self::Reader, writer: Self::Writer) -> io::Result<Self> {
        if !reader.is_pair_of(&writer) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "halves belong to different streams",
            ));
        }
        Ok(reader.unsplit(writer))
    }

    async fn close(&mut self) -> io::Result<()> {
        match AsyncWriteExt::shutdown(self).await {
            Ok(()) => Ok(()),
            Err(e) if already_closed(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
