//! Connection bridge
//!
//! [`bridge`] relays bytes between exactly two connections until both
//! directions have ended, then closes both. Each direction runs as its own
//! task with exclusive ownership of one read half and one write half:
//!
//! 1. copy until end-of-stream or error on the read side,
//! 2. half-close the destination's write side,
//! 3. once both directions are done, reunite and fully close both sides.
//!
//! Errors never leave this module; they are classified, logged and
//! summarised in the returned [`BridgeReport`].

mod classify;

pub use classify::{classify, Teardown};

use crate::constants::DEFAULT_BUFFER_SIZE;
use crate::transport::Connection;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tracing::{debug, error, Instrument};

/// Names of the two sides, used in log messages
#[derive(Debug, Clone, Copy)]
pub struct Sides {
    pub a: &'static str,
    pub b: &'static str,
}

/// How one relay direction ended
#[derive(Debug)]
pub enum DirectionEnd {
    /// The source reached end-of-stream
    Finished,
    /// The connection was already being torn down
    Teardown(io::ErrorKind),
    /// A real failure; already logged
    Failed(io::Error),
    /// The copy task died without reporting
    Aborted,
}

/// Summary of one relay direction
#[derive(Debug)]
pub struct DirectionReport {
    pub bytes: u64,
    pub end: DirectionEnd,
}

impl DirectionReport {
    pub fn failed(&self) -> bool {
        matches!(self.end, DirectionEnd::Failed(_) | DirectionEnd::Aborted)
    }
}

/// Summary of a finished bridge
#[derive(Debug)]
pub struct BridgeReport {
    pub a_to_b: DirectionReport,
    pub b_to_a: DirectionReport,
    /// Number of full-close errors classified as failures
    pub close_failures: usize,
}

impl BridgeReport {
    /// Whether anything in this bridge was reported as a failure
    pub fn failed(&self) -> bool {
        self.a_to_b.failed() || self.b_to_a.failed() || self.close_failures > 0
    }
}

impl fmt::Display for BridgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes forward, {} bytes back", self.a_to_b.bytes, self.b_to_a.bytes)
    }
}

/// Relay between `a` and `b` with the default buffer size
pub async fn bridge<A, B>(a: A, b: B, sides: Sides) -> BridgeReport
where
    A: Connection,
    B: Connection,
{
    bridge_with_buffer(a, b, sides, DEFAULT_BUFFER_SIZE).await
}

/// Relay between `a` and `b`, returning only after both directions ended
/// and both connections were closed.
pub async fn bridge_with_buffer<A, B>(a: A, b: B, sides: Sides, buffer_size: usize) -> BridgeReport
where
    A: Connection,
    B: Connection,
{
    let (a_read, a_write) = A::split(a);
    let (b_read, b_write) = B::split(b);

    let forward = tokio::spawn(
        pump(a_read, b_write, sides.a, sides.b, buffer_size).in_current_span(),
    );
    let backward = tokio::spawn(
        pump(b_read, a_write, sides.b, sides.a, buffer_size).in_current_span(),
    );
    let (forward, backward) = tokio::join!(forward, backward);

    let mut close_failures = 0;
    let (a_to_b, a_read, b_write) = unpack(forward, sides.a, sides.b);
    let (b_to_a, b_read, a_write) = unpack(backward, sides.b, sides.a);

    if let (Some(reader), Some(writer)) = (a_read, a_write) {
        close_failures += close_side::<A>(reader, writer, sides.a).await;
    }
    if let (Some(reader), Some(writer)) = (b_read, b_write) {
        close_failures += close_side::<B>(reader, writer, sides.b).await;
    }

    BridgeReport {
        a_to_b,
        b_to_a,
        close_failures,
    }
}

type PumpOutput<R, W> = (R, W, DirectionReport);

fn unpack<R, W>(
    joined: Result<PumpOutput<R, W>, JoinError>,
    from: &str,
    to: &str,
) -> (DirectionReport, Option<R>, Option<W>) {
    match joined {
        Ok((reader, writer, report)) => (report, Some(reader), Some(writer)),
        Err(e) => {
            // Halves owned by the dead task were dropped with it, which
            // already closed them.
            error!("Bridge failure: {} -> {} relay task died: {}", from, to, e);
            (
                DirectionReport {
                    bytes: 0,
                    end: DirectionEnd::Aborted,
                },
                None,
                None,
            )
        }
    }
}

/// Copy one direction, then half-close the destination
async fn pump<R, W>(mut reader: R, mut writer: W, from: &'static str, to: &'static str, buffer_size: usize) -> PumpOutput<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let result: io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            bytes += n as u64;
        }
    }
    .await;

    let end = match result {
        Ok(()) => {
            debug!("{} -> {} reached end of stream after {} bytes", from, to, bytes);
            DirectionEnd::Finished
        }
        Err(e) => match classify(&e) {
            Teardown::Expected => {
                debug!("{} -> {} ended by teardown after {} bytes: {}", from, to, bytes, e);
                DirectionEnd::Teardown(e.kind())
            }
            Teardown::Failure => {
                error!("Bridge failure copying {} -> {} after {} bytes: {}", from, to, bytes, e);
                DirectionEnd::Failed(e)
            }
        },
    };

    // Half-close: the opposite direction keeps running until its own EOF
    if let Err(e) = writer.shutdown().await {
        match classify(&e) {
            Teardown::Expected => debug!("Half-close of {} skipped, already closed: {}", to, e),
            Teardown::Failure => error!("Bridge failure half-closing {}: {}", to, e),
        }
    }

    (reader, writer, DirectionReport { bytes, end })
}

/// Reunite one side and fully close it; returns the number of failures
async fn close_side<C: Connection>(reader: C::Reader, writer: C::Writer, name: &str) -> usize {
    let mut conn = match C::reunite(reader, writer) {
        Ok(conn) => conn,
        Err(e) => {
            // Dropping the halves closes the connection anyway
            error!("Bridge failure reuniting {}: {}", name, e);
            return 1;
        }
    };
    match conn.close().await {
        Ok(()) => 0,
        Err(e) => match classify(&e) {
            Teardown::Expected => {
                debug!("{} already closed: {}", name, e);
                0
            }
            Teardown::Failure => {
                error!("Bridge failure closing {}: {}", name, e);
                1
            }
        },
    }
}
