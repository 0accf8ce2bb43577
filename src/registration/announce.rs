//! Managed transport protocol output
//!
//! Every message is one line, written and flushed immediately: Tor reads
//! the stream incrementally and waits for the `DONE` line before using any
//! announced method.

use super::env::PtEnvError;
use super::{ClientRegistrar, ServerRegistrar};
use crate::constants::MANAGED_TRANSPORT_VERSION;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Mutex;

/// Writes managed transport lines to `W` (stdout in production)
pub struct PtAnnouncer<W: Write + Send> {
    out: Mutex<W>,
}

impl PtAnnouncer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> PtAnnouncer<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn line(&self, args: fmt::Arguments<'_>) -> io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "announcer lock poisoned"))?;
        out.write_fmt(args)?;
        out.write_all(b"\n")?;
        out.flush()
    }

    pub fn version(&self) -> io::Result<()> {
        self.line(format_args!("VERSION {}", MANAGED_TRANSPORT_VERSION))
    }

    pub fn version_error(&self) -> io::Result<()> {
        self.line(format_args!("VERSION-ERROR no-version"))
    }

    pub fn env_error(&self, reason: &str) -> io::Result<()> {
        self.line(format_args!("ENV-ERROR {}", single_line(reason)))
    }

    pub fn proxy_error(&self, reason: &str) -> io::Result<()> {
        self.line(format_args!("PROXY-ERROR {}", single_line(reason)))
    }

    /// Report a fatal environment problem with the matching line
    pub fn env_failure(&self, err: &PtEnvError) -> io::Result<()> {
        match err {
            PtEnvError::UnsupportedVersion(_) => self.version_error(),
            PtEnvError::ProxyUnsupported(_) => self.proxy_error(&err.to_string()),
            _ => self.env_error(&err.to_string()),
        }
    }
}

/// Protocol lines end at the first newline, so reasons must not contain one
fn single_line(reason: &str) -> String {
    reason.replace(['\r', '\n'], " ")
}

impl<W: Write + Send> ServerRegistrar for PtAnnouncer<W> {
    fn announce_ready(&self, method: &str, addr: SocketAddr) -> io::Result<()> {
        self.line(format_args!("SMETHOD {} {}", method, addr))
    }

    fn announce_failed(&self, method: &str, reason: &str) -> io::Result<()> {
        self.line(format_args!("SMETHOD-ERROR {} {}", method, single_line(reason)))
    }

    fn announce_all_done(&self) -> io::Result<()> {
        self.line(format_args!("SMETHODS DONE"))
    }
}

impl<W: Write + Send> ClientRegistrar for PtAnnouncer<W> {
    fn announce_client_ready(&self, method: &str, proxy_kind: &str, addr: SocketAddr) -> io::Result<()> {
        self.line(format_args!("CMETHOD {} {} {}", method, proxy_kind, addr))
    }

    fn announce_client_failed(&self, method: &str, reason: &str) -> io::Result<()> {
        self.line(format_args!("CMETHOD-ERROR {} {}", method, single_line(reason)))
    }

    fn announce_all_client_done(&self) -> io::Result<()> {
        self.line(format_args!("CMETHODS DONE"))
    }
}
