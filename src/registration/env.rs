//! `TOR_PT_*` environment parsing
//!
//! Parsers take a getter instead of reading the process environment
//! directly so they can be exercised without touching global state.

use super::announce::PtAnnouncer;
use crate::constants::MANAGED_TRANSPORT_VERSION;
use anyhow::Result;
use std::io::Write;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

pub const MANAGED_TRANSPORT_VER: &str = "TOR_PT_MANAGED_TRANSPORT_VER";
pub const SERVER_TRANSPORTS: &str = "TOR_PT_SERVER_TRANSPORTS";
pub const SERVER_BINDADDR: &str = "TOR_PT_SERVER_BINDADDR";
pub const ORPORT: &str = "TOR_PT_ORPORT";
pub const CLIENT_TRANSPORTS: &str = "TOR_PT_CLIENT_TRANSPORTS";
pub const PROXY: &str = "TOR_PT_PROXY";
pub const EXIT_ON_STDIN_CLOSE: &str = "TOR_PT_EXIT_ON_STDIN_CLOSE";

/// Fatal problems with the environment Tor handed us
#[derive(Error, Debug)]
pub enum PtEnvError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("no supported managed transport version in {0:?}")]
    UnsupportedVersion(String),

    #[error("upstream proxy {0} is not supported")]
    ProxyUnsupported(String),
}

/// One `method-address` entry of `TOR_PT_SERVER_BINDADDR`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBindaddr {
    pub method: String,
    pub addr: SocketAddr,
}

/// Server role environment
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Requested methods with their bind address, in request order
    pub bindaddrs: Vec<ServerBindaddr>,
    /// Where accepted circuits are relayed to, resolved by the server at startup
    pub orport: String,
    pub exit_on_stdin_close: bool,
}

/// Client role environment
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Requested methods; `*` stands for every supported one
    pub methods: Vec<String>,
    pub exit_on_stdin_close: bool,
}

fn required<F>(get: &F, name: &'static str) -> Result<String, PtEnvError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(PtEnvError::Missing(name)),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn exit_on_stdin_close<F>(get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    get(EXIT_ON_STDIN_CLOSE).as_deref() == Some("1")
}

/// Check that Tor offers a protocol version we speak
pub fn check_version<F>(get: &F) -> Result<(), PtEnvError>
where
    F: Fn(&str) -> Option<String>,
{
    let offered = required(get, MANAGED_TRANSPORT_VER)?;
    if split_list(&offered)
        .iter()
        .any(|v| v == MANAGED_TRANSPORT_VERSION)
    {
        Ok(())
    } else {
        Err(PtEnvError::UnsupportedVersion(offered))
    }
}

fn parse_bindaddrs(value: &str) -> Result<Vec<ServerBindaddr>, PtEnvError> {
    split_list(value)
        .into_iter()
        .map(|entry| {
            let (method, addr) = entry.split_once('-').ok_or_else(|| PtEnvError::Invalid {
                name: SERVER_BINDADDR,
                reason: format!("entry {:?} is not method-address", entry),
            })?;
            let addr = addr.parse().map_err(|e| PtEnvError::Invalid {
                name: SERVER_BINDADDR,
                reason: format!("bad address {:?}: {}", addr, e),
            })?;
            Ok(ServerBindaddr {
                method: method.to_string(),
                addr,
            })
        })
        .collect()
}

impl ServerInfo {
    pub fn from_env_with<F>(get: F) -> Result<Self, PtEnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let methods = split_list(&required(&get, SERVER_TRANSPORTS)?);
        let orport = required(&get, ORPORT)?;

        let listed = match get(SERVER_BINDADDR) {
            Some(value) if !value.is_empty() => parse_bindaddrs(&value)?,
            _ => Vec::new(),
        };

        let default_addr = SocketAddr::from(([0, 0, 0, 0], 0));

        // Only requested methods get an endpoint; unlisted ones bind the default
        let bindaddrs = methods
            .into_iter()
            .map(|method| {
                let addr = listed
                    .iter()
                    .find(|b| b.method == method)
                    .map(|b| b.addr)
                    .unwrap_or(default_addr);
                ServerBindaddr { method, addr }
            })
            .collect();

        Ok(Self {
            bindaddrs,
            orport,
            exit_on_stdin_close: exit_on_stdin_close(&get),
        })
    }
}

impl ClientInfo {
    pub fn from_env_with<F>(get: F) -> Result<Self, PtEnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let methods = split_list(&required(&get, CLIENT_TRANSPORTS)?);
        if let Some(proxy) = get(PROXY).filter(|p| !p.is_empty()) {
            return Err(PtEnvError::ProxyUnsupported(proxy));
        }
        Ok(Self {
            methods,
            exit_on_stdin_close: exit_on_stdin_close(&get),
        })
    }

    /// Requested methods in request order, with `*` expanded to `supported`
    pub fn requested_methods(&self, supported: &[String]) -> Vec<String> {
        if self.methods.iter().any(|m| m == "*") {
            return supported.to_vec();
        }
        self.methods.clone()
    }
}

fn negotiate<W, F, T>(
    announcer: &PtAnnouncer<W>,
    get: F,
    parse: impl FnOnce(F) -> Result<T, PtEnvError>,
) -> Result<T>
where
    W: Write + Send,
    F: Fn(&str) -> Option<String>,
{
    if let Err(e) = check_version(&get) {
        announcer.env_failure(&e)?;
        return Err(e.into());
    }
    announcer.version()?;

    match parse(get) {
        Ok(info) => Ok(info),
        Err(e) => {
            announcer.env_failure(&e)?;
            Err(e.into())
        }
    }
}

/// Version negotiation and environment parsing for the server role.
///
/// Fatal problems are announced on `announcer` before being returned.
pub fn server_setup<W, F>(announcer: &PtAnnouncer<W>, get: F) -> Result<ServerInfo>
where
    W: Write + Send,
    F: Fn(&str) -> Option<String>,
{
    let info = negotiate(announcer, get, ServerInfo::from_env_with)?;
    info!(
        methods = info.bindaddrs.len(),
        orport = %info.orport,
        "Server environment loaded"
    );
    Ok(info)
}

/// Version negotiation and environment parsing for the client role
pub fn client_setup<W, F>(announcer: &PtAnnouncer<W>, get: F) -> Result<ClientInfo>
where
    W: Write + Send,
    F: Fn(&str) -> Option<String>,
{
    let info = negotiate(announcer, get, ClientInfo::from_env_with)?;
    info!(methods = ?info.methods, "Client environment loaded");
    Ok(info)
}

/// Getter over the real process environment
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
