//! Configuration records consumed by the server and client cores.
//!
//! The cores only ever see these structs; parsing the string forms (CLI
//! flags and environment variables) happens here, next to the types.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};

use crate::protocol::{TunnelSpec, CONNECTION_TIMEOUT, CONTROL_PORT};

/// One entry of the public-port allowlist: a single port or an inclusive
/// range, written as `"3000"` or `"4000-4999"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRule {
    /// Exactly one port.
    Single(u16),
    /// An inclusive `min-max` range.
    Range(u16, u16),
}

impl PortRule {
    /// Whether the rule admits `port`.
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortRule::Single(p) => p == port,
            PortRule::Range(min, max) => (min..=max).contains(&port),
        }
    }
}

impl FromStr for PortRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('-') {
            Some((min, max)) => {
                let min: u16 = min.trim().parse().context("invalid range start")?;
                let max: u16 = max.trim().parse().context("invalid range end")?;
                ensure!(min > 0, "port 0 is not allowed in a port rule");
                ensure!(min <= max, "port range {min}-{max} is empty");
                Ok(PortRule::Range(min, max))
            }
            None => {
                let port: u16 = s.trim().parse().context("invalid port number")?;
                ensure!(port > 0, "port 0 is not allowed in a port rule");
                Ok(PortRule::Single(port))
            }
        }
    }
}

/// Parse a comma-separated allowlist such as `"3000,4000-4999"`.
///
/// An empty string means no restriction (all ports allowed).
pub fn parse_port_rules(s: &str) -> Result<Vec<PortRule>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().with_context(|| format!("bad port rule {part:?}")))
        .collect()
}

impl FromStr for TunnelSpec {
    type Err = anyhow::Error;

    /// Parse the `"<remotePort>:<localPort>:<name>"` form.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (remote, local, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(r), Some(l), Some(n)) => (r, l, n),
            _ => bail!("expected <remotePort>:<localPort>:<name>, got {s:?}"),
        };
        let remote_port: u16 = remote.trim().parse().context("invalid remote port")?;
        let local_port: u16 = local.trim().parse().context("invalid local port")?;
        ensure!(remote_port > 0, "remote port must be nonzero");
        ensure!(local_port > 0, "local port must be nonzero");
        let name = name.trim();
        ensure!(!name.is_empty(), "tunnel name must not be empty");
        Ok(TunnelSpec {
            remote_port,
            local_port,
            name: name.to_string(),
            protocol: "tcp".to_string(),
        })
    }
}

/// Parse a comma-separated tunnel list such as `"3000:9000:web,2222:22:ssh"`.
///
/// Remote ports must be unique: the remote port is the tunnel's identity.
pub fn parse_tunnel_specs(s: &str) -> Result<Vec<TunnelSpec>> {
    let mut specs: Vec<TunnelSpec> = Vec::new();
    for part in s.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let spec: TunnelSpec = part
            .parse()
            .with_context(|| format!("bad tunnel spec {part:?}"))?;
        if specs.iter().any(|t| t.remote_port == spec.remote_port) {
            bail!("duplicate remote port {} in tunnel list", spec.remote_port);
        }
        specs.push(spec);
    }
    ensure!(!specs.is_empty(), "at least one tunnel must be configured");
    Ok(specs)
}

/// Configuration record for the server core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control listener and all public listeners bind to.
    pub host: String,
    /// Port of the control listener.
    pub control_port: u16,
    /// Shared-token allowlist; empty accepts every client (with a warning).
    pub auth_tokens: Vec<String>,
    /// Public ports clients may register; empty allows all.
    pub allowed_ports: Vec<PortRule>,
    /// Deadline for one rendezvous, from external accept to splice.
    pub connection_timeout: Duration,
    /// How often the server pings each authenticated session.
    pub ping_interval: Duration,
    /// Silence threshold after which a session is considered dead.
    pub ping_timeout: Duration,
    /// Host the server dials to reach a client's data listener.
    pub client_data_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            control_port: CONTROL_PORT,
            auth_tokens: Vec::new(),
            allowed_ports: Vec::new(),
            connection_timeout: CONNECTION_TIMEOUT,
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
            client_data_host: "localhost".to_string(),
        }
    }
}

impl ServerConfig {
    /// Whether the allowlist admits `port`.
    pub fn port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.iter().any(|r| r.contains(port))
    }
}

/// Configuration record for the client core.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host of the public server.
    pub server_host: String,
    /// Control port of the public server.
    pub server_port: u16,
    /// Shared token presented during auth; `None` sends an empty token.
    pub auth_token: Option<String>,
    /// Tunnels registered after every (re)connect.
    pub tunnels: Vec<TunnelSpec>,
    /// How many consecutive failed sessions to tolerate before giving up.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles per failure, capped.
    pub reconnect_delay: Duration,
}
