//! Wire protocol spoken over the control channel.
//!
//! Messages are JSON objects carried in length-delimited frames (a `u32`
//! big-endian length prefix followed by the UTF-8 body). Every message has a
//! snake_case `type` discriminator; payload keys are camelCase. Unknown
//! fields are ignored for forward compatibility, unknown `type` values are
//! rejected at decode time.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

/// TCP port used for the control channel unless configured otherwise.
pub const CONTROL_PORT: u16 = 7835;

/// Maximum byte length of a single control frame.
pub const MAX_FRAME_LENGTH: usize = 8192;

/// Timeout for network connections and initial protocol messages.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long one rendezvous may take, from external accept to splice.
///
/// The server arms this deadline on every pending connection; the client
/// uses the same value for the one-shot data accept so both sides give up
/// together.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// One tunnel requested by a client: expose `remote_port` on the server and
/// forward its traffic to `local_port` next to the client.
///
/// `remote_port` is the tunnel's identity within a client; `name` is
/// advisory and only shows up in logs and status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// Public port bound on the server.
    pub remote_port: u16,
    /// Port of the local service reachable from the client.
    pub local_port: u16,
    /// Advisory label for logs and status reports.
    pub name: String,
    /// Transport protocol; only `"tcp"` is recognized.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Per-tunnel statistics reported in a [`ServerMessage::StatusResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    /// Public port bound on the server.
    pub remote_port: u16,
    /// Local port the tunnel forwards to.
    pub local_port: u16,
    /// Advisory tunnel name.
    pub name: String,
    /// Connections currently pending or spliced.
    pub active_connections: u64,
    /// Bytes copied from external users toward the client.
    pub bytes_in: u64,
    /// Bytes copied from the client toward external users.
    pub bytes_out: u64,
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate this control session with a shared token.
    Auth {
        /// Shared token compared against the server's allowlist.
        token: String,
    },
    /// Register a set of tunnels; the server answers one message per spec,
    /// in order.
    RegisterTunnels {
        /// Requested tunnels, keyed by remote port.
        tunnels: Vec<TunnelSpec>,
    },
    /// The data listener for one rendezvous is armed and may be dialed.
    #[serde(rename_all = "camelCase")]
    ConnectionReady {
        /// Rendezvous correlation id from `new_connection`.
        connection_id: Uuid,
        /// OS-assigned port of the one-shot data listener.
        data_port: u16,
    },
    /// One connection is dead on the client side and should be cleaned up.
    #[serde(rename_all = "camelCase")]
    ConnectionClosed {
        /// Connection being torn down.
        connection_id: Uuid,
        /// Human-readable cause.
        reason: String,
    },
    /// Ask for a status report of this session's tunnels.
    StatusRequest,
    /// Keepalive probe.
    Ping,
    /// Keepalive reply.
    Pong,
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session is authenticated.
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        /// Server-assigned id for this session.
        client_id: Uuid,
    },
    /// The presented token was rejected; the channel closes after this.
    AuthFailed {
        /// Human-readable cause.
        reason: String,
    },
    /// One requested tunnel is live.
    #[serde(rename_all = "camelCase")]
    TunnelRegistered {
        /// Public port now bound.
        remote_port: u16,
        /// Local port it forwards to.
        local_port: u16,
        /// Advisory tunnel name.
        name: String,
    },
    /// One requested tunnel could not be set up.
    #[serde(rename_all = "camelCase")]
    TunnelFailed {
        /// Public port that was requested.
        remote_port: u16,
        /// Why the registration failed.
        error: String,
    },
    /// An external user connected to a public port; the client should arm a
    /// data listener and reply with `connection_ready`.
    #[serde(rename_all = "camelCase")]
    NewConnection {
        /// Fresh rendezvous correlation id.
        connection_id: Uuid,
        /// Public port the external user hit.
        remote_port: u16,
        /// Address of the external user, for logging.
        client_address: String,
    },
    /// One connection is dead on the server side and should be cleaned up.
    #[serde(rename_all = "camelCase")]
    ConnectionClosed {
        /// Connection being torn down.
        connection_id: Uuid,
        /// Human-readable cause.
        reason: String,
    },
    /// Reply to `status_request`.
    #[serde(rename_all = "camelCase")]
    StatusResponse {
        /// Id of the requesting session.
        client_id: Uuid,
        /// Stats for every tunnel owned by the session.
        tunnels: Vec<TunnelStatus>,
        /// Seconds since the server started.
        uptime: u64,
        /// Unix timestamp of the report.
        timestamp: u64,
    },
    /// Keepalive probe.
    Ping,
    /// Keepalive reply.
    Pong,
}

/// Framed JSON transport over any reliable byte stream.
pub struct Delimited<U>(Framed<U, LengthDelimitedCodec>);

impl<U: AsyncRead + AsyncWrite + Unpin> Delimited<U> {
    /// Construct a new message stream over the given byte stream.
    pub fn new(stream: U) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self(Framed::new(stream, codec))
    }

    /// Read the next message, or `None` if the stream was closed.
    ///
    /// A frame that is not valid JSON for `M` surfaces as an error carrying
    /// a [`serde_json::Error`], which callers may downcast to distinguish a
    /// bad frame from a broken stream.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        match self.0.next().await {
            Some(frame) => {
                let frame = frame.context("could not read control frame")?;
                let msg = serde_json::from_slice(&frame)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Read the next message, waiting at most [`NETWORK_TIMEOUT`].
    pub async fn recv_timeout<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        timeout(NETWORK_TIMEOUT, self.recv())
            .await
            .context("timed out waiting for control message")?
    }

    /// Send a message on the stream.
    pub async fn send<M: Serialize>(&mut self, msg: M) -> Result<()> {
        let frame = serde_json::to_vec(&msg)?;
        self.0.send(Bytes::from(frame)).await?;
        Ok(())
    }
}
