//! Client implementation: control session, reconnect, and the data acceptor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::protocol::{
    ClientMessage, Delimited, ServerMessage, CONNECTION_TIMEOUT, NETWORK_TIMEOUT,
};

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Capacity of the session's outbound message queue.
const OUTBOUND_QUEUE: usize = 256;

/// Host the configured local services are dialed on.
const LOCAL_HOST: &str = "localhost";

/// State structure for the client.
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client from its configuration record.
    pub fn new(config: ClientConfig) -> Self {
        Client { config }
    }

    /// Run the client, reconnecting with capped exponential backoff until
    /// the attempt budget is exhausted.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = reconnect_backoff(self.config.reconnect_delay);
        let mut failures: u32 = 0;
        loop {
            match self.session().await {
                Ok(()) => {
                    // An established session that later dropped restarts the
                    // backoff schedule.
                    failures = 0;
                    backoff.reset();
                    warn!("control channel closed");
                }
                Err(err) => {
                    failures += 1;
                    error!(%err, failures, "control session failed");
                    if failures >= self.config.reconnect_attempts {
                        bail!("giving up after {failures} failed connection attempts");
                    }
                }
            }
            let delay = backoff.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
            info!(?delay, "reconnecting");
            sleep(delay).await;
        }
    }

    /// One control session: dial, authenticate, register, serve.
    async fn session(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        info!(%addr, "connecting to server");
        let stream = timeout(NETWORK_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("could not connect to {addr}"))?;
        let mut conn = Delimited::new(stream);

        let token = self.config.auth_token.clone().unwrap_or_default();
        conn.send(ClientMessage::Auth { token }).await?;
        let client_id = match conn.recv_timeout::<ServerMessage>().await? {
            Some(ServerMessage::AuthSuccess { client_id }) => client_id,
            Some(ServerMessage::AuthFailed { reason }) => bail!("authentication failed: {reason}"),
            Some(_) => bail!("unexpected reply to auth"),
            None => bail!("channel closed during authentication"),
        };
        info!(%client_id, "authenticated with server");

        // The server treats every connect as a fresh session, so the whole
        // tunnel set is registered each time.
        conn.send(ClientMessage::RegisterTunnels {
            tunnels: self.config.tunnels.clone(),
        })
        .await?;

        self.serve(conn)
            .instrument(info_span!("session", %client_id))
            .await
    }

    async fn serve(&self, mut conn: Delimited<TcpStream>) -> Result<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_QUEUE);
        let active: Arc<DashMap<Uuid, oneshot::Sender<()>>> = Arc::new(DashMap::new());

        let result = loop {
            tokio::select! {
                inbound = conn.recv::<ServerMessage>() => match inbound {
                    Ok(Some(msg)) => {
                        if let Err(err) = self.dispatch(msg, &outbound_tx, &active).await {
                            break Err(err);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) if err.downcast_ref::<serde_json::Error>().is_some() => {
                        warn!(%err, "ignoring malformed control frame");
                    }
                    Err(err) => break Err(err.context("control channel failed")),
                },
                Some(msg) = outbound_rx.recv() => {
                    if let Err(err) = conn.send(msg).await {
                        break Err(err);
                    }
                }
            }
        };

        // No connection outlives its session.
        let ids: Vec<Uuid> = active.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, cancel)) = active.remove(&id) {
                let _ = cancel.send(());
            }
        }
        result
    }

    async fn dispatch(
        &self,
        msg: ServerMessage,
        outbound: &mpsc::Sender<ClientMessage>,
        active: &Arc<DashMap<Uuid, oneshot::Sender<()>>>,
    ) -> Result<()> {
        match msg {
            ServerMessage::Ping => outbound
                .send(ClientMessage::Pong)
                .await
                .context("session outbound queue closed")?,
            ServerMessage::Pong => (),
            ServerMessage::AuthSuccess { .. } | ServerMessage::AuthFailed { .. } => {
                warn!("unexpected auth message after handshake");
            }
            ServerMessage::TunnelRegistered {
                remote_port,
                local_port,
                name,
            } => {
                info!(%name, remote_port, local_port, "tunnel registered");
            }
            ServerMessage::TunnelFailed { remote_port, error } => {
                error!(remote_port, %error, "tunnel rejected by server");
            }
            ServerMessage::NewConnection {
                connection_id,
                remote_port,
                client_address,
            } => {
                let Some(spec) = self
                    .config
                    .tunnels
                    .iter()
                    .find(|t| t.remote_port == remote_port)
                else {
                    warn!(remote_port, "connection for a tunnel this client never requested");
                    let _ = outbound
                        .send(ClientMessage::ConnectionClosed {
                            connection_id,
                            reason: format!("no tunnel registered for port {remote_port}"),
                        })
                        .await;
                    return Ok(());
                };
                info!(%connection_id, remote_port, %client_address, "new connection");
                let (cancel_tx, cancel_rx) = oneshot::channel();
                active.insert(connection_id, cancel_tx);
                let local_port = spec.local_port;
                let outbound = outbound.clone();
                let active = Arc::clone(active);
                tokio::spawn(
                    async move {
                        match handle_connection(connection_id, local_port, &outbound, cancel_rx)
                            .await
                        {
                            Ok(()) => info!("connection exited"),
                            Err(err) => warn!(%err, "connection exited with error"),
                        }
                        active.remove(&connection_id);
                    }
                    .instrument(info_span!("conn", id = %connection_id)),
                );
            }
            ServerMessage::ConnectionClosed {
                connection_id,
                reason,
            } => {
                if let Some((_, cancel)) = active.remove(&connection_id) {
                    info!(%connection_id, %reason, "connection closed by server");
                    let _ = cancel.send(());
                }
            }
            ServerMessage::StatusResponse {
                tunnels, uptime, ..
            } => {
                info!(uptime, tunnels = tunnels.len(), "server status received");
            }
        }
        Ok(())
    }
}

/// Serve one rendezvous: dial the local service, arm the one-shot data
/// listener, report readiness, then splice data to the local service.
async fn handle_connection(
    id: Uuid,
    local_port: u16,
    outbound: &mpsc::Sender<ClientMessage>,
    mut cancel: oneshot::Receiver<()>,
) -> Result<()> {
    // Local service first: without it there is nothing to splice.
    let mut local = match timeout(
        NETWORK_TIMEOUT,
        TcpStream::connect((LOCAL_HOST, local_port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let _ = outbound
                .send(ClientMessage::ConnectionClosed {
                    connection_id: id,
                    reason: format!("local service unavailable: {err}"),
                })
                .await;
            return Err(err).context("could not dial the local service");
        }
        Err(_) => {
            let _ = outbound
                .send(ClientMessage::ConnectionClosed {
                    connection_id: id,
                    reason: "local service unavailable: connect timed out".to_string(),
                })
                .await;
            bail!("timed out dialing the local service on port {local_port}");
        }
    };

    // One-shot loopback listener for the server's data dial.
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind data listener")?;
    let data_port = listener.local_addr()?.port();
    outbound
        .send(ClientMessage::ConnectionReady {
            connection_id: id,
            data_port,
        })
        .await
        .context("session outbound queue closed")?;

    let accepted = tokio::select! {
        result = timeout(CONNECTION_TIMEOUT, listener.accept()) => match result {
            Ok(Ok((stream, _))) => Some(stream),
            Ok(Err(err)) => return Err(err).context("data listener accept failed"),
            Err(_) => None,
        },
        _ = &mut cancel => {
            info!("connection cancelled before the data channel arrived");
            return Ok(());
        }
    };
    drop(listener);
    let Some(mut data) = accepted else {
        let _ = outbound
            .send(ClientMessage::ConnectionClosed {
                connection_id: id,
                reason: "data channel accept timed out".to_string(),
            })
            .await;
        bail!("server never dialed the data channel");
    };

    let outcome = tokio::select! {
        result = copy_bidirectional(&mut data, &mut local) => Some(result),
        _ = &mut cancel => None,
    };
    match outcome {
        Some(Ok((bytes_in, bytes_out))) => info!(bytes_in, bytes_out, "connection closed"),
        Some(Err(err)) => info!(%err, "connection closed with error"),
        None => info!("connection cancelled"),
    }
    Ok(())
}

/// Backoff schedule for control-session reconnects: starts at the
/// configured delay and grows toward [`MAX_RECONNECT_DELAY`], never
/// expiring on its own (the attempt budget bounds it instead).
fn reconnect_backoff(initial: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: initial,
        max_interval: MAX_RECONNECT_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
