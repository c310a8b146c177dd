//! Control-plane server: accepts client sessions and drives their tunnels.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::protocol::{ClientMessage, Delimited, ServerMessage};
use crate::registry::Registry;

/// Capacity of each session's outbound message queue.
const OUTBOUND_QUEUE: usize = 256;

/// State structure for the server.
pub struct Server {
    config: Arc<ServerConfig>,
    auth: Authenticator,
    registry: Registry,
    started_at: Instant,
}

impl Server {
    /// Create a new server from its configuration record.
    pub fn new(config: ServerConfig) -> Self {
        let auth = Authenticator::new(&config.auth_tokens);
        if auth.is_open() {
            warn!("no auth tokens configured, accepting all clients");
        }
        let config = Arc::new(config);
        Server {
            auth,
            registry: Registry::new(Arc::clone(&config)),
            config,
            started_at: Instant::now(),
        }
    }

    /// The tunnel registry backing this server.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the control listener until the shutdown signal fires, then tear
    /// down every tunnel before returning.
    pub async fn listen(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let this = Arc::new(self);
        let listener = TcpListener::bind((this.config.host.as_str(), this.config.control_port))
            .await
            .context("failed to bind control port")?;
        info!(addr = %listener.local_addr()?, "server listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                result = listener.accept() => {
                    let (stream, addr) = result.context("failed to accept control connection")?;
                    let this = Arc::clone(&this);
                    tokio::spawn(
                        async move {
                            info!("incoming control connection");
                            if let Err(err) = this.handle_session(stream).await {
                                warn!(%err, "control session exited with error");
                            } else {
                                info!("control session exited");
                            }
                        }
                        .instrument(info_span!("control", ?addr)),
                    );
                }
            }
        }

        // Stop accepting first, then unwind every tunnel.
        drop(listener);
        info!("shutting down, tearing down all tunnels");
        this.registry.teardown_all().await;
        Ok(())
    }

    /// Drive one control session from handshake to cleanup.
    async fn handle_session(&self, stream: TcpStream) -> Result<()> {
        let mut conn = Delimited::new(stream);

        // Await auth: the first frame decides whether the session lives. Any
        // malformed or non-auth frame before authentication closes the
        // channel.
        let token = match conn.recv_timeout::<ClientMessage>().await? {
            Some(ClientMessage::Auth { token }) => token,
            Some(_) => {
                conn.send(ServerMessage::AuthFailed {
                    reason: "authentication required".to_string(),
                })
                .await?;
                bail!("received non-auth frame before authentication");
            }
            None => bail!("channel closed before authentication"),
        };
        if !self.auth.validate(&token) {
            conn.send(ServerMessage::AuthFailed {
                reason: "invalid token".to_string(),
            })
            .await?;
            bail!(
                "rejected token with fingerprint {}",
                Authenticator::fingerprint(&token)
            );
        }

        let client_id = Uuid::new_v4();
        conn.send(ServerMessage::AuthSuccess { client_id }).await?;
        info!(%client_id, "client authenticated");

        let result = self
            .run_session(&mut conn, client_id)
            .instrument(info_span!("session", %client_id))
            .await;

        // The session is gone either way; every tunnel it owned goes too.
        self.registry.teardown_client(client_id).await;
        result
    }

    /// Authenticated phase: process inbound frames FIFO, relay rendezvous
    /// messages, and keep the session alive with pings.
    async fn run_session(&self, conn: &mut Delimited<TcpStream>, client_id: Uuid) -> Result<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
        let mut ping_timer = interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                inbound = conn.recv::<ClientMessage>() => match inbound {
                    Ok(Some(msg)) => {
                        last_seen = Instant::now();
                        self.dispatch(conn, client_id, &outbound_tx, msg).await?;
                    }
                    Ok(None) => {
                        info!("client disconnected");
                        return Ok(());
                    }
                    Err(err) if err.downcast_ref::<serde_json::Error>().is_some() => {
                        // Bad frame after auth: log and drop, keep the session.
                        warn!(%err, "ignoring malformed control frame");
                        last_seen = Instant::now();
                    }
                    Err(err) => return Err(err.context("control channel failed")),
                },
                Some(msg) = outbound_rx.recv() => {
                    conn.send(msg).await?;
                }
                _ = ping_timer.tick() => {
                    if last_seen.elapsed() > self.config.ping_timeout {
                        bail!("ping timeout after {:?} of silence", last_seen.elapsed());
                    }
                    conn.send(ServerMessage::Ping).await?;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &mut Delimited<TcpStream>,
        client_id: Uuid,
        outbound: &mpsc::Sender<ServerMessage>,
        msg: ClientMessage,
    ) -> Result<()> {
        match msg {
            ClientMessage::Auth { .. } => warn!("ignoring duplicate auth"),
            ClientMessage::RegisterTunnels { tunnels } => {
                // One reply per requested spec, in request order.
                for spec in tunnels {
                    let (remote_port, local_port, name) =
                        (spec.remote_port, spec.local_port, spec.name.clone());
                    let reply = match self
                        .registry
                        .register(spec, client_id, outbound.clone())
                        .await
                    {
                        Ok(()) => ServerMessage::TunnelRegistered {
                            remote_port,
                            local_port,
                            name,
                        },
                        Err(error) => {
                            warn!(remote_port, %error, "tunnel registration failed");
                            ServerMessage::TunnelFailed { remote_port, error }
                        }
                    };
                    conn.send(reply).await?;
                }
            }
            ClientMessage::ConnectionReady {
                connection_id,
                data_port,
            } => {
                self.registry
                    .connection_ready(client_id, connection_id, data_port);
            }
            ClientMessage::ConnectionClosed {
                connection_id,
                reason,
            } => {
                self.registry.cleanup_connection(connection_id, &reason);
            }
            ClientMessage::StatusRequest => {
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                conn.send(ServerMessage::StatusResponse {
                    client_id,
                    tunnels: self.registry.status_for(client_id),
                    uptime: self.started_at.elapsed().as_secs(),
                    timestamp,
                })
                .await?;
            }
            ClientMessage::Ping => conn.send(ServerMessage::Pong).await?,
            ClientMessage::Pong => (),
        }
        Ok(())
    }
}
