//! Server-side tunnel registry: public listeners, rendezvous, and lifecycle.
//!
//! The registry owns every tunnel. Listener tasks, rendezvous watchdogs, and
//! splice tasks reach tunnels only through the registry's maps, and only to
//! destroy them during teardown; each socket is owned end-to-end by the task
//! that drives it.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::protocol::{ServerMessage, TunnelSpec, TunnelStatus, NETWORK_TIMEOUT};

/// Extra bind attempts while a port drains out of TIME_WAIT.
const BIND_RETRIES: u32 = 3;

/// Spacing between bind attempts.
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Pause between closing a public listener and releasing its registry slot.
const PORT_RELEASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct TunnelStats {
    /// Connections currently pending or spliced; incremented on external
    /// accept and decremented exactly once per connection.
    active_connections: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

struct Tunnel {
    spec: TunnelSpec,
    owner: Uuid,
    /// Control-channel sink of the owning session.
    outbound: mpsc::Sender<ServerMessage>,
    /// Signals the acceptor task to stop and drop the public listener.
    shutdown: broadcast::Sender<()>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    /// Live pairs, keyed by connection id; the value cancels the splice.
    active: DashMap<Uuid, oneshot::Sender<()>>,
    stats: TunnelStats,
}

impl Tunnel {
    fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// An external socket accepted on a public port, waiting for the client to
/// arm its data listener.
struct PendingConn {
    external: TcpStream,
    remote_port: u16,
    deadline: Instant,
}

/// Owning table of tunnels and in-flight rendezvous.
pub struct Registry {
    config: Arc<ServerConfig>,
    tunnels: Arc<DashMap<u16, Arc<Tunnel>>>,
    pending: Arc<DashMap<Uuid, PendingConn>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Registry {
            config,
            tunnels: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Register one tunnel for an authenticated client and start accepting
    /// external connections on its public port.
    ///
    /// Rendezvous notifications for the tunnel are pushed into `outbound`.
    /// Returns a client-facing error string on failure; partial success
    /// across a batch of specs is expected and normal.
    pub async fn register(
        &self,
        spec: TunnelSpec,
        owner: Uuid,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<(), String> {
        if spec.protocol != "tcp" {
            return Err(format!("unsupported protocol {:?}", spec.protocol));
        }
        let port = spec.remote_port;
        if port == 0 {
            return Err("remote port must be nonzero".to_string());
        }
        if !self.config.port_allowed(port) {
            return Err(format!("port {port} is not in the allowed list"));
        }
        let listener = self.bind_public(port).await?;

        let (shutdown, _) = broadcast::channel(1);
        let tunnel = Arc::new(Tunnel {
            spec: spec.clone(),
            owner,
            outbound,
            shutdown,
            acceptor: Mutex::new(None),
            closing: AtomicBool::new(false),
            active: DashMap::new(),
            stats: TunnelStats::default(),
        });

        match self.tunnels.entry(port) {
            Entry::Occupied(_) => {
                // Lost a registration race while binding; drop the listener.
                return Err(format!("port {port} is already registered"));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&tunnel));
            }
        }

        let task = tokio::spawn(
            accept_loop(
                Arc::clone(&self.config),
                Arc::clone(&self.pending),
                Arc::clone(&tunnel),
                listener,
            )
            .instrument(info_span!("listener", port)),
        );
        *tunnel.acceptor.lock().await = Some(task);

        info!(port, local_port = spec.local_port, name = %spec.name, %owner, "tunnel registered");
        Ok(())
    }

    /// Bind the public listener, retrying the port-in-use error class.
    ///
    /// A port can look busy for two transient reasons: the OS still holds
    /// it in TIME_WAIT, or a tunnel mid-teardown still holds its registry
    /// slot for the duration of [`PORT_RELEASE_DELAY`]. Both clear within
    /// the retry window; a port owned by a live tunnel fails the same way
    /// once the retries run out.
    async fn bind_public(&self, port: u16) -> Result<TcpListener, String> {
        let mut last_err = None;
        for attempt in 0..=BIND_RETRIES {
            if attempt > 0 {
                sleep(BIND_RETRY_DELAY).await;
            }
            if self.tunnels.contains_key(&port) {
                last_err = Some(format!("port {port} is already registered"));
                continue;
            }
            match TcpListener::bind((self.config.host.as_str(), port)).await {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    warn!(port, attempt = attempt + 1, "public port in use, retrying bind");
                    last_err = Some(format!("failed to bind port {port}: {err}"));
                }
                Err(err) => return Err(format!("failed to bind port {port}: {err}")),
            }
        }
        Err(last_err.unwrap_or_else(|| format!("failed to bind port {port}")))
    }

    /// Claim a pending rendezvous and splice it to the client's data
    /// listener.
    ///
    /// The claim happens synchronously so control messages about the same
    /// connection stay ordered; the dial and splice run on their own task.
    pub fn connection_ready(&self, owner: Uuid, id: Uuid, data_port: u16) {
        let Some((_, pend)) = self.pending.remove(&id) else {
            warn!(%id, "connection_ready for unknown or expired connection");
            return;
        };
        let tunnel = match self.tunnels.get(&pend.remote_port) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                warn!(%id, port = pend.remote_port, "connection_ready for a torn-down tunnel");
                return;
            }
        };
        if tunnel.owner != owner {
            warn!(%id, "connection_ready from a non-owning session");
            tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        if Instant::now() >= pend.deadline {
            warn!(%id, "connection_ready after deadline, dropping external connection");
            tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        // The cancel handle goes into the active map before the dial starts,
        // so cleanup and teardown can always find the connection: an id is
        // never in neither table.
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tunnel.active.insert(id, cancel_tx);
        if tunnel.closing() {
            // Teardown may have swept the active map before this insert
            // landed.
            if tunnel.active.remove(&id).is_some() {
                tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            }
            return;
        }
        tokio::spawn(
            dial_and_splice(
                Arc::clone(&self.config),
                tunnel,
                id,
                pend.external,
                data_port,
                cancel_rx,
            )
            .instrument(info_span!("pair", %id)),
        );
    }

    /// Destroy one connection wherever it currently lives.
    ///
    /// Fires on external or data socket death, an explicit
    /// `connection_closed` message, or deadline expiry. Calling it twice for
    /// the same id behaves identically to calling it once.
    pub fn cleanup_connection(&self, id: Uuid, reason: &str) {
        if let Some((_, pend)) = self.pending.remove(&id) {
            if let Some(tunnel) = self.tunnels.get(&pend.remote_port) {
                tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            }
            info!(%id, reason, "pending connection cleaned up");
            return;
        }
        for tunnel in self.tunnels.iter() {
            if let Some((_, cancel)) = tunnel.active.remove(&id) {
                let _ = cancel.send(());
                tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                info!(%id, reason, "active connection cleaned up");
                return;
            }
        }
        // Unknown id: already cleaned up, nothing left to do.
    }

    /// Tear one tunnel down: destroy its pairs and pending rendezvous, stop
    /// the acceptor, then release the registry slot after the OS has had
    /// time to settle the closed listener's address.
    pub async fn teardown_tunnel(&self, port: u16) {
        let Some(tunnel) = self.tunnels.get(&port).map(|t| Arc::clone(t.value())) else {
            return;
        };
        if tunnel.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(port, "tearing down tunnel");

        self.sweep_tunnel_connections(&tunnel, port);

        let _ = tunnel.shutdown.send(());
        if let Some(task) = tunnel.acceptor.lock().await.take() {
            if let Err(err) = task.await {
                warn!(%err, "acceptor task failed during teardown");
            }
        }

        // Catch rendezvous that raced the acceptor shutdown.
        self.sweep_tunnel_connections(&tunnel, port);

        sleep(PORT_RELEASE_DELAY).await;
        self.tunnels.remove(&port);
        info!(port, "tunnel removed");
    }

    fn sweep_tunnel_connections(&self, tunnel: &Tunnel, port: u16) {
        let ids: Vec<Uuid> = tunnel.active.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, cancel)) = tunnel.active.remove(&id) {
                if cancel.send(()).is_err() {
                    warn!(%id, "connection task was already gone");
                }
                tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| e.value().remote_port == port)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            if self.pending.remove(&id).is_some() {
                tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Tear down every tunnel owned by a disconnected client.
    pub async fn teardown_client(&self, owner: Uuid) {
        let ports: Vec<u16> = self
            .tunnels
            .iter()
            .filter(|e| e.value().owner == owner)
            .map(|e| *e.key())
            .collect();
        if ports.is_empty() {
            return;
        }
        info!(%owner, count = ports.len(), "tearing down tunnels of disconnected client");
        for port in ports {
            self.teardown_tunnel(port).await;
        }
    }

    /// Tear down every tunnel; used on graceful shutdown.
    pub async fn teardown_all(&self) {
        let ports: Vec<u16> = self.tunnels.iter().map(|e| *e.key()).collect();
        for port in ports {
            self.teardown_tunnel(port).await;
        }
    }

    /// Stats snapshot for every tunnel owned by `owner`.
    pub fn status_for(&self, owner: Uuid) -> Vec<TunnelStatus> {
        self.tunnels
            .iter()
            .filter(|e| e.value().owner == owner)
            .map(|e| {
                let tunnel = e.value();
                TunnelStatus {
                    remote_port: tunnel.spec.remote_port,
                    local_port: tunnel.spec.local_port,
                    name: tunnel.spec.name.clone(),
                    active_connections: tunnel.stats.active_connections.load(Ordering::Relaxed),
                    bytes_in: tunnel.stats.bytes_in.load(Ordering::Relaxed),
                    bytes_out: tunnel.stats.bytes_out.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Number of registered tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of rendezvous currently waiting for a `connection_ready`.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Per-tunnel acceptor: owns the public listener until teardown.
async fn accept_loop(
    config: Arc<ServerConfig>,
    pending: Arc<DashMap<Uuid, PendingConn>>,
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
) {
    let mut shutdown = tunnel.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = listener.accept() => match result {
                Ok((external, peer)) => {
                    handle_external(&config, &pending, &tunnel, external, peer.to_string()).await;
                }
                Err(err) => {
                    // Transient accept failures (EMFILE and friends) must not
                    // kill the listener.
                    warn!(%err, "failed to accept external connection");
                    sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    // The listener drops here; teardown waits for this task before starting
    // the release delay.
}

async fn handle_external(
    config: &Arc<ServerConfig>,
    pending: &Arc<DashMap<Uuid, PendingConn>>,
    tunnel: &Arc<Tunnel>,
    external: TcpStream,
    peer: String,
) {
    let id = Uuid::new_v4();
    let port = tunnel.spec.remote_port;
    info!(%id, %peer, "new external connection");

    tunnel.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let deadline = Instant::now() + config.connection_timeout;
    pending.insert(
        id,
        PendingConn {
            external,
            remote_port: port,
            deadline,
        },
    );

    let msg = ServerMessage::NewConnection {
        connection_id: id,
        remote_port: port,
        client_address: peer,
    };
    if tunnel.outbound.send(msg).await.is_err() {
        warn!(%id, "control channel is gone, dropping external connection");
        if pending.remove(&id).is_some() {
            tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
        return;
    }

    // Watchdog: a rendezvous left unclaimed past its deadline is dropped,
    // which closes the external socket.
    let pending = Arc::clone(pending);
    let tunnel = Arc::clone(tunnel);
    tokio::spawn(async move {
        sleep_until(deadline).await;
        if pending.remove(&id).is_some() {
            tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            warn!(%id, "rendezvous timed out, dropping external connection");
        }
    });
}

/// Dial the client's one-shot data listener and splice it to the external
/// socket until either side closes.
///
/// The connection is already in the tunnel's active map; `cancel_rx` fires
/// when cleanup or teardown removes it, including mid-dial.
async fn dial_and_splice(
    config: Arc<ServerConfig>,
    tunnel: Arc<Tunnel>,
    id: Uuid,
    mut external: TcpStream,
    data_port: u16,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let host = config.client_data_host.as_str();
    let mut data = tokio::select! {
        dialed = timeout(NETWORK_TIMEOUT, TcpStream::connect((host, data_port))) => match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return abandon_pair(&tunnel, id, &format!("data channel dial failed: {err}")).await;
            }
            Err(_) => {
                return abandon_pair(&tunnel, id, "data channel dial timed out").await;
            }
        },
        _ = &mut cancel_rx => {
            // Whoever cancelled has already removed the id and settled the
            // counter; the external socket drops here.
            info!("connection cancelled during data dial");
            return;
        }
    };

    let started = Instant::now();
    let outcome = tokio::select! {
        res = copy_bidirectional(&mut external, &mut data) => Some(res),
        _ = &mut cancel_rx => None,
    };
    match outcome {
        Some(Ok((bytes_in, bytes_out))) => {
            tunnel.stats.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
            tunnel.stats.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
            info!(bytes_in, bytes_out, elapsed = ?started.elapsed(), "connection closed");
        }
        Some(Err(err)) => info!(%err, "connection closed with error"),
        None => info!("connection cancelled"),
    }
    if tunnel.active.remove(&id).is_some() {
        tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Give up on a claimed rendezvous before the splice started.
///
/// The client has a local service socket and a one-shot listener armed for
/// this id, so it is told to release them. Removal from the active map is
/// what settles the counter; a concurrent cleanup may have won that race.
async fn abandon_pair(tunnel: &Tunnel, id: Uuid, reason: &str) {
    warn!(%id, reason, "abandoning connection");
    if tunnel.active.remove(&id).is_some() {
        tunnel.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
    let msg = ServerMessage::ConnectionClosed {
        connection_id: id,
        reason: reason.to_string(),
    };
    let _ = tunnel.outbound.send(msg).await;
}
