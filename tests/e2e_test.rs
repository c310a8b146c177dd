//! End-to-end tests: a real server and client wired through loopback, plus
//! scripted control sessions for the protocol-level scenarios.

use std::time::Duration;

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use porthole::client::Client;
use porthole::config::{ClientConfig, PortRule, ServerConfig};
use porthole::protocol::{ClientMessage, Delimited, ServerMessage, TunnelSpec};
use porthole::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

lazy_static! {
    /// Timing-sensitive tests run one at a time.
    static ref SERIAL_GUARD: Mutex<()> = Mutex::new(());
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn server_config(control_port: u16, tokens: &[&str], allowed: &[u16]) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        control_port,
        auth_tokens: tokens.iter().map(|t| t.to_string()).collect(),
        allowed_ports: allowed.iter().map(|p| PortRule::Single(*p)).collect(),
        client_data_host: "127.0.0.1".to_string(),
        ..ServerConfig::default()
    }
}

fn tunnel(remote_port: u16, local_port: u16, name: &str) -> TunnelSpec {
    TunnelSpec {
        remote_port,
        local_port,
        name: name.to_string(),
        protocol: "tcp".to_string(),
    }
}

async fn spawn_server(config: ServerConfig) -> (broadcast::Sender<()>, JoinHandle<Result<()>>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = Server::new(config);
    let handle = tokio::spawn(server.listen(shutdown_rx));
    sleep(Duration::from_millis(50)).await;
    (shutdown_tx, handle)
}

/// Echo server standing in for the local service being exposed.
async fn spawn_echo() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(port)
}

async fn connect_retry(port: u16) -> Result<TcpStream> {
    for _ in 0..40 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return Ok(stream);
        }
        sleep(Duration::from_millis(50)).await;
    }
    bail!("port {port} never became reachable")
}

/// Read the next non-keepalive message, answering pings along the way.
async fn recv_msg(conn: &mut Delimited<TcpStream>) -> Result<ServerMessage> {
    loop {
        match timeout(Duration::from_secs(5), conn.recv::<ServerMessage>()).await?? {
            Some(ServerMessage::Ping) => conn.send(ClientMessage::Pong).await?,
            Some(msg) => return Ok(msg),
            None => bail!("control channel closed"),
        }
    }
}

/// Open a control session by hand and authenticate it.
async fn scripted_session(control_port: u16, token: &str) -> Result<Delimited<TcpStream>> {
    let mut conn = Delimited::new(connect_retry(control_port).await?);
    conn.send(ClientMessage::Auth {
        token: token.to_string(),
    })
    .await?;
    match recv_msg(&mut conn).await? {
        ServerMessage::AuthSuccess { .. } => Ok(conn),
        msg => bail!("expected auth_success, got {msg:?}"),
    }
}

#[tokio::test]
async fn tunnel_echo_end_to_end() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let echo_port = spawn_echo().await?;
    let control_port = free_port();
    let remote_port = free_port();

    let (_shutdown, _server) =
        spawn_server(server_config(control_port, &["secret"], &[remote_port])).await;

    let client = Client::new(ClientConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: control_port,
        auth_token: Some("secret".to_string()),
        tunnels: vec![tunnel(remote_port, echo_port, "web")],
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(100),
    });
    let client_task = tokio::spawn(async move { client.run().await });

    let mut stream = connect_retry(remote_port).await?;
    stream.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"hello");

    // The pair stays spliced across multiple exchanges.
    stream.write_all(b"porthole").await?;
    let mut buf = [0u8; 8];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"porthole");

    client_task.abort();
    Ok(())
}

#[tokio::test]
async fn concurrent_connections_all_complete() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let echo_port = spawn_echo().await?;
    let control_port = free_port();
    let remote_port = free_port();

    let (_shutdown, _server) =
        spawn_server(server_config(control_port, &[], &[remote_port])).await;

    let client = Client::new(ClientConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: control_port,
        auth_token: None,
        tunnels: vec![tunnel(remote_port, echo_port, "load")],
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(100),
    });
    let client_task = tokio::spawn(async move { client.run().await });
    connect_retry(remote_port).await?;

    let mut tasks = Vec::new();
    for i in 0..20u8 {
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 16 * 1024];
            let mut stream = TcpStream::connect(("127.0.0.1", remote_port)).await?;
            stream.write_all(&payload).await?;
            let mut echoed = vec![0u8; payload.len()];
            timeout(Duration::from_secs(10), stream.read_exact(&mut echoed)).await??;
            anyhow::ensure!(echoed == payload, "echo mismatch on connection {i}");
            Ok::<(), anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    client_task.abort();
    Ok(())
}

#[tokio::test]
async fn rejected_auth_leaves_no_tunnel() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let remote_port = free_port();

    let (_shutdown, _server) =
        spawn_server(server_config(control_port, &["secret"], &[remote_port])).await;

    // Protocol level: a bad token gets auth_failed and the channel closes.
    let mut conn = Delimited::new(connect_retry(control_port).await?);
    conn.send(ClientMessage::Auth {
        token: "wrong".to_string(),
    })
    .await?;
    match conn.recv_timeout::<ServerMessage>().await? {
        Some(ServerMessage::AuthFailed { reason }) => {
            assert!(reason.contains("invalid"), "got: {reason}")
        }
        msg => bail!("expected auth_failed, got {msg:?}"),
    }
    assert!(!matches!(
        conn.recv_timeout::<ServerMessage>().await,
        Ok(Some(_))
    ));

    // A real client with the wrong token backs off and eventually gives up.
    let client = Client::new(ClientConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: control_port,
        auth_token: Some("wrong".to_string()),
        tunnels: vec![tunnel(remote_port, free_port(), "web")],
        reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(50),
    });
    let result = timeout(Duration::from_secs(5), client.run()).await?;
    assert!(result.is_err());

    // Nothing was ever bound on the public port.
    assert!(TcpStream::connect(("127.0.0.1", remote_port)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn sending_before_auth_closes_the_channel() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let (_shutdown, _server) = spawn_server(server_config(control_port, &["secret"], &[])).await;

    let mut conn = Delimited::new(connect_retry(control_port).await?);
    conn.send(ClientMessage::Ping).await?;
    match conn.recv_timeout::<ServerMessage>().await? {
        Some(ServerMessage::AuthFailed { reason }) => {
            assert!(reason.contains("authentication required"), "got: {reason}")
        }
        msg => bail!("expected auth_failed, got {msg:?}"),
    }
    assert!(!matches!(
        conn.recv_timeout::<ServerMessage>().await,
        Ok(Some(_))
    ));
    Ok(())
}

#[tokio::test]
async fn register_results_come_back_in_request_order() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let allowed_port = free_port();
    let denied_port = free_port();

    let (_shutdown, _server) =
        spawn_server(server_config(control_port, &[], &[allowed_port])).await;

    let mut conn = scripted_session(control_port, "anything").await?;
    conn.send(ClientMessage::RegisterTunnels {
        tunnels: vec![
            tunnel(allowed_port, 9000, "ok"),
            tunnel(denied_port, 9001, "blocked"),
        ],
    })
    .await?;

    // Partial success, one reply per spec, preserving order.
    match recv_msg(&mut conn).await? {
        ServerMessage::TunnelRegistered { remote_port, .. } => {
            assert_eq!(remote_port, allowed_port)
        }
        msg => bail!("expected tunnel_registered, got {msg:?}"),
    }
    match recv_msg(&mut conn).await? {
        ServerMessage::TunnelFailed { remote_port, error } => {
            assert_eq!(remote_port, denied_port);
            assert!(error.contains("allowed"), "got: {error}");
        }
        msg => bail!("expected tunnel_failed, got {msg:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn fast_reconnect_can_rebind_its_port() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let remote_port = free_port();

    let (_shutdown, _server) =
        spawn_server(server_config(control_port, &["secret"], &[remote_port])).await;

    let mut first = scripted_session(control_port, "secret").await?;
    first
        .send(ClientMessage::RegisterTunnels {
            tunnels: vec![tunnel(remote_port, 9000, "web")],
        })
        .await?;
    assert!(matches!(
        recv_msg(&mut first).await?,
        ServerMessage::TunnelRegistered { .. }
    ));

    // Kill the session and come straight back: the teardown delay plus the
    // bind retry loop must absorb the race.
    drop(first);
    let mut second = scripted_session(control_port, "secret").await?;
    second
        .send(ClientMessage::RegisterTunnels {
            tunnels: vec![tunnel(remote_port, 9000, "web")],
        })
        .await?;
    match recv_msg(&mut second).await? {
        ServerMessage::TunnelRegistered { remote_port: port, .. } => {
            assert_eq!(port, remote_port)
        }
        msg => bail!("expected tunnel_registered after reconnect, got {msg:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn silent_client_rendezvous_times_out() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let remote_port = free_port();

    let mut config = server_config(control_port, &[], &[remote_port]);
    config.connection_timeout = Duration::from_millis(300);
    let (_shutdown, _server) = spawn_server(config).await;

    let mut conn = scripted_session(control_port, "").await?;
    conn.send(ClientMessage::RegisterTunnels {
        tunnels: vec![tunnel(remote_port, 9000, "web")],
    })
    .await?;
    assert!(matches!(
        recv_msg(&mut conn).await?,
        ServerMessage::TunnelRegistered { .. }
    ));

    let mut external = TcpStream::connect(("127.0.0.1", remote_port)).await?;
    assert!(matches!(
        recv_msg(&mut conn).await?,
        ServerMessage::NewConnection { .. }
    ));

    // Never answer: the deadline must close the external socket.
    let read = timeout(Duration::from_secs(2), external.read(&mut [0u8; 1])).await?;
    assert!(matches!(read, Ok(0) | Err(_)), "socket should be dead");

    conn.send(ClientMessage::StatusRequest).await?;
    match recv_msg(&mut conn).await? {
        ServerMessage::StatusResponse { tunnels, .. } => {
            assert_eq!(tunnels.len(), 1);
            assert_eq!(tunnels[0].active_connections, 0);
        }
        msg => bail!("expected status_response, got {msg:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn status_reports_registered_tunnels() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let remote_port = free_port();

    let (_shutdown, _server) =
        spawn_server(server_config(control_port, &[], &[remote_port])).await;

    let mut conn = scripted_session(control_port, "").await?;
    conn.send(ClientMessage::RegisterTunnels {
        tunnels: vec![tunnel(remote_port, 9000, "web")],
    })
    .await?;
    assert!(matches!(
        recv_msg(&mut conn).await?,
        ServerMessage::TunnelRegistered { .. }
    ));

    conn.send(ClientMessage::StatusRequest).await?;
    match recv_msg(&mut conn).await? {
        ServerMessage::StatusResponse { tunnels, .. } => {
            assert_eq!(tunnels.len(), 1);
            assert_eq!(tunnels[0].remote_port, remote_port);
            assert_eq!(tunnels[0].local_port, 9000);
            assert_eq!(tunnels[0].name, "web");
        }
        msg => bail!("expected status_response, got {msg:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_releases_every_port() -> Result<()> {
    let _guard = SERIAL_GUARD.lock().await;
    let control_port = free_port();
    let remote_port = free_port();

    let (shutdown, server) =
        spawn_server(server_config(control_port, &[], &[remote_port])).await;

    let mut conn = scripted_session(control_port, "").await?;
    conn.send(ClientMessage::RegisterTunnels {
        tunnels: vec![tunnel(remote_port, 9000, "web")],
    })
    .await?;
    assert!(matches!(
        recv_msg(&mut conn).await?,
        ServerMessage::TunnelRegistered { .. }
    ));

    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(5), server).await???;

    // Both the control port and the public port are free again.
    TcpListener::bind(("127.0.0.1", control_port)).await?;
    TcpListener::bind(("127.0.0.1", remote_port)).await?;
    Ok(())
}
