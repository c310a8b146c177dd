use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use porthole::client::Client;
use porthole::config::{self, ClientConfig, ServerConfig};
use porthole::server::Server;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Log verbosity: error, warn, info, debug, or trace.
    #[clap(long, global = true, default_value = "info", env = "PORTHOLE_LOG_LEVEL")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the public server that exposes tunnels.
    Server {
        /// Address the control and public listeners bind to.
        #[clap(long, default_value = "0.0.0.0", env = "PORTHOLE_HOST")]
        host: String,

        /// Port of the control listener.
        #[clap(long, default_value_t = porthole::protocol::CONTROL_PORT, env = "PORTHOLE_CONTROL_PORT")]
        control_port: u16,

        /// Comma-separated shared tokens; empty accepts every client.
        #[clap(
            long,
            env = "PORTHOLE_AUTH_TOKENS",
            hide_env_values = true,
            value_delimiter = ',',
            num_args = 0..
        )]
        auth_tokens: Vec<String>,

        /// Public ports clients may register, e.g. "3000,4000-4999"; empty
        /// allows all.
        #[clap(long, default_value = "", env = "PORTHOLE_ALLOWED_PORTS")]
        allowed_ports: String,

        /// Rendezvous deadline in milliseconds.
        #[clap(long, default_value_t = 10_000, env = "PORTHOLE_CONNECTION_TIMEOUT_MS")]
        connection_timeout_ms: u64,

        /// Keepalive ping interval in milliseconds.
        #[clap(long, default_value_t = 30_000, env = "PORTHOLE_PING_INTERVAL_MS")]
        ping_interval_ms: u64,

        /// Silence threshold before a session is dropped, in milliseconds.
        #[clap(long, default_value_t = 60_000, env = "PORTHOLE_PING_TIMEOUT_MS")]
        ping_timeout_ms: u64,

        /// Host dialed to reach a client's data listeners.
        #[clap(long, default_value = "localhost", env = "PORTHOLE_CLIENT_DATA_HOST")]
        client_data_host: String,
    },

    /// Runs the client that forwards tunnels to local services.
    Client {
        /// Host of the public server.
        #[clap(env = "PORTHOLE_SERVER")]
        server_host: String,

        /// Control port of the public server.
        #[clap(short, long, default_value_t = porthole::protocol::CONTROL_PORT, env = "PORTHOLE_SERVER_PORT")]
        server_port: u16,

        /// Tunnels to register, "<remotePort>:<localPort>:<name>"
        /// comma-separated.
        #[clap(short, long, env = "PORTHOLE_TUNNELS")]
        tunnels: String,

        /// Shared token for authentication.
        #[clap(long, env = "PORTHOLE_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Failed connection attempts to tolerate before giving up.
        #[clap(long, default_value_t = 999, env = "PORTHOLE_RECONNECT_ATTEMPTS")]
        reconnect_attempts: u32,

        /// Delay before the first reconnect, in milliseconds.
        #[clap(long, default_value_t = 5_000, env = "PORTHOLE_RECONNECT_DELAY_MS")]
        reconnect_delay_ms: u64,
    },
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Server {
            host,
            control_port,
            auth_tokens,
            allowed_ports,
            connection_timeout_ms,
            ping_interval_ms,
            ping_timeout_ms,
            client_data_host,
        } => {
            let config = ServerConfig {
                host,
                control_port,
                auth_tokens: auth_tokens.into_iter().filter(|t| !t.is_empty()).collect(),
                allowed_ports: config::parse_port_rules(&allowed_ports)?,
                connection_timeout: Duration::from_millis(connection_timeout_ms),
                ping_interval: Duration::from_millis(ping_interval_ms),
                ping_timeout: Duration::from_millis(ping_timeout_ms),
                client_data_host,
            };
            let server = Server::new(config);

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("shutdown signal received");
                let _ = shutdown_tx.send(());
            });
            server.listen(shutdown_rx).await?;
        }
        Command::Client {
            server_host,
            server_port,
            tunnels,
            token,
            reconnect_attempts,
            reconnect_delay_ms,
        } => {
            let config = ClientConfig {
                server_host,
                server_port,
                auth_token: token,
                tunnels: config::parse_tunnel_specs(&tunnels)?,
                reconnect_attempts,
                reconnect_delay: Duration::from_millis(reconnect_delay_ms),
            };
            let client = Client::new(config);
            tokio::select! {
                result = client.run() => result?,
                _ = shutdown_signal() => info!("shutdown signal received"),
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level: tracing::Level = args
        .log_level
        .parse()
        .context("invalid log level, expected error|warn|info|debug|trace")?;
    tracing_subscriber::fmt().with_max_level(level).init();
    run(args.command).await
}
