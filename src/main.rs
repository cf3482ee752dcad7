//! revdial - reverse tunnels over WebSocket
//!
//! `revdial server` accepts agents and lets the local network reach back into
//! theirs; `revdial agent` connects out to a server and dials on its behalf.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use revdial_client::{AllowList, CancellationToken, Connector, PeerLink, ReconnectConfig};
use revdial_connection::SessionConfig;
use revdial_control::{
    ForwardConfig, ForwardServer, HeaderAuthorizer, SessionRegistry, TunnelServer, CONNECT_PATH,
    TUNNEL_ID_HEADER, TUNNEL_TOKEN_HEADER,
};
use revdial_transport_websocket::{HeaderMap, HeaderValue};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{load_config_file, resolve_token, ConfigFile};

const DEFAULT_BIND: &str = "0.0.0.0:8123";

#[derive(Parser, Debug)]
#[command(name = "revdial")]
#[command(about = "Reverse tunnels: dial into remote networks over WebSocket")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, global = true, default_value = "info", env = "REVDIAL_LOG")]
    log_level: String,

    /// Shortcut for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log every tunnel frame (very noisy)
    #[arg(long, global = true)]
    trace_frames: bool,

    /// YAML configuration file; flags override its values
    #[arg(short, long, global = true, env = "REVDIAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agents and peer servers
    Server(ServerArgs),
    /// Connect to a server and dial on its behalf
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to accept tunnels on
    #[arg(long, env = "REVDIAL_BIND")]
    bind: Option<String>,

    /// Name used when linking to peers (defaults to a random id)
    #[arg(long, env = "REVDIAL_SERVER_ID")]
    id: Option<String>,

    /// Shared secret required from agents and peers
    #[arg(long, env = "REVDIAL_TOKEN")]
    token: Option<String>,

    /// Peer server URL to federate with (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Forward a local port: LISTEN=clientKey/network/address (repeatable)
    #[arg(long = "forward")]
    forwards: Vec<String>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Server URL, e.g. ws://tunnel.example.com:8123/connect
    #[arg(long, env = "REVDIAL_SERVER")]
    server: Option<String>,

    /// Client key to register as (defaults to a random id)
    #[arg(long, env = "REVDIAL_AGENT_ID")]
    id: Option<String>,

    #[arg(long, env = "REVDIAL_TOKEN")]
    token: Option<String>,

    /// Network the server may dial, e.g. tcp (repeatable; default any)
    #[arg(long = "allow-network")]
    allow_networks: Vec<String>,

    /// Address the server may dial; a trailing * matches a prefix (repeatable; default any)
    #[arg(long = "allow-address")]
    allow_addresses: Vec<String>,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    retry_delay: Option<u64>,
}

fn setup_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn random_id(prefix: &str) -> String {
    let id = format!("{}-{}", prefix, uuid::Uuid::new_v4());
    info!("Auto-generated id: {}", id);
    id
}

fn session_config(cli_trace_frames: bool, file: &ConfigFile) -> SessionConfig {
    let mut config = SessionConfig::default().with_verbose(cli_trace_frames || file.session.trace_frames);
    if let Some(max_buffer) = file.session.max_buffer {
        config.max_buffer = max_buffer;
    }
    config
}

/// Parse `LISTEN=clientKey/network/address`
fn parse_forward(arg: &str) -> Result<ForwardConfig> {
    let (listen, target) = arg
        .split_once('=')
        .with_context(|| format!("Invalid forward {:?}, expected LISTEN=TARGET", arg))?;
    build_forward(listen, target)
}

fn build_forward(listen: &str, target: &str) -> Result<ForwardConfig> {
    let bind_addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid forward listen address: {}", listen))?;
    Ok(ForwardConfig {
        bind_addr,
        target: target.parse()?,
        dial_timeout: None,
    })
}

async fn run_server(args: ServerArgs, file: ConfigFile, session: SessionConfig) -> Result<()> {
    let server_file = file.server;
    let bind = args
        .bind
        .or(server_file.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let id = args.id.or(server_file.id).unwrap_or_else(|| random_id("server"));
    let token = match args.token {
        Some(token) => Some(token),
        None => resolve_token(server_file.token, server_file.token_env.as_deref())?,
    };
    let peers = if args.peers.is_empty() {
        server_file.peers
    } else {
        args.peers
    };
    let forwards = if args.forwards.is_empty() {
        server_file
            .forwards
            .iter()
            .map(|f| build_forward(&f.listen, &f.target))
            .collect::<Result<Vec<_>>>()?
    } else {
        args.forwards
            .iter()
            .map(|f| parse_forward(f))
            .collect::<Result<Vec<_>>>()?
    };

    if token.is_none() {
        warn!("No token configured: any client can connect");
    }

    let registry = Arc::new(SessionRegistry::new(session.clone()));
    let server = TunnelServer::new(
        registry.clone(),
        Arc::new(HeaderAuthorizer::new(token.clone())),
    );

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!(
        "Tunnel server {} listening on ws://{}{}",
        id,
        listener.local_addr()?,
        CONNECT_PATH
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for peer in peers {
        let link = PeerLink::new(peer, id.clone(), registry.clone())
            .with_token(token.clone())
            .with_session_config(session.clone());
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = link.run(&cancel).await {
                error!("Peer link stopped: {}", e);
            }
        });
    }

    for forward in forwards {
        let forward = ForwardServer::new(forward, registry.clone());
        tasks.spawn(async move {
            if let Err(e) = forward.start().await {
                error!("Port forward stopped: {}", e);
            }
        });
    }

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
            cancel.cancel();
        }
    };

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Tunnel server failed")?;

    cancel.cancel();
    tasks.shutdown().await;
    info!("Tunnel server stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs, file: ConfigFile, session: SessionConfig) -> Result<()> {
    let agent_file = file.agent;
    let server = args
        .server
        .or(agent_file.server)
        .context("No server URL: pass --server or set agent.server in the config file")?;
    let id = args.id.or(agent_file.id).unwrap_or_else(|| random_id("agent"));
    let token = match args.token {
        Some(token) => Some(token),
        None => resolve_token(agent_file.token, agent_file.token_env.as_deref())?,
    };
    let networks = if args.allow_networks.is_empty() {
        agent_file.allow_networks
    } else {
        args.allow_networks
    };
    let addresses = if args.allow_addresses.is_empty() {
        agent_file.allow_addresses
    } else {
        args.allow_addresses
    };
    let retry_delay = args
        .retry_delay
        .or(agent_file.retry_delay_secs)
        .map(Duration::from_secs)
        .unwrap_or(revdial_client::DEFAULT_RETRY_DELAY);

    let mut headers = HeaderMap::new();
    headers.insert(
        TUNNEL_ID_HEADER,
        HeaderValue::from_str(&id).context("Invalid agent id")?,
    );
    if let Some(token) = &token {
        headers.insert(
            TUNNEL_TOKEN_HEADER,
            HeaderValue::from_str(token).context("Invalid token")?,
        );
    }

    info!("Agent {} connecting to {}", id, server);
    if networks.is_empty() && addresses.is_empty() {
        warn!("No allow-list configured: the server may dial any address");
    }

    let connector = Connector::new(
        server,
        headers,
        AllowList::new(networks, addresses).into_authorizer(),
    )
    .with_session_config(session)
    .with_reconnect(ReconnectConfig::fixed(retry_delay));

    let cancel = CancellationToken::new();
    let connect_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { connector.connect_forever(&cancel).await })
    };
    tokio::pin!(connect_task);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
            (&mut connect_task).await.context("Connection task panicked")??;
        }
        result = &mut connect_task => {
            result.context("Connection task panicked")??;
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.verbose)?;

    info!(
        "revdial {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };
    let session = session_config(cli.trace_frames, &file);

    match cli.command {
        Commands::Server(args) => run_server(args, file, session).await,
        Commands::Agent(args) => run_agent(args, file, session).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward() {
        let forward = parse_forward("127.0.0.1:2222=agent-1/tcp/127.0.0.1:22").unwrap();
        assert_eq!(forward.bind_addr, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(forward.target.client_key, "agent-1");
        assert_eq!(forward.target.address, "127.0.0.1:22");

        assert!(parse_forward("127.0.0.1:2222").is_err());
        assert!(parse_forward("nowhere=agent-1/tcp/x:1").is_err());
        assert!(parse_forward("127.0.0.1:2222=agent-1").is_err());
    }

    #[test]
    fn test_cli_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "revdial",
            "server",
            "--peer",
            "ws://b/connect",
            "--peer",
            "ws://c/connect",
            "--forward",
            "127.0.0.1:1=a/tcp/x:1",
        ])
        .unwrap();
        match cli.command {
            Commands::Server(args) => {
                assert_eq!(args.peers.len(), 2);
                assert_eq!(args.forwards.len(), 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_session_config_from_file() {
        let file = config::parse_config("session:\n  max_buffer: 4096\n").unwrap();
        let session = session_config(true, &file);
        assert!(session.verbose);
        assert_eq!(session.max_buffer, 4096);
    }
}
