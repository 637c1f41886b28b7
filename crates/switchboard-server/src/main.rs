//! switchboard: real-time delivery gateway for support chat.
//!
//! Accepts WebSocket connections carrying a bearer credential, tracks presence,
//! enforces per-identity connection quotas and buffers messages for offline
//! recipients.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use switchboard_core::{create_token, generate_secret, Identity, Role};
use switchboard_server::auth::HmacTokenVerifier;
use switchboard_server::messages::InMemoryMessageStore;
use switchboard_server::store::{KvStore, MemoryStore, RedisStore};
use switchboard_server::{CliOverrides, Gateway, GatewayConfig, SwitchboardServer};
use tracing::{info, warn};

/// switchboard: real-time delivery gateway
#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about = "Real-time delivery gateway for support chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path
    #[arg(long, global = true, default_value = "~/.switchboard/config.toml")]
    config: String,

    /// Hex-encoded HMAC secret for bearer tokens
    #[arg(long, global = true, env = "SWITCHBOARD_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Redis URL for shared state (in-process store if omitted)
    #[arg(long, env = "SWITCHBOARD_REDIS_URL")]
    redis_url: Option<String>,

    /// Maximum concurrent connections per standard identity
    #[arg(long)]
    max_connections: Option<u32>,

    /// Heartbeat sweep interval in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Silence after which a connection is evicted, in milliseconds
    #[arg(long)]
    connection_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a bearer token for local testing
    MintToken {
        /// Identity id the token is issued for
        #[arg(long)]
        identity: String,

        /// standard | privileged (user | admin accepted)
        #[arg(long, default_value = "standard")]
        role: Role,

        /// Display name carried in the token
        #[arg(long)]
        name: Option<String>,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 86_400)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind.clone(),
        port: cli.port,
        secret: cli.secret.clone(),
        redis_url: cli.redis_url.clone(),
        max_connections: cli.max_connections,
        heartbeat_interval_ms: cli.heartbeat_interval_ms,
        connection_timeout_ms: cli.connection_timeout_ms,
    };
    let config = GatewayConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    match cli.command {
        Some(Command::MintToken {
            identity,
            role,
            name,
            ttl,
        }) => mint_token(&config, identity, role, name, ttl),
        None => serve(config).await,
    }
}

fn mint_token(
    config: &GatewayConfig,
    identity: String,
    role: Role,
    name: Option<String>,
    ttl: u64,
) -> anyhow::Result<()> {
    let Some(secret) = config.secret.as_deref() else {
        bail!("no secret configured: set auth.secret, --secret or SWITCHBOARD_SECRET");
    };
    let mut id = Identity::new(identity, role);
    if let Some(name) = name {
        id = id.with_display_name(name);
    }
    let token = create_token(secret, &id, ttl).context("failed to mint token")?;
    println!("{token}");
    Ok(())
}

async fn serve(mut config: GatewayConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        port = config.port,
        "starting switchboard"
    );

    let secret = match config.secret.take() {
        Some(s) => s,
        None => {
            warn!("no auth secret configured, generating an ephemeral one; tokens will not survive a restart");
            generate_secret().context("failed to generate secret")?
        }
    };

    let store: Arc<dyn KvStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisStore::connect(url).await.context("failed to connect to redis")?),
        None => {
            info!("no redis url configured, keeping shared state in-process");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway = Arc::new(Gateway::new(
        config,
        store,
        Arc::new(HmacTokenVerifier::new(secret)),
        Arc::new(InMemoryMessageStore::new()),
    ));

    SwitchboardServer::new(gateway)
        .run(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
