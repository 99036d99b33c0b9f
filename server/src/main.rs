use clap::Parser;
use log::{error, info};
use server::clock::SystemClock;
use server::config::{ServerConfig, AUTH_SECRET_ENV};
use server::identity::TokenVerifier;
use server::network::{Server, ServerMessage};
use server::store::{EntityStore, InMemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,
    /// Maximum number of simultaneous connections
    #[clap(short, long, default_value = "256")]
    max_clients: usize,
    /// Seconds of silence before a session is evicted
    #[clap(long, default_value = "120")]
    idle_timeout: u64,
    /// Secret used to verify identity tokens
    #[clap(long, env = AUTH_SECRET_ENV, hide_env_values = true)]
    auth_secret: Option<String>,
    /// JSON fixture seeding the item catalog and inventories
    #[clap(long)]
    store_fixture: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            tick_rate: self.tick_rate,
            max_clients: self.max_clients,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            auth_secret: self.auth_secret.unwrap_or_default(),
            store_fixture: self.store_fixture,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    // Refuse to start before touching the network or the store
    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e.into());
    }

    let identity = Arc::new(TokenVerifier::new(config.auth_secret.clone())?);
    let store: Arc<dyn EntityStore> = match &config.store_fixture {
        Some(path) => Arc::new(InMemoryStore::load(path)?),
        None => {
            info!("No store fixture given, starting with an empty store");
            Arc::new(InMemoryStore::default())
        }
    };

    let mut server = Server::new(config, identity, store, Arc::new(SystemClock::new())).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = shutdown.send(ServerMessage::Shutdown) {
                error!("Failed to signal shutdown: {}", e);
            }
        }
    });

    server.run().await?;
    Ok(())
}
