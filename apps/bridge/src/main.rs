use std::{path::PathBuf, sync::Arc};

use bridge_core::{
    homeserver::HomeserverIntentProvider, BridgeContext, MissingPortalBackend,
    MissingRemoteConnector, UserRegistry,
};
use clap::Parser;
use storage::Storage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_database_url};

#[derive(Debug, Parser)]
#[command(name = "bridge", about = "Puppeting bridge between WhatsApp and Matrix")]
struct Args {
    /// Path to the TOML config file. Defaults to ./bridge.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database_url = normalize_database_url(&settings.database_url);
    let storage = Arc::new(Storage::new(&database_url).await?);
    storage.health_check().await?;
    info!(database_url = %database_url, "bridge: storage ready");

    if settings.as_token.is_empty() {
        warn!("bridge: as_token is empty; homeserver requests will be rejected");
    }
    let intents = HomeserverIntentProvider::new(
        &settings.homeserver_url,
        settings.as_token.clone(),
        settings.bot_user_id(),
    )?;

    let ctx = BridgeContext {
        config: settings.bridge_config(),
        credentials: storage.clone(),
        messages: storage,
        connector: Arc::new(MissingRemoteConnector),
        intents: Arc::new(intents),
        portals: Arc::new(MissingPortalBackend),
    };
    let registry = UserRegistry::new(ctx);
    let started = registry.start_all().await?;
    info!(
        users = started,
        homeserver = %settings.homeserver_url,
        bot = %settings.bot_user_id(),
        "bridge: running"
    );

    tokio::signal::ctrl_c().await?;
    info!("bridge: shutting down");
    for session in registry.get_all().await? {
        session.disconnect().await;
    }
    Ok(())
}
