//! Web API binary.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use stevedore_metadata::{MetadataStore, PostgresStore};
use stevedore_server::{create_router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// SP-facing web API for the deal broker.
#[derive(Parser, Debug)]
#[command(name = "stevedore-webapi")]
#[command(version, about, long_about = None)]
struct Args {
    /// PostgreSQL connection string.
    #[arg(long = "pg-connstring", env = "STEVEDORE_PG_CONNSTRING")]
    pg_connstring: String,

    /// Listen address.
    #[arg(
        long = "webapi-listen-address",
        env = "STEVEDORE_WEBAPI_LISTEN_ADDRESS",
        default_value = "localhost:8080"
    )]
    listen_address: String,

    /// Database pool size.
    #[arg(long, default_value_t = 16)]
    db_connections: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,sqlx=warn,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    let store = PostgresStore::connect(&args.pg_connstring, args.db_connections)
        .await
        .context("connecting to the metadata store")?;
    let store: Arc<dyn MetadataStore> = Arc::new(store);

    let app = create_router(AppState::new(store));

    let listener = tokio::net::TcpListener::bind(&args.listen_address)
        .await
        .with_context(|| format!("binding {}", args.listen_address))?;
    tracing::info!(address = %args.listen_address, "webapi listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serving the web api")?;

    Ok(())
}
