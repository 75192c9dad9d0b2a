//! Cron binary: short-lived background jobs driven by an external
//! scheduler. Every subcommand exits non-zero on failure so the scheduler
//! can alert and retry.

mod ctx;
mod piece_poll;
mod poll_providers;
mod propose_pending;
mod sign_pending;
mod track_deals;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stevedore-cron")]
#[command(about = "Background jobs for the stevedore deal broker")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// PostgreSQL connection string.
    #[arg(long = "pg-connstring", env = "STEVEDORE_PG_CONNSTRING")]
    pg_connstring: String,

    /// Lotus daemon API endpoint.
    #[arg(
        long = "lotus-api",
        env = "STEVEDORE_LOTUS_API",
        default_value = "https://api.chain.love"
    )]
    lotus_api: String,

    /// Epochs to stay behind chain head, dodging reorg churn.
    #[arg(
        long = "lotus-lookback-epochs",
        default_value_t = stevedore_core::DEFAULT_LOOKBACK_EPOCHS
    )]
    lotus_lookback_epochs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh chain-attested provider info.
    PollProviders,

    /// Track state of on-chain deals related to known PieceCIDs.
    TrackDeals {
        /// Endpoint used for bulk state reads; may point at a beefier node.
        #[arg(long = "lotus-api-blockstore", default_value = "http://localhost:1234")]
        lotus_api_blockstore: String,

        /// Client addresses whose datacap is forced to zero (operational
        /// overlay; repeatable).
        #[arg(long = "zero-datacap-client")]
        zero_datacap_clients: Vec<String>,
    },

    /// Sign pending deal proposals.
    SignPending {
        /// Directory holding one key file per robust client address.
        #[arg(long = "keystore-dir", env = "STEVEDORE_KEYSTORE_DIR")]
        keystore_dir: Option<String>,
    },

    /// Propose pending reservations to providers.
    ProposePending {
        /// Seconds to wait between proposals to the same SP.
        #[arg(long = "sleep-between-proposals", default_value_t = 3)]
        sleep_between_proposals: u64,

        /// Seconds before aborting a specific proposal.
        #[arg(long = "proposal-timeout", default_value_t = 90)]
        proposal_timeout: u64,

        /// Seconds proposals for a specific SP may take in total.
        #[arg(long = "per-sp-timeout", default_value_t = 270)]
        per_sp_timeout: u64,
    },

    /// Query newly available pieces from configured tenants.
    BulkPiecePoll {
        /// Only query pieces posted in the last N days.
        #[arg(long = "skip-entries-aged-days", default_value_t = 2)]
        skip_entries_aged_days: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::PollProviders => {
            let ctx = ctx::AppCtx::init(&cli.common, None).await?;
            poll_providers::run(&ctx).await
        }
        Commands::TrackDeals {
            lotus_api_blockstore,
            zero_datacap_clients,
        } => {
            let ctx = ctx::AppCtx::init(&cli.common, Some(&lotus_api_blockstore)).await?;
            track_deals::run(&ctx, &zero_datacap_clients).await
        }
        Commands::SignPending { keystore_dir } => {
            let ctx = ctx::AppCtx::init(&cli.common, None).await?;
            sign_pending::run(&ctx, keystore_dir.as_deref()).await
        }
        Commands::ProposePending {
            sleep_between_proposals,
            proposal_timeout,
            per_sp_timeout,
        } => {
            let ctx = ctx::AppCtx::init(&cli.common, None).await?;
            propose_pending::run(
                &ctx,
                propose_pending::DeliveryConfig {
                    sleep_between_proposals: std::time::Duration::from_secs(
                        sleep_between_proposals,
                    ),
                    proposal_timeout: std::time::Duration::from_secs(proposal_timeout),
                    per_sp_timeout: std::time::Duration::from_secs(per_sp_timeout),
                },
            )
            .await
        }
        Commands::BulkPiecePoll {
            skip_entries_aged_days,
        } => {
            let ctx = ctx::AppCtx::init(&cli.common, None).await?;
            piece_poll::run(&ctx, skip_entries_aged_days).await
        }
    }
}
