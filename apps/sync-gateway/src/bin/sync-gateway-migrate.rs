use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use sync_gateway_service::{config::Config, db::GatewayDb, session::SessionVerifier, store};

/// Applies the sync gateway schema and bootstrap admin without serving.
#[derive(Parser, Debug)]
struct Args {
    /// Database URL. Defaults to DB_URL / DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    /// Skip creating or refreshing the bootstrap admin.
    #[arg(long)]
    skip_admin: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let url = args
        .database_url
        .or_else(|| config.db_url.clone())
        .ok_or_else(|| anyhow!("DB_URL or --database-url is required"))?;

    let db = Arc::new(
        GatewayDb::connect(&url, 1)
            .await
            .context("connect for migration")?,
    );
    db.ensure_schema().await?;
    tracing::info!("sync gateway schema applied");

    if args.skip_admin {
        return Ok(());
    }
    let Some(admin) = config.bootstrap_admin else {
        tracing::warn!("no bootstrap admin configured; skipping admin setup");
        return Ok(());
    };
    let sessions = SessionVerifier::new(
        store::postgres(db),
        &config.session_signing_key,
        config.session_ttl_seconds,
    );
    sessions.ensure_admin(&admin.username, &admin.password).await?;
    Ok(())
}
