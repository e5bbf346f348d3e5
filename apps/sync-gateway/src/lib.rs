#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    db::GatewayDb,
    server::{AppState, build_router},
    store::GatewayStore,
};

pub mod audit;
pub mod config;
pub mod credentials;
pub mod db;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;
pub mod types;

/// Opens the configured store: PostgreSQL when a database URL is set (schema
/// applied on connect), in-memory otherwise.
pub async fn open_store(config: &Config) -> Result<(Arc<dyn GatewayStore>, &'static str)> {
    match config.db_url.as_deref() {
        Some(url) => {
            let db = GatewayDb::connect(url, config.db_connections).await?;
            db.ensure_schema().await?;
            Ok((store::postgres(Arc::new(db)), "postgres"))
        }
        None => Ok((store::memory(), "memory")),
    }
}

pub async fn build_gateway_state(config: Config) -> Result<AppState> {
    if config.uses_default_signing_key_with_database() {
        tracing::warn!(
            "SYNC_GATEWAY_SESSION_SIGNING_KEY is unset; admin sessions are signed with the development key"
        );
    }
    let (store, driver) = open_store(&config).await?;
    let bootstrap_admin = config.bootstrap_admin.clone();
    let state = AppState::new(config, store, driver);
    match bootstrap_admin {
        Some(admin) => {
            state
                .sessions()
                .ensure_admin(&admin.username, &admin.password)
                .await?;
        }
        None => {
            tracing::warn!("no bootstrap admin configured; admin routes are unreachable until one exists");
        }
    }
    Ok(state)
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_gateway_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        store = if config.db_url.is_some() { "postgres" } else { "memory" },
        "sync gateway listening"
    );
    let app = build_app(config).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
