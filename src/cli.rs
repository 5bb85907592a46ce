use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::adapters::{InMemoryLedgerStore, PostgresLedgerStore};
use crate::config::Config;
use crate::domain::User;
use crate::gateway::HttpGatewayClient;
use crate::middleware::RequestLogging;
use crate::ports::{GatewayClient, LedgerError, LedgerStore};
use crate::services::{run_sweeper, ReconciliationSweep};
use crate::{create_app, AppState};

const MIGRATIONS_DIR: &str = "./migrations";
const MAX_DB_CONNECTIONS: u32 = 10;

#[derive(Parser)]
#[command(name = "charge-ledger")]
#[command(about = "Charge orchestration and webhook reconciliation over a payment gateway", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Compare gateway charge history with the ledger once and print the report
    Sweep,

    /// Validate and print the configuration with secrets masked
    Config,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

/// Postgres when `DATABASE_URL` is set, process memory otherwise.
pub async fn build_ledger(config: &Config) -> anyhow::Result<Arc<dyn LedgerStore>> {
    let ledger: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresLedgerStore::connect(url, MAX_DB_CONNECTIONS)
                .await
                .context("failed to connect to the ledger database")?;
            store.migrate(Path::new(MIGRATIONS_DIR)).await?;
            tracing::info!("Using Postgres ledger");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, ledger is held in memory only");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    for user_id in &config.seed_users {
        match ledger.get_user(user_id).await {
            Ok(_) => {}
            Err(LedgerError::NotFound(_)) => {
                ledger.update_user(User::new(user_id.clone())).await?;
                tracing::info!(user_id = %user_id, "Seeded user");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ledger)
}

pub async fn handle_serve(config: &Config) -> anyhow::Result<()> {
    let ledger = build_ledger(config).await?;
    let gateway: Arc<dyn GatewayClient> = Arc::new(HttpGatewayClient::new(config.gateway_settings()));
    tracing::info!("Gateway client initialized with URL: {}", config.gateway_api_url);

    if let Some(every) = config.sweep_interval {
        let sweep = Arc::new(ReconciliationSweep::new(ledger.clone(), gateway.clone()));
        tokio::spawn(run_sweeper(sweep, every));
    }

    let state = AppState::new(ledger, gateway, config.orchestrator(), config.webhook_secret.clone())
        .with_request_logging(RequestLogging {
            log_bodies: config.log_request_body,
        });
    let app = create_app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub async fn handle_sweep(config: &Config) -> anyhow::Result<()> {
    if config.database_url.is_none() {
        anyhow::bail!("DATABASE_URL is required to sweep: the in-memory ledger does not outlive this command");
    }
    let ledger = build_ledger(config).await?;
    let gateway: Arc<dyn GatewayClient> = Arc::new(HttpGatewayClient::new(config.gateway_settings()));

    let report = ReconciliationSweep::new(ledger, gateway).run().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.unresolved.is_empty() {
        anyhow::bail!("{} charge(s) could not be reconciled", report.unresolved.len());
    }
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required to run migrations")?;

    let store = PostgresLedgerStore::connect(url, 1).await?;
    tracing::info!("Running database migrations...");
    store.migrate(Path::new(MIGRATIONS_DIR)).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    config.validate()?;

    println!("{:#?}", config.masked());
    println!("✓ Configuration is valid");
    Ok(())
}
