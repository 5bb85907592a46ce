use charge_ledger::cli::{self, Cli, Commands, DbCommands};
use charge_ledger::config::{Config, LogFormat};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cli::handle_serve(&config).await,
        Commands::Sweep => cli::handle_sweep(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
    }
}
