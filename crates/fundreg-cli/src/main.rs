use anyhow::Result;
use clap::{Parser, Subcommand};
use fundreg_storage::PgStore;
use fundreg_web::AppConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fundreg")]
#[command(about = "Fund registry API server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run migrations and serve the JSON API.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fundreg=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            fundreg_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = AppConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations complete");
        }
    }

    Ok(())
}
