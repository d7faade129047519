use {
    clap::{Parser, Subcommand},
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "arachne", about = "Arachne — multi-tenant Discord ↔ MCP bridge")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge (default when no subcommand is provided).
    Gateway,
    /// Database management.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Open the database and apply pending schema migrations.
    Migrate,
    /// Delete the database file. Destroys all entities and credentials.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = arachne_config::Config::from_env()?;
    match cli.command.unwrap_or(Commands::Gateway) {
        Commands::Gateway => {
            arachne_gateway::run(config).await?;
        },
        Commands::Db { action } => match action {
            DbAction::Migrate => {
                std::fs::create_dir_all(&config.data_dir)?;
                arachne_registry::Registry::open(&config.db_path()).await?;
                info!(path = %config.db_path().display(), "database is up to date");
            },
            DbAction::Reset { yes } => {
                if !yes {
                    anyhow::bail!("refusing to reset without --yes");
                }
                let path = config.db_path();
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    info!(path = %path.display(), "database removed");
                } else {
                    info!(path = %path.display(), "no database to remove");
                }
            },
        },
    }
    Ok(())
}
