use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter},
};

#[derive(Parser)]
#[command(name = "watchroomd", about = "watchroomd — synchronized room server")]
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
    /// Start the room server (default if no subcommand is given).
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Load and validate the configuration file without starting the server.
    Doctor,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "watchroomd starting");

    match cli.command.unwrap_or(Commands::Serve { bind: "0.0.0.0".to_string() }) {
        Commands::Serve { bind } => {
            let config = watchroom_config::discover_and_load();
            watchroom_gateway::server::start_gateway(&bind, config).await
        },
        Commands::Doctor => {
            let config = watchroom_config::discover_and_load();
            config.validate()?;
            println!("config ok: database={:?} port={}", config.database, config.port);
            Ok(())
        },
    }
}
