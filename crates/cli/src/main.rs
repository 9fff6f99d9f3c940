mod config_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "tradeclaw", about = "TradeClaw: trading assistant gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./tradeclaw.toml, then ~/.config/tradeclaw/).
    #[arg(long, short, global = true, env = "TRADECLAW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `gateway.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `gateway.port`.
        #[arg(long)]
        port: Option<u16>,
        /// Shared token accepted in addition to the configured ones.
        #[arg(long, env = "TRADECLAW_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
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

    info!(version = env!("CARGO_PKG_VERSION"), "tradeclaw starting");

    match cli.command {
        Commands::Gateway { bind, port, token } => {
            let mut config = tradeclaw_config::discover_and_load(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tradeclaw_gateway::start_gateway(config, token).await
        },
        Commands::Config { action } => config_commands::handle_config(action, cli.config.as_deref()),
    }
}
