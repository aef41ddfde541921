use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Batching log delivery pipeline", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read newline-delimited JSON logs and deliver them
    Run {
        /// Read logs from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,

        /// Channel to enqueue into when a record names none
        #[arg(long)]
        group: Option<String>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter configuration
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so stdout stays usable for `config init --stdout`
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = courier::config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run { input, group }) => {
            courier::cli::run::run(config_path, input, group).await?;
        }
        None => {
            courier::cli::run::run(config_path, None, None).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                courier::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}
