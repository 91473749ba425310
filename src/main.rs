use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod server;
mod version;

use server::settings::{Settings, SettingsOverrides};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Force colored log output
    #[arg(long, global = true)]
    colors: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        #[command(flatten)]
        settings: SettingsOverrides,
    },
    /// Check configuration for errors and unknown options
    CheckConfig {
        #[command(flatten)]
        settings: SettingsOverrides,
    },
    /// Print version and build information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_ansi(cli.colors || std::io::stdout().is_terminal()))
        .init();

    match cli.command {
        Commands::Serve { settings } => {
            tracing::info!("starting {}", version::VersionInfo::current());
            let settings = Settings::new(&settings)?;
            server::run_server(settings).await
        }
        Commands::CheckConfig { settings } => match Settings::new(&settings) {
            Ok(settings) => {
                println!("✓ Configuration is valid");
                println!("  docker endpoint:   {}", settings.docker.endpoint);
                println!("  docker api:        {}", settings.docker.api_version);
                println!("  opt-in label:      {}", settings.policy.label);
                println!(
                    "  credentials file:  {}",
                    settings.credentials_path().display()
                );
                if settings.auth.key.is_empty() {
                    println!("  ! no shared secret configured, authentication is disabled");
                }
                Ok(())
            }
            Err(e) => {
                eprintln!("✗ Configuration error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Version => {
            println!("{}", version::VersionInfo::current());
            Ok(())
        }
    }
}
