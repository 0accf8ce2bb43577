use clap::{Parser, Subcommand};
use netshaper::config::{Config, ConfigSource};
use netshaper::{client, logging, server, transport::quic::generate_self_signed};
use std::path::PathBuf;
use tracing::warn;

/// netshaper pluggable transport
#[derive(Parser)]
#[command(name = "netshaper")]
#[command(about = "A QUIC pluggable transport for Tor", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "netshaper.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge side (ServerTransportPlugin)
    Server {
        /// Directory holding cert.pem and key.pem
        #[arg(long)]
        cert_path: Option<PathBuf>,
    },
    /// Run the client side (ClientTransportPlugin)
    Client,
    /// Write a self-signed certificate pair for the bridge
    GenCert {
        /// Directory to write cert.pem and key.pem into
        #[arg(long)]
        cert_path: Option<PathBuf>,

        /// Subject alternative names for the certificate
        #[arg(long = "san", default_values_t = vec!["localhost".to_string()])]
        subject_alt_names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config first to get logging settings
    let (config, source) = Config::load(&cli.config).await?;

    // Logs go to stderr: stdout belongs to the managed transport protocol
    logging::init_logging(
        &config.log_level,
        &config.log_theme_path,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )
    .await?;
    if source == ConfigSource::Defaults {
        warn!(
            "Configuration file not found at '{}', using default configuration",
            cli.config.display()
        );
    }

    match cli.command {
        Commands::Server { cert_path } => {
            server::run(config, cert_path.as_deref()).await?;
        }
        Commands::Client => {
            client::run(config).await?;
        }
        Commands::GenCert {
            cert_path,
            subject_alt_names,
        } => {
            let dir = cert_path.unwrap_or_else(|| PathBuf::from(&config.tls.cert_dir));
            let generated = generate_self_signed(subject_alt_names)?;
            let (cert_file, key_file) = generated.write_to(&dir)?;
            eprintln!("Wrote {} and {}", cert_file.display(), key_file.display());
        }
    }

    Ok(())
}
