use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use uploadbench::config::{LogFormat, UploadConfig};
use uploadbench::upload::report::format_summary;
use uploadbench::upload::TimeoutPolicy;

#[derive(Parser)]
#[command(
    name = "uploadbench",
    about = "Multi-connection upload throughput benchmark",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $UPLOADBENCH_CONFIG, then /etc/uploadbench/uploadbench.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an upload benchmark against a server
    Upload {
        /// Server address (host:port)
        #[arg(long)]
        server: Option<String>,

        /// Per-connection connect/stall deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Number of concurrent connections
        #[arg(long)]
        threads: Option<usize>,

        /// What the per-connection deadline bounds
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    ConnectAndStall,
    Lifetime,
}

impl From<PolicyArg> for TimeoutPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::ConnectAndStall => TimeoutPolicy::ConnectAndStall,
            PolicyArg::Lifetime => TimeoutPolicy::Lifetime,
        }
    }
}

fn init_tracing(config: &UploadConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => UploadConfig::load(path)?,
        None => UploadConfig::load_or_default(),
    };

    init_tracing(&config);

    match cli.command {
        Commands::Upload {
            server,
            timeout_ms,
            threads,
            policy,
            json,
        } => {
            if let Some(server) = server {
                config.upload.server = Some(server);
            }
            if let Some(timeout_ms) = timeout_ms {
                config.upload.timeout_ms = timeout_ms;
            }
            if let Some(threads) = threads {
                config.upload.threads = threads;
            }
            if let Some(policy) = policy {
                config.upload.timeout_policy = policy.into();
            }

            let server = config
                .upload
                .server
                .clone()
                .context("no server given (use --server host:port or set upload.server)")?;

            tracing::info!(
                %server,
                threads = config.upload.threads,
                timeout_ms = config.upload.timeout_ms,
                "Running upload benchmark"
            );

            let report = uploadbench::run_upload(
                &server,
                config.upload.connection_settings(),
                config.upload.threads,
            )
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", format_summary(&report));
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
