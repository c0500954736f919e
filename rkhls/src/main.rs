use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rkhls::config::{self, Config, ConfigFile, Overrides};
use rkhls::{cli_commands, daemon};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "rkhls")]
#[command(version, about = "On-demand HLS transcoding supervisor", long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "RKHLS_CONFIG")]
    config: Option<PathBuf>,

    /// Base directory holding the profiles
    #[arg(long, global = true, env = "RKHLS_BASEDIR")]
    basedir: Option<PathBuf>,

    /// Scratch root for the per-job output directories
    #[arg(long, global = true, env = "RKHLS_RAMDISK")]
    ramdisk: Option<PathBuf>,

    /// Profiles directory, defaults to <BASEDIR>/profiles
    #[arg(long, global = true, env = "RKHLS_PROFILES")]
    profiles: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Supervise transcoding jobs until SIGINT or SIGTERM")]
    Daemon,
    #[command(about = "Run one job in the foreground using ./rkhls run default rtsp://cam1")]
    Run {
        #[arg(value_name = "PROFILE")]
        profile: String,
        #[arg(value_name = "SOURCE")]
        source: String,
    },
    #[command(about = "List the available profiles")]
    Profiles,
}

fn init_tracing(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load(cli: &Cli) -> Result<Config> {
    let file = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ConfigFile::default(),
    };
    let overrides = Overrides {
        basedir: cli.basedir.clone(),
        ramdisk: cli.ramdisk.clone(),
        profiles: cli.profiles.clone(),
    };
    Ok(Config::resolve(file, overrides)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_json);
    let config = load(&cli)?;

    match cli.command {
        Commands::Daemon => daemon::run(config).await,
        Commands::Run { profile, source } => {
            cli_commands::run_job(config, &profile, &source).await
        }
        Commands::Profiles => cli_commands::list_profiles(&config),
    }
}
