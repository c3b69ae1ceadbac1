//! exif-proxy - Stay-open process proxy for the exiftool metadata CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use exif_proxy::config::{ConfigError, ConfigLoader, ProxyConfig};
use exif_proxy::display;
use exif_proxy::metadata::{ExifTool, MetadataError};
use exif_proxy::process::ProcessRegistry;

#[derive(Parser)]
#[command(
    name = "exif-proxy",
    about = "Read and write image metadata through a resident exiftool",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file to use instead of the default search paths.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the exiftool binary.
    #[arg(long, global = true)]
    tool: Option<String>,

    /// Start a new exiftool for every call.
    #[arg(long, global = true)]
    single_use: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the exiftool version.
    Version,
    /// Read tags from a file.
    Read {
        /// Image file.
        file: PathBuf,
        /// Tag to read; repeat for more. Reads all tags when omitted.
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Print tags as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Write tags to a file in place.
    Write {
        /// Image file.
        file: PathBuf,
        /// TAG=VALUE to set; repeat for more.
        #[arg(short, long = "set", value_parser = parse_assignment, required = true)]
        set: Vec<(String, String)>,
    },
    /// Pass arguments straight to exiftool.
    Raw {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(tag, value)| (tag.trim().to_string(), value.to_string()))
        .filter(|(tag, _)| !tag.is_empty())
        .ok_or_else(|| format!("expected TAG=VALUE, got {s:?}"))
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<ProxyConfig, ConfigError> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?.with_tool_override(cli.tool.clone());
    if cli.single_use {
        config.keep_alive = false;
    }
    Ok(config)
}

async fn run(tool: &ExifTool, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Version => println!("{}", tool.version().await?),
        Commands::Read { file, tags, json } => {
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            let values = tool.read_tags(&file, &tags).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else {
                display::print_tags(&values);
            }
        }
        Commands::Write { file, set } => {
            let tags: Vec<(&str, &str)> = set
                .iter()
                .map(|(tag, value)| (tag.as_str(), value.as_str()))
                .collect();
            let outcome = tool.write_tags(&file, &tags).await?;
            display::print_write_outcome(&outcome);
        }
        Commands::Raw { args } => display::print_batch(&tool.execute_raw(&args).await?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        tool = %config.tool_path,
        mode = ?config.mode(),
        run_timeout = ?config.run_timeout(),
        "Starting exif-proxy"
    );

    let tool = ExifTool::from_config(&config);
    let result = tokio::select! {
        result = run(&tool, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted");
            Ok(())
        }
    };

    tool.shutdown().await;
    ProcessRegistry::global().close_all().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            display::print_error(&e);
            ExitCode::FAILURE
        }
    }
}
