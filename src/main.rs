#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use noir_pipeline::config::{RetentionPolicy, ServiceConfig, load_config};
use noir_pipeline::engine::{JobKind, JobOptions, Profiler, SelectionRule};
use noir_pipeline::{run_cmd, serve_cmd};

#[derive(Parser, Debug)]
#[command(name = "noir-pipeline")]
#[command(about = "Compile, prove and generate verifiers for uploaded Noir projects", long_about = None)]
struct Cli {
    /// Enable verbose logging (or set NOIR_PIPELINE_LOG)
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every subcommand; each overrides the config file.
#[derive(Args, Debug)]
struct Overrides {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding per-job workspaces
    #[arg(long)]
    uploads_dir: Option<PathBuf>,
    /// Largest accepted upload in bytes
    #[arg(long)]
    max_upload_bytes: Option<usize>,
    /// Per-stage timeout in seconds (0 disables)
    #[arg(long)]
    stage_timeout_secs: Option<u64>,
    /// Keep workspaces after jobs: never, on-failure or always
    #[arg(long)]
    retain_workspaces: Option<RetentionPolicy>,
    /// Tie-break among matching files: listing-order, lexicographic or most-recent
    #[arg(long)]
    artifact_selection: Option<SelectionRule>,
    /// Path to the garaga binary
    #[arg(long)]
    garaga: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service and the log WebSocket
    Serve {
        #[command(flatten)]
        overrides: Overrides,
        /// Address for the HTTP API
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Dedicated address for the log WebSocket
        #[arg(long, conflicts_with = "no_ws_listener")]
        ws_listen: Option<SocketAddr>,
        /// Serve the log WebSocket on the main listener only
        #[arg(long)]
        no_ws_listener: bool,
    },

    /// Run one job locally and write its payload to a file
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// compile, compile-with-profiling, prove or prove-with-verifier
        #[arg(long)]
        kind: JobKind,
        /// Project archive (zip or tar.gz)
        #[arg(long)]
        archive: PathBuf,
        /// Output file, or a directory for archive payloads
        #[arg(long)]
        output: PathBuf,
        /// Request id (defaults to a fresh UUID)
        #[arg(long)]
        request_id: Option<String>,
        /// Profiling passes, comma separated
        #[arg(long, value_delimiter = ',')]
        profilers: Vec<Profiler>,
        /// Also generate the Starknet (Cairo) verifier
        #[arg(long)]
        starknet_verifier: bool,
    },
}

fn init_tracing(verbose: bool) {
    let env = std::env::var("NOIR_PIPELINE_LOG").unwrap_or_else(|_| {
        if verbose {
            "noir_pipeline=debug,tower_http=debug".to_string()
        } else {
            "noir_pipeline=info,tower_http=info".to_string()
        }
    });
    let _ = tracing_subscriber::fmt()
        .with_span_events(FmtSpan::ACTIVE)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_env_filter(EnvFilter::new(env))
        .try_init();
}

fn resolve_config(overrides: Overrides) -> anyhow::Result<ServiceConfig> {
    let mut config = match &overrides.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(dir) = overrides.uploads_dir {
        config.uploads_dir = dir;
    }
    if let Some(max) = overrides.max_upload_bytes {
        config.max_upload_bytes = max;
    }
    if let Some(secs) = overrides.stage_timeout_secs {
        config.stage_timeout_secs = secs;
    }
    if let Some(policy) = overrides.retain_workspaces {
        config.retain_workspaces = policy;
    }
    if let Some(rule) = overrides.artifact_selection {
        config.artifact_selection = rule;
    }
    if let Some(garaga) = overrides.garaga {
        config.toolchain.garaga = garaga;
    }
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { overrides, listen, ws_listen, no_ws_listener } => {
            let mut config = resolve_config(overrides)?;
            if let Some(addr) = listen {
                config.listen = addr;
            }
            if ws_listen.is_some() {
                config.ws_listen = ws_listen;
            }
            if no_ws_listener {
                config.ws_listen = None;
            }
            serve_cmd::run(config).context("service stopped with an error")
        }
        Commands::Run { overrides, kind, archive, output, request_id, profilers, starknet_verifier } => {
            let config = resolve_config(overrides)?;
            let options = JobOptions { profilers, cairo_verifier: starknet_verifier };
            run_cmd::run(config, kind, archive, request_id, options, output)
                .with_context(|| format!("{kind} job failed"))
        }
    }
}

fn main() {
    color_eyre::install().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
