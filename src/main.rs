//! Handler Runtime CLI entry point.
//!
//! Runs a handler source file against a JSON request for local development
//! and debugging. The embedding host normally reaches the engine through
//! the FFI boundary; this binary exercises the same engine in-process.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handler_runtime_common::config_file::ConfigFile;
use handler_runtime_core::ExecutionRequest;
use handler_runtime_ffi::wire::{WireRequest, WireResult};
use handler_runtime_host::create_runtime;

#[derive(Debug, Parser)]
#[command(
    name = "handler-runtime",
    about = "Capability-secured execution engine for untrusted handler scripts",
    version
)]
struct Cli {
    /// Handler source file to execute.
    handler: PathBuf,

    /// JSON file with the execution request (state, args, capabilities,
    /// extensions, timeout). Defaults to an empty request with no
    /// capabilities.
    #[arg(long)]
    request: Option<PathBuf>,

    /// TOML configuration file; may list handlers to warm into the
    /// bytecode cache.
    #[arg(long, env = "HANDLER_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Compile only: report bytecode size instead of executing.
    #[arg(long)]
    precompile: bool,

    /// Print inferred capabilities for the handler and exit (advisory).
    #[arg(long)]
    infer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,handler_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let source = std::fs::read_to_string(&cli.handler)
        .with_context(|| format!("failed to read handler '{}'", cli.handler.display()))?;

    if cli.infer {
        for capability in handler_runtime_host::infer_capabilities(&source) {
            println!("{capability}");
        }
        return Ok(());
    }

    // Load configuration
    let config_file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => ConfigFile::default(),
    };

    info!("Starting Handler Runtime");
    let runtime = create_runtime(config_file.runtime)?;

    // Warm the bytecode cache with configured handlers.
    for entry in &config_file.handlers {
        let warm_source = std::fs::read_to_string(&entry.path)
            .with_context(|| format!("failed to read handler '{}' ({})", entry.id, entry.path))?;
        runtime.precompile(&warm_source)?;
        info!(handler_id = %entry.id, "Handler precompiled");
    }

    if cli.precompile {
        let bytecode = runtime.precompile(&source)?;
        println!("compiled {} bytes of bytecode", bytecode.len());
        runtime.shutdown();
        return Ok(());
    }

    let request = match &cli.request {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read request '{}'", path.display()))?;
            serde_json::from_str::<WireRequest>(&raw)
                .context("request file is not a valid execution request")?
                .into_request()
        }
        None => ExecutionRequest::new(
            cli.handler
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("handler"),
        ),
    };

    let result = runtime.execute(&source, request).await?;
    println!("{}", serde_json::to_string_pretty(&WireResult::from(result))?);

    runtime.shutdown();
    Ok(())
}
