use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use asyncify_runtime::{AsyncifyEngine, Command, ConfigDelegate, EngineConfig, logging, to_call_id};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "asyncify", about = "Run calls against an asyncify guest module")]
struct Cli {
    /// Engine config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Guest module (.wasm or .wat); overrides `module` from the config
    #[arg(long, global = true)]
    module: Option<PathBuf>,

    /// Skip the initialize call on the fresh instance
    #[arg(long, global = true)]
    no_initialize: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Issue one call and print the decoded payload
    Call {
        /// Call id, either wire form (`MUSIC_CALL_ID_GET_DETAILS`) or a
        /// path (`MusicCallID::getDetails`)
        id: String,

        /// Call arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Send with the gRPC content type and print the raw reply
        #[arg(long)]
        grpc: bool,
    },
    /// Print the guest's version answer
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(module) = cli.module {
        config.module = Some(module);
    }
    if cli.no_initialize {
        config.initialize = false;
    }

    let engine = AsyncifyEngine::new(config, Arc::new(ConfigDelegate))?;
    engine.start().await?;
    tracing::info!(state = engine.state().name(), "Engine started");

    let outcome = run(&engine, cli.command).await;
    engine.release().await;
    outcome
}

async fn run(engine: &AsyncifyEngine, command: Cmd) -> Result<()> {
    match command {
        Cmd::Call { id, args, grpc } => {
            let id = if id.contains([':', '.']) { to_call_id(&id) } else { id };
            let args: Map<String, Value> = serde_json::from_str(&args).context("--args must be a JSON object")?;
            let command = Command::new(id, args);
            tracing::debug!(call = %command.call.id, request_id = %command.request_id, "Calling guest");

            if grpc {
                let bytes = engine.call_grpc(command).await?;
                println!("{}", String::from_utf8_lossy(&bytes));
            } else {
                let payload: Value = engine.call_json(command).await?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
        }
        Cmd::Version => {
            let version = engine.engine_version().await?;
            println!("{}", serde_json::to_string_pretty(&version)?);
        }
    }
    Ok(())
}
