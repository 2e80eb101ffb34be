//! Unity MCP bridge CLI.
//!
//! Runs the bridge standalone (`serve`) and offers small diagnostics for the
//! stdio protocol and port registry. See the `unity_mcp_bridge` library for
//! the core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use unity_mcp_bridge::{
    constants::DISCOVERY_PROBE_TIMEOUT, main_thread_queue, port, BridgeClient, CommandRouter, Config,
    PortRegistry, TransportManager, TransportMode,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "unity-mcp-bridge")]
#[command(version)]
#[command(about = "Transport bridge between an MCP client and the Unity Editor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured transports and serve until interrupted
    Serve {
        /// Transport mode (overrides config and UNITY_MCP_MODE)
        #[arg(long, value_enum)]
        mode: Option<TransportMode>,
        /// Stdio bridge port (overrides config and UNITY_MCP_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Ping a running stdio bridge
    Ping {
        /// Port to ping; discovered from the registry when omitted
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the port an out-of-process client would connect to
    Discover,
    /// Check whether a port is free for a new bridge
    PortCheck {
        /// Port to check
        port: u16,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file (env overrides included)
        #[arg(long)]
        save: bool,
    },
}

/// Initialize logging to `UNITY_MCP_LOG_FILE`, or stderr when unset.
fn init_logging() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("UNITY_MCP_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}; logging to stderr"),
        }
    }
    builder.init();
}

/// Run the bridge until Ctrl-C.
async fn serve(mut config: Config, mode: Option<TransportMode>, port: Option<u16>) -> Result<()> {
    if let Some(mode) = mode {
        config.mode = mode;
    }
    if let Some(port) = port {
        config.port = port;
    }

    // Standalone there is no editor loop; the pump runs on its own task.
    let (queue, pump) = main_thread_queue(Arc::new(CommandRouter::new()));
    let pump_task = tokio::spawn(pump.run());

    let factories = config.transport_factories(Arc::new(queue))?;
    let manager = TransportManager::configure(factories);

    if !manager.start(config.mode).await {
        TransportManager::reset().await;
        anyhow::bail!("Failed to start {} transport", config.mode);
    }

    let state = manager.state();
    log::info!(
        "Bridge ready: {} (port {:?}, {})",
        state.transport_name(),
        state.port(),
        state.details().unwrap_or("no details")
    );
    println!("{}", serde_json::to_string_pretty(&state)?);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Shutting down...");
    TransportManager::reset().await;
    drop(manager);
    pump_task.abort();
    Ok(())
}

async fn ping(port: Option<u16>) -> Result<()> {
    let port = match port {
        Some(port) => port,
        None => PortRegistry::from_home()?.discover_port().await,
    };

    let mut client = BridgeClient::connect(port, DISCOVERY_PROBE_TIMEOUT * 10).await?;
    println!("Handshake: {}", client.handshake());
    if client.ping().await? {
        println!("pong from port {port}");
        Ok(())
    } else {
        anyhow::bail!("Bridge on port {port} did not answer with pong")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { mode, port } => {
            serve(Config::load()?, mode, port).await?;
        }
        Commands::Ping { port } => {
            ping(port).await?;
        }
        Commands::Discover => {
            let port = PortRegistry::from_home()?.discover_port().await;
            println!("{port}");
        }
        Commands::PortCheck { port: candidate } => {
            if port::is_port_available(candidate) {
                println!("{candidate} is available");
            } else {
                println!("{candidate} is in use");
                std::process::exit(1);
            }
        }
        Commands::Config { save } => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
        }
    }

    Ok(())
}
