//! courier CLI — worker node and test-event publisher

use clap::{Parser, Subcommand};
use courier::{Config, CourierApp, Registry};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier", version, about = "Distributed asynchronous messaging worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a worker node
    Worker {
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: String,
    },
    /// Create and send events to the inbound queue
    Send {
        /// Event type to publish
        event_type: String,
        /// JSON payload (defaults to `{"a": 1}`)
        payload: Option<String>,
        /// Path to the YAML configuration file
        #[arg(short, long)]
        config: Option<String>,
        /// Number of events per batch
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Keep publishing a batch every second
        #[arg(long = "loop")]
        repeat: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Worker { config } => worker(&config).await,
        Command::Send {
            event_type,
            payload,
            config,
            count,
            repeat,
        } => send(&event_type, payload.as_deref(), config.as_deref(), count, repeat).await,
    };
    std::process::exit(code);
}

fn init_logging(config: &Config) {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

async fn worker(config_path: &str) -> i32 {
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("courier: {e}");
            return 1;
        }
    };
    init_logging(&config);
    tracing::info!(config = config_path, "Configuration loaded");

    let mut app = CourierApp::new(config, Registry::with_builtins());
    if let Err(e) = app.start().await {
        tracing::error!(error = %e, "Startup failed");
        return 1;
    }

    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Cannot listen for shutdown signal");
        app.stop().await;
        return 1;
    }
    tracing::info!("Graceful shutdown, press Ctrl-C again to exit hard");

    tokio::select! {
        _ = app.stop() => 0,
        _ = tokio::signal::ctrl_c() => {
            tracing::error!("Stopped hard, exiting");
            1
        }
    }
}

async fn send(
    event_type: &str,
    payload: Option<&str>,
    config_path: Option<&str>,
    count: u32,
    repeat: bool,
) -> i32 {
    let config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("courier: {e}");
                return 1;
            }
        },
        None => Config::default(),
    };
    init_logging(&config);

    let payload = match payload {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                eprintln!("courier: invalid payload: {e}");
                return 1;
            }
        },
        None => serde_json::json!({"a": 1}),
    };

    let mut app = CourierApp::new(config, Registry::with_builtins());
    loop {
        for _ in 0..count {
            if let Err(e) = app.send(event_type, payload.clone()).await {
                tracing::error!(error = %e, "Publish failed");
                return 1;
            }
        }
        if !repeat {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Events were published");
    0
}
