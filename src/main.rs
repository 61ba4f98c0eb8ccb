// src/main.rs

//! The main entry point for the PeerLink node.

use anyhow::Result;
use peerlink::config::Config;
use peerlink::core::auth::hash_password;
use peerlink::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("PeerLink version {VERSION}");
        return Ok(());
    }

    // Prints an argon2 hash suitable for `[[auth.users]]` and exits.
    if let Some(i) = args.iter().position(|arg| arg == "--hash-password") {
        let Some(password) = args.get(i + 1) else {
            eprintln!("Usage: peerlink --hash-password <password>");
            std::process::exit(1);
        };
        println!("{}", hash_password(password)?);
        return Ok(());
    }

    // Without --config the node runs on defaults.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let mut config = match config_path.as_deref() {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        if let Some(port_str) = args.get(port_index + 1) {
            match port_str.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => {
                    eprintln!("Invalid port number: {port_str}");
                    std::process::exit(1);
                }
            }
        } else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        }
        if let Err(e) = config.validate() {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(1);
        }
    }

    // RUST_LOG wins over the configured level.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, config_path, reload_handle).await {
        error!("Node runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
