//! Brahms gossip node binary.
//!
//! Loads the INI configuration, builds the keyring from the hostkeys
//! directory, and runs the UDP gossip endpoint, the local TCP API, and the
//! round engine until interrupted.
//!
//! Usage:
//!   gossip -c config.ini

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use murmur::api;
use murmur::challenge::Challenger;
use murmur::config::GossipConfig;
use murmur::constants::{KEY_ROTATION_INTERVAL, KEY_ROTATION_KEEP};
use murmur::gossip::crypto::Crypto;
use murmur::gossip::engine::Gossip;
use murmur::gossip::server::Server;
use murmur::gossip::store::MessageStore;

/// Brahms gossip node.
#[derive(Parser, Debug)]
#[command(name = "gossip", about = "Byzantine-resistant gossip node")]
struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = match GossipConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(path = %cli.config.display(), error = %e, "Error reading configuration");
            return ExitCode::FAILURE;
        }
    };

    let crypto = match Crypto::new(cfg.private_key.clone(), &cfg.hostkeys_path) {
        Ok(crypto) => crypto,
        Err(e) => {
            tracing::error!(path = %cfg.hostkeys_path.display(), error = %e, "Error building keyring");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let challenger = Challenger::new(KEY_ROTATION_INTERVAL, KEY_ROTATION_KEEP, shutdown.clone());
    let store = Arc::new(Mutex::new(MessageStore::new()));

    let api_handle = match api::server::start(
        &cfg.api_address,
        Arc::clone(&store),
        crypto.identity(),
        shutdown.clone(),
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Error starting API server");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(&cfg, crypto, challenger, store, api_handle).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Error starting gossip endpoint");
            return ExitCode::FAILURE;
        }
    };
    server.spawn_recv_loop(shutdown.clone());

    let mut engine = match Gossip::new(&cfg, Arc::clone(&server)) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Error creating gossip engine");
            return ExitCode::FAILURE;
        }
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    engine.run(shutdown).await;
    ExitCode::SUCCESS
}
