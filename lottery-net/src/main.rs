//! Entry point for `lottery-net`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use anyhow::Context;
use clap::{Parser, Subcommand};

use lottery_net::config::{ClientConfig, LogArgs, ServerConfig};
use lottery_net::shutdown::{self, ShutdownTrigger};
use lottery_net::{client, Server};

/// Batched wager registration with a barrier-gated draw.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the central server, waiting for every agency before the draw.
    Server(ServerConfig),
    /// Run one agency, registering its wagers and fetching its winners.
    Client(ClientConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG, when set, overrides --log-level.
    env_logger::Builder::new()
        .filter_level(cli.log.log_level)
        .parse_default_env()
        .init();

    let (trigger, token) = shutdown::channel();
    tokio::spawn(forward_signals(trigger));

    match cli.mode {
        Mode::Server(config) => {
            config.validate().context("invalid server configuration")?;
            let server = Server::bind(config.bind.as_str(), config.agencies, config.winning_number)
                .await
                .with_context(|| format!("failed to bind {}", config.bind))?;
            server.run(token).await;
            log::info!("[server] stopped");
        }
        Mode::Client(config) => {
            config.validate().context("invalid client configuration")?;
            let winners = client::run(&config, token)
                .await
                .with_context(|| format!("agency {} failed", config.id))?;
            log::info!("[agency {}] done winners={}", config.id, winners.len());
        }
    }
    Ok(())
}

async fn forward_signals(trigger: ShutdownTrigger) {
    match shutdown::wait_for_signal().await {
        Ok(name) => {
            log::info!("received {name}, shutting down");
            trigger.trigger();
        }
        Err(e) => log::warn!("cannot listen for signals: {e}"),
    }
}
