mod capture;
mod cli;
mod config;
mod constants;
mod error;
mod logger;
mod models;
mod orchestrator;
mod parser;
mod search;
mod store;
mod utils;
mod watcher;

use anyhow::Result;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Cancellation token for async shutdown (daemon, watcher, pollers)
    let cancel_token = CancellationToken::new();
    let cancel_clone = cancel_token.clone();

    // CTRL-C handling via ctrlc crate (SetConsoleCtrlHandler on Windows,
    // sigaction on Unix). First press: graceful shutdown via the token.
    // Second press: force exit.
    ctrlc::set_handler(move || {
        if constants::SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            eprintln!("\nForce shutdown!");
            std::process::exit(130);
        }
        eprintln!("\nShutting down gracefully... (press Ctrl-C again to force)");
        constants::SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        cancel_clone.cancel();
    })
    .expect("Failed to set CTRL-C handler");

    cli::run(cancel_token).await
}
