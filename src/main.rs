//! This file defines the stackmerge-server binary entry point.

use stackmerge::app;
use stackmerge::app_state::AppState;
use stackmerge::cli;
use stackmerge::metrics;
use stackmerge::server;
use stackmerge::tracing;

use std::process::exit;
use std::sync::Arc;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    ::tracing::debug!(?args, "parsed arguments");
    metrics::register_metrics();
    let state = match AppState::new(&args) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            eprintln!("failed to start: {}", err);
            exit(1)
        }
    };
    let service = app::service(state.clone());
    let served = server::serve(&args, service).await;
    state.runner.close().await;
    tracing::shutdown_tracing();
    if let Err(err) = served {
        eprintln!("server error: {}", err);
        exit(1)
    }
}
