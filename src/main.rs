//! This file defines the siibra-api binary entry point.

use siibra_api::app;
use siibra_api::app_state::AppState;
use siibra_api::cli;
use siibra_api::metrics;
use siibra_api::role::Role;
use siibra_api::server;
use siibra_api::tracing;
use siibra_api::worker;

use std::process::exit;
use std::sync::Arc;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing(&args);
    if let Err(err) = metrics::register_metrics() {
        ::tracing::error!("failed to register metrics: {}", err);
        exit(1);
    }
    if args.use_rayon {
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|index| format!("siibra-api-rayon-{}", index))
            .build_global();
        if let Err(err) = pool {
            ::tracing::warn!("failed to configure the Rayon thread pool: {}", err);
        }
    }

    let state = match AppState::new(&args).await {
        Ok(state) => Arc::new(state),
        Err(err) => {
            ::tracing::error!("{}", err);
            tracing::shutdown_tracing();
            exit(1);
        }
    };
    ::tracing::info!(role = %args.role, version = app::VERSION, "starting siibra-api");

    let result = match args.role {
        Role::Worker => worker::run(state.clone(), server::shutdown_signal())
            .await
            .map_err(|err| err.to_string()),
        Role::All | Role::Server => server::serve(&args, app::service(state.clone()))
            .await
            .map_err(|err| err.to_string()),
    };

    // The role future has finished, so this is the last reference.
    state.close();
    if let Err(err) = result {
        ::tracing::error!("{}", err);
        tracing::shutdown_tracing();
        exit(1);
    }
    tracing::shutdown_tracing();
}
