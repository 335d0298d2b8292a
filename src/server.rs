//! Web server

use crate::cli;

use std::{net::SocketAddr, str::FromStr, time::Duration};

use axum::ServiceExt;
use axum_server::{tls_rustls::RustlsConfig, Handle};
use expanduser::expanduser;
use tokio::signal;

/// Errors that prevent the server from starting or keep it from running.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid host name, IP address or port number {0}")]
    InvalidAddress(String),

    #[error("TLS {kind} file expected at '{path}' but not found")]
    MissingTlsFile { kind: &'static str, path: String },

    #[error("failed to load TLS certificate files")]
    Tls(#[source] std::io::Error),

    #[error("server error")]
    Io(#[from] std::io::Error),
}

/// Expand `~` in `path` and make it absolute.
fn tls_file(kind: &'static str, path: &str) -> Result<std::path::PathBuf, ServeError> {
    let missing = || ServeError::MissingTlsFile {
        kind,
        path: path.to_string(),
    };
    expanduser(path)
        .map_err(|_| missing())?
        .canonicalize()
        .map_err(|_| missing())
}

/// Serve the siibra API
///
/// # Arguments
///
/// * `args`: Command line arguments
/// * `service`: The [crate::app::Service] to serve
pub async fn serve(args: &cli::CommandLineArgs, service: crate::app::Service) -> Result<(), ServeError> {
    let address = format!("{}:{}", args.host, args.port);
    let addr = SocketAddr::from_str(&address).map_err(|_| ServeError::InvalidAddress(address))?;

    // Catch ctrl+c and try to shutdown gracefully
    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(
        handle.clone(),
        args.graceful_shutdown_timeout,
    ));

    if args.https {
        let abs_cert_file = tls_file("certificate", &args.cert_file)?;
        let abs_key_file = tls_file("key", &args.key_file)?;
        let tls_config = RustlsConfig::from_pem_file(abs_cert_file, abs_key_file)
            .await
            .map_err(ServeError::Tls)?;
        tracing::info!("listening on https://{}", addr);
        // run HTTPS server with hyper
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(service.into_make_service())
            .await?;
    } else {
        tracing::info!("listening on http://{}", addr);
        // run HTTP server with hyper
        axum_server::bind(addr)
            .handle(handle)
            .serve(service.into_make_service())
            .await?;
    }
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Graceful shutdown handler
///
/// Triggers a graceful shutdown of the server once a signal arrives.
async fn graceful_shutdown(handle: Handle, timeout: u64) {
    shutdown_signal().await;
    tracing::info!("signal received, starting graceful shutdown");
    // Force shutdown if graceful shutdown takes longer than the timeout
    handle.graceful_shutdown(Some(Duration::from_secs(timeout)));
}
