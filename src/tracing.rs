//! Tracing (logging)

use crate::cli::CommandLineArgs;

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use expanduser::expanduser;
use opentelemetry::global;
use tracing_subscriber::{filter::filter_fn, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Target of access log events.
pub const ACCESS_LOG_TARGET: &str = "siibra_api::access";

/// Name of the access log file within the log directory.
pub const ACCESS_LOG_FILE: &str = "access.log";

/// Open the access log file in `log_dir` for appending, creating the directory if needed.
fn open_access_log(log_dir: &str) -> std::io::Result<File> {
    let dir = expanduser(log_dir)?;
    fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(&dir).join(ACCESS_LOG_FILE))
}

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to enable debug
/// logging for this crate and tower_http if not set.
///
/// Access log events are also appended to `<log_dir>/access.log` when a log directory is
/// configured, and spans are exported to Jaeger when enabled.
pub fn init_tracing(args: &CommandLineArgs) {
    let mut warnings = Vec::new();

    let access_log = match args.log_dir.as_deref().map(open_access_log) {
        Some(Ok(file)) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(|metadata| {
                    metadata.target() == ACCESS_LOG_TARGET
                })),
        ),
        Some(Err(err)) => {
            warnings.push(format!("failed to open access log: {}", err));
            None
        }
        None => None,
    };

    let jaeger = if args.enable_jaeger {
        match opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name("siibra-api")
            .install_batch(opentelemetry::runtime::Tokio)
        {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(err) => {
                warnings.push(format!("failed to initialise Jaeger exporter: {}", err));
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siibra_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(access_log)
        .with(jaeger)
        .init();

    for warning in warnings {
        tracing::warn!("{}", warning);
    }
}

/// Flush pending spans to Jaeger.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
