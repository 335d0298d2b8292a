//! Health check for container orchestration.
//!
//! Takes the same arguments and environment as `siibra-api`. Exits with `0` when healthy, `1`
//! when unhealthy or stale and `2` when the service cannot be contacted.

use siibra_api::cli::{self, redact, CommandLineArgs};
use siibra_api::role::Role;
use siibra_api::task_queue::{unix_now, RedisTaskQueue};

use std::process::exit;
use std::time::Duration;

use hyper::{Client, StatusCode, Uri};

/// Oldest acceptable worker heartbeat, in seconds.
const MAX_HEARTBEAT_AGE: u64 = 60;

/// Time allowed for contacting the service.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

enum Health {
    Healthy,
    Unhealthy(String),
    Unreachable(String),
}

impl Health {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Healthy => 0,
            Self::Unhealthy(_) => 1,
            Self::Unreachable(_) => 2,
        }
    }
}

/// Address to check for a server bound to `host`.
fn check_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" => "127.0.0.1",
        host => host,
    }
}

async fn check_server(args: &CommandLineArgs) -> Health {
    let host = check_host(&args.host);
    if args.https {
        // Certificates are not verified here, so a listening socket is enough.
        return match tokio::net::TcpStream::connect((host, args.port)).await {
            Ok(_) => Health::Healthy,
            Err(err) => Health::Unreachable(err.to_string()),
        };
    }
    let uri: Uri = match format!("http://{}:{}/ready", host, args.port).parse() {
        Ok(uri) => uri,
        Err(err) => return Health::Unreachable(err.to_string()),
    };
    match Client::new().get(uri).await {
        Ok(response) if response.status() == StatusCode::OK => Health::Healthy,
        Ok(response) => Health::Unhealthy(format!("/ready answered {}", response.status())),
        Err(err) => Health::Unreachable(err.to_string()),
    }
}

async fn check_worker(args: &CommandLineArgs) -> Health {
    let Some(url) = &args.broker_url else {
        return Health::Unreachable("no task queue configured".to_string());
    };
    let queue = match RedisTaskQueue::connect(url, &args.queue_prefix, args.result_ttl).await {
        Ok(queue) => queue,
        Err(err) => return Health::Unreachable(format!("{}: {}", redact(url), err)),
    };
    match queue.last_heartbeat(&args.worker_name).await {
        Ok(Some(beat)) => heartbeat_health(unix_now().saturating_sub(beat)),
        Ok(None) => Health::Unhealthy(format!("no heartbeat from {}", args.worker_name)),
        Err(err) => Health::Unreachable(err.to_string()),
    }
}

fn heartbeat_health(age: u64) -> Health {
    if age <= MAX_HEARTBEAT_AGE {
        Health::Healthy
    } else {
        Health::Unhealthy(format!("last heartbeat {}s ago", age))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();
    let check = async {
        match args.role {
            Role::Worker => check_worker(&args).await,
            Role::All | Role::Server => check_server(&args).await,
        }
    };
    let health = tokio::time::timeout(CHECK_TIMEOUT, check)
        .await
        .unwrap_or_else(|_| Health::Unreachable("timed out".to_string()));
    match &health {
        Health::Healthy => println!("healthy"),
        Health::Unhealthy(reason) => eprintln!("unhealthy: {}", reason),
        Health::Unreachable(reason) => eprintln!("unreachable: {}", reason),
    }
    exit(health.exit_code());
}
