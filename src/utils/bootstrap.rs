//! Bootstrap utilities for dispatch binaries and worker runtimes.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the DISPATCH_LOG environment variable.
///
/// Defaults to "info" level if DISPATCH_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config file path from `--config <path>` / `-c <path>` on the command line.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Connect to a service with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "dispatcher", "broker")
/// * `address` - The address being connected to
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected client on success, or the last error once the backoff is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = %service_name, address = %address, "Connected");
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = %service_name,
                        address = %address,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        service = %service_name,
                        address = %address,
                        attempts = attempt,
                        error = %e,
                        "Giving up on connection"
                    );
                    return Err(e);
                }
            },
        }
    }
}
