//! trigger-dispatchd: function-invocation dispatcher
//!
//! Hosts the trigger enqueuers, the event queue and one gRPC endpoint in a
//! single process:
//! - `dispatch.DispatchWorker`: worker runtimes pop events and report outcomes.
//! - `dispatch.DispatchControl`: subscribe/unsubscribe, plus ingress for the
//!   HTTP, socket, change-feed and built-in broker triggers.
//!
//! ## Architecture
//! ```text
//! [control plane] ──Subscribe──▶ Enqueuers ──▶ EventQueue ◀── Pop/Ack ── [workers]
//! [front ends] ──DispatchHttp/Socket*/Publish*──▶ │
//!                                                 └──▶ JobReducer (shared SQLite claims)
//! ```
//!
//! Replicas do not mirror subscriptions to each other here; the control plane
//! sends the same Subscribe to every replica, and the shared claim store keeps
//! scheduled occurrences exactly-once.
//!
//! ## Configuration
//! - `--config <path>` / DISPATCH_CONFIG: YAML configuration file
//! - DISPATCH__SERVER__PORT: gRPC endpoint port
//! - DISPATCH__HTTP__RESPONSE_TIMEOUT_SECS: wait for a worker's HTTP answer
//! - DISPATCH__REDUCER__SQLITE_PATH: claim store shared by replicas
//! - DISPATCH__MESSAGE_QUEUE__DEFAULT_URL: broker for message-queue triggers
//! - DISPATCH_LOG: log filter (default `info`)

use std::sync::Arc;

use tracing::{error, info, warn};

use trigger_dispatch::config::Config;
use trigger_dispatch::enqueuer::database::InMemoryChangeStream;
use trigger_dispatch::runtime::{Dispatcher, DispatcherBuilder};
use trigger_dispatch::utils::bootstrap::{init_tracing, parse_config_path};

#[cfg(feature = "amqp")]
fn with_broker(builder: DispatcherBuilder) -> DispatcherBuilder {
    info!("Using AMQP broker for message-queue triggers");
    builder.with_broker(Arc::new(trigger_dispatch::enqueuer::message_queue::AmqpBroker::new()))
}

#[cfg(not(feature = "amqp"))]
fn with_broker(builder: DispatcherBuilder) -> DispatcherBuilder {
    info!("AMQP support not compiled in, using built-in broker (PublishMessage)");
    builder
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(addr = %config.server.addr(), "Starting trigger-dispatchd");

    let builder = Dispatcher::builder(config).with_change_feed(Arc::new(InMemoryChangeStream::new()));
    let dispatcher = with_broker(builder).build().await?;

    dispatcher
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("trigger-dispatchd stopped");
    Ok(())
}
