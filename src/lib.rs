//! trigger-dispatch - Function Invocation Dispatch Core
//!
//! Converts trigger signals (database changes, HTTP calls, cron schedules,
//! broker deliveries, socket messages, process readiness) into uniform
//! invocation events and hands them to worker processes through a
//! pop/ack queue.
//!
//! ## Architecture
//! ```text
//! [change stream] [cron] [http] [broker] [sockets] [readiness]
//!        \          |       |       |        |         /
//!         +-------- Enqueuers (one per trigger kind) -+
//!                          |   \
//!                          |    +--> JobReducer (claim per occurrence)
//!                          v
//!                     EventQueue  <--(Pop / Ack / Error)-- workers (gRPC)
//! ```

pub mod config;
pub mod enqueuer;
pub mod event;
pub mod queue;
pub mod reducer;
pub mod registry;
pub mod replication;
pub mod runtime;
pub mod transport;
pub mod utils;

pub mod proto {
    tonic::include_proto!("dispatch");
}

#[cfg(test)]
pub(crate) mod test_utils;

pub use event::{Event, EventType, Target};
pub use queue::EventQueue;
