//! gRPC endpoint of the dispatcher.
//!
//! Two services share one listener:
//! - [`WorkerService`] (`dispatch.DispatchWorker`): the pop/ack protocol
//!   spoken by worker runtimes. `Pop` is a unary call that parks until an
//!   event is available; cancelling the call releases the parked pop.
//! - [`ControlService`] (`dispatch.DispatchControl`): subscription
//!   management and ingress for the HTTP, socket, change-feed and broker
//!   triggers hosted in-process.

pub mod client;
pub mod control;
pub mod server;
pub mod worker;

pub use client::{ControlClient, WorkerClient};
pub use control::ControlService;
pub use server::DispatchServer;
pub use worker::WorkerService;

use tonic::Status;

use crate::enqueuer::socket::SocketError;
use crate::enqueuer::EnqueueError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC transport error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Request rejected ({}): {}", .0.code(), .0.message())]
    Rejected(Box<Status>),
}

impl From<Status> for TransportError {
    fn from(status: Status) -> Self {
        TransportError::Rejected(Box::new(status))
    }
}

impl TransportError {
    /// gRPC code of a rejected call.
    pub fn code(&self) -> Option<tonic::Code> {
        match self {
            TransportError::Rejected(status) => Some(status.code()),
            _ => None,
        }
    }
}

pub(crate) fn enqueue_status(e: EnqueueError) -> Status {
    match e {
        EnqueueError::InvalidOptions { .. } => Status::invalid_argument(e.to_string()),
        EnqueueError::AlreadySubscribed(_) => Status::already_exists(e.to_string()),
        EnqueueError::UnknownKind(_) => Status::not_found(e.to_string()),
        EnqueueError::Transport(_) => Status::unavailable(e.to_string()),
    }
}

pub(crate) fn socket_status(e: SocketError) -> Status {
    match e {
        SocketError::UnknownClient(_) => Status::not_found(e.to_string()),
        SocketError::Backpressure(_) => Status::resource_exhausted(e.to_string()),
    }
}
