//! Worker pop/ack service.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use super::socket_status;
use crate::enqueuer::http::{HttpResponse, PendingResponses};
use crate::enqueuer::socket::SocketHub;
use crate::proto::{
    dispatch_worker_server::DispatchWorker, AckRequest, Done, ErrorRequest, HttpRespondRequest,
    PopRequest, PopResponse, SocketBroadcastRequest, SocketBroadcastResponse, SocketCloseRequest,
    SocketSendRequest,
};
use crate::queue::EventQueue;

/// What the worker endpoint serves.
#[derive(Clone)]
pub struct WorkerService {
    queue: Arc<EventQueue>,
    /// Pending HTTP requests, when the HTTP enqueuer is enabled.
    http: Option<PendingResponses>,
    /// Open client sockets, when the socket enqueuer is enabled.
    sockets: Option<SocketHub>,
}

impl WorkerService {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            http: None,
            sockets: None,
        }
    }

    pub fn with_http(mut self, responses: PendingResponses) -> Self {
        self.http = Some(responses);
        self
    }

    pub fn with_sockets(mut self, hub: SocketHub) -> Self {
        self.sockets = Some(hub);
        self
    }

    fn hub(&self) -> Result<&SocketHub, Status> {
        self.sockets
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("socket trigger is not enabled"))
    }
}

#[tonic::async_trait]
impl DispatchWorker for WorkerService {
    async fn pop(&self, request: Request<PopRequest>) -> Result<Response<PopResponse>, Status> {
        let worker_id = request.into_inner().worker_id;
        // Dropping this future (client cancelled) withdraws the parked pop.
        let event = self.queue.pop(&worker_id).await;
        Ok(Response::new(PopResponse {
            event: event.map(Into::into),
        }))
    }

    async fn ack(&self, request: Request<AckRequest>) -> Result<Response<Done>, Status> {
        self.queue.ack(&request.into_inner().event_id);
        Ok(Response::new(Done {}))
    }

    async fn error(&self, request: Request<ErrorRequest>) -> Result<Response<Done>, Status> {
        let failure = request.into_inner();
        self.queue.error(&failure.event_id, failure.message);
        Ok(Response::new(Done {}))
    }

    async fn http_respond(&self, request: Request<HttpRespondRequest>) -> Result<Response<Done>, Status> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("http trigger is not enabled"))?;
        let respond = request.into_inner();
        let status = u16::try_from(respond.status)
            .ok()
            .filter(|status| (100..=999).contains(status))
            .ok_or_else(|| Status::invalid_argument(format!("invalid status {}", respond.status)))?;
        let response = HttpResponse {
            status,
            headers: respond
                .headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            body: respond.body,
        };
        if http.respond(&respond.event_id, response) {
            Ok(Response::new(Done {}))
        } else {
            Err(Status::not_found(format!(
                "no pending http request for event {}",
                respond.event_id
            )))
        }
    }

    async fn socket_send(&self, request: Request<SocketSendRequest>) -> Result<Response<Done>, Status> {
        let send = request.into_inner();
        self.hub()?
            .send(&send.client_id, &send.name, send.data)
            .map_err(socket_status)?;
        Ok(Response::new(Done {}))
    }

    async fn socket_broadcast(
        &self,
        request: Request<SocketBroadcastRequest>,
    ) -> Result<Response<SocketBroadcastResponse>, Status> {
        let broadcast = request.into_inner();
        let delivered = self.hub()?.broadcast(&broadcast.name, &broadcast.data);
        debug!(name = %broadcast.name, delivered, "Socket broadcast");
        Ok(Response::new(SocketBroadcastResponse {
            delivered: u32::try_from(delivered).unwrap_or(u32::MAX),
        }))
    }

    async fn socket_close(&self, request: Request<SocketCloseRequest>) -> Result<Response<Done>, Status> {
        self.hub()?
            .close(&request.into_inner().client_id)
            .map_err(socket_status)?;
        Ok(Response::new(Done {}))
    }
}
