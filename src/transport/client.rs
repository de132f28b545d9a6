//! Reference clients for the dispatcher endpoint.
//!
//! Both wrap a tonic [`Channel`]; clones share the underlying HTTP/2
//! connection, so a worker can keep a `Pop` parked while it acks on another
//! clone.

use std::collections::HashMap;

use tonic::transport::Channel;
use tonic::Streaming;
use tracing::debug;

use super::{Result, TransportError};
use crate::event::Target;
use crate::proto::{
    self, dispatch_control_client::DispatchControlClient, dispatch_worker_client::DispatchWorkerClient,
    AckRequest, ChangeOperation, ErrorRequest, HttpRespondRequest, PopRequest, PublishChangeRequest,
    PublishMessageRequest, SocketBroadcastRequest, SocketCloseRequest, SocketConnectRequest,
    SocketReceiveRequest, SocketSendRequest, SubscribeRequest, UnsubscribeRequest,
};
use crate::utils::bootstrap::connect_with_retry;

async fn connect_channel(addr: &str) -> Result<Channel> {
    let channel = Channel::from_shared(format!("http://{}", addr))
        .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?
        .connect()
        .await?;
    debug!(addr = %addr, "Connected to dispatch endpoint");
    Ok(channel)
}

/// Worker side of the pop/ack protocol.
#[derive(Clone)]
pub struct WorkerClient {
    inner: DispatchWorkerClient<Channel>,
}

impl WorkerClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        Ok(Self::new(connect_channel(addr).await?))
    }

    /// Connect, retrying with backoff while the dispatcher comes up.
    pub async fn connect_with_retry(addr: &str) -> Result<Self> {
        connect_with_retry("dispatcher", addr, || Self::connect(addr)).await
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: DispatchWorkerClient::new(channel),
        }
    }

    /// Wait for the next event. `None` once the dispatcher's queue is closed.
    ///
    /// Dropping the returned future cancels the call and withdraws the pop.
    pub async fn pop(&self, worker_id: &str) -> Result<Option<proto::Event>> {
        let response = self
            .inner
            .clone()
            .pop(PopRequest {
                worker_id: worker_id.to_string(),
            })
            .await?;
        Ok(response.into_inner().event)
    }

    pub async fn ack(&self, event_id: &str) -> Result<()> {
        self.inner
            .clone()
            .ack(AckRequest {
                event_id: event_id.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn error(&self, event_id: &str, message: impl Into<String>) -> Result<()> {
        self.inner
            .clone()
            .error(ErrorRequest {
                event_id: event_id.to_string(),
                message: message.into(),
            })
            .await?;
        Ok(())
    }

    /// Answer the HTTP request behind `event_id`.
    pub async fn http_respond(
        &self,
        event_id: &str,
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<()> {
        self.inner
            .clone()
            .http_respond(HttpRespondRequest {
                event_id: event_id.to_string(),
                status: u32::from(status),
                headers,
                body,
            })
            .await?;
        Ok(())
    }

    pub async fn socket_send(&self, client_id: &str, name: &str, data: Vec<u8>) -> Result<()> {
        self.inner
            .clone()
            .socket_send(SocketSendRequest {
                client_id: client_id.to_string(),
                name: name.to_string(),
                data,
            })
            .await?;
        Ok(())
    }

    /// Returns how many clients accepted the message.
    pub async fn socket_broadcast(&self, name: &str, data: Vec<u8>) -> Result<u32> {
        let response = self
            .inner
            .clone()
            .socket_broadcast(SocketBroadcastRequest {
                name: name.to_string(),
                data,
            })
            .await?;
        Ok(response.into_inner().delivered)
    }

    pub async fn socket_close(&self, client_id: &str) -> Result<()> {
        self.inner
            .clone()
            .socket_close(SocketCloseRequest {
                client_id: client_id.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Subscription management and trigger ingress.
#[derive(Clone)]
pub struct ControlClient {
    inner: DispatchControlClient<Channel>,
}

impl ControlClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        Ok(Self::new(connect_channel(addr).await?))
    }

    pub async fn connect_with_retry(addr: &str) -> Result<Self> {
        connect_with_retry("dispatcher", addr, || Self::connect(addr)).await
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: DispatchControlClient::new(channel),
        }
    }

    pub async fn subscribe(&self, kind: &str, target: Target, options: &serde_json::Value) -> Result<()> {
        self.inner
            .clone()
            .subscribe(SubscribeRequest {
                kind: kind.to_string(),
                target: Some(target.into()),
                options_json: options.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, kind: &str, target: Target) -> Result<()> {
        self.inner
            .clone()
            .unsubscribe(UnsubscribeRequest {
                kind: kind.to_string(),
                target: Some(target.into()),
            })
            .await?;
        Ok(())
    }

    /// Route an HTTP request through the dispatcher and wait for the answer.
    pub async fn dispatch_http(&self, request: proto::HttpRequest) -> Result<proto::HttpResponse> {
        Ok(self.inner.clone().dispatch_http(request).await?.into_inner())
    }

    /// Attach a client socket; the first frame carries its id.
    pub async fn socket_connect(&self, remote_address: &str) -> Result<Streaming<proto::SocketFrame>> {
        let response = self
            .inner
            .clone()
            .socket_connect(SocketConnectRequest {
                remote_address: remote_address.to_string(),
            })
            .await?;
        Ok(response.into_inner())
    }

    /// Hand in a client message; returns how many events it produced.
    pub async fn socket_receive(&self, client_id: &str, name: &str, data: Vec<u8>) -> Result<u32> {
        let response = self
            .inner
            .clone()
            .socket_receive(SocketReceiveRequest {
                client_id: client_id.to_string(),
                name: name.to_string(),
                data,
            })
            .await?;
        Ok(response.into_inner().enqueued)
    }

    pub async fn publish_change(
        &self,
        collection: &str,
        operation: ChangeOperation,
        document_key: &serde_json::Value,
        document: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.inner
            .clone()
            .publish_change(PublishChangeRequest {
                collection: collection.to_string(),
                operation: operation as i32,
                document_key_json: document_key.to_string(),
                document_json: document.map(|d| d.to_string()).unwrap_or_default(),
            })
            .await?;
        Ok(())
    }

    pub async fn publish_message(
        &self,
        url: &str,
        queue: &str,
        body: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        self.inner
            .clone()
            .publish_message(PublishMessageRequest {
                url: url.to_string(),
                queue: queue.to_string(),
                body,
                headers,
            })
            .await?;
        Ok(())
    }
}
