//! Control plane: subscription management and trigger ingress.
//!
//! The daemon hosts every trigger in-process; front ends (an HTTP server, a
//! websocket gateway, a change-data-capture relay) hand their traffic in
//! through this service.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use super::{enqueue_status, socket_status};
use crate::enqueuer::database::InMemoryChangeStream;
use crate::enqueuer::http::{HttpEnqueuer, HttpRequest};
use crate::enqueuer::message_queue::InMemoryBroker;
use crate::enqueuer::socket::{SocketEnqueuer, SocketFrame};
use crate::event::Target;
use crate::proto::{
    self, dispatch_control_server::DispatchControl, socket_frame, ChangeOperation, Done,
    PublishChangeRequest, PublishMessageRequest, SocketConnectRequest, SocketDisconnectRequest,
    SocketReceiveRequest, SocketReceiveResponse, SubscribeRequest, UnsubscribeRequest,
};
use crate::replication::Subscriptions;

/// Frames buffered per connected socket stream.
const SOCKET_STREAM_BUFFER: usize = 32;

#[derive(Clone)]
pub struct ControlService {
    subscriptions: Subscriptions,
    http: Option<Arc<HttpEnqueuer>>,
    sockets: Option<Arc<SocketEnqueuer>>,
    change_feed: Option<Arc<InMemoryChangeStream>>,
    broker: Option<InMemoryBroker>,
}

impl ControlService {
    pub fn new(subscriptions: Subscriptions) -> Self {
        Self {
            subscriptions,
            http: None,
            sockets: None,
            change_feed: None,
            broker: None,
        }
    }

    pub fn with_http(mut self, http: Arc<HttpEnqueuer>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_sockets(mut self, sockets: Arc<SocketEnqueuer>) -> Self {
        self.sockets = Some(sockets);
        self
    }

    /// Accept `PublishChange` into `feed`.
    pub fn with_change_feed(mut self, feed: Arc<InMemoryChangeStream>) -> Self {
        self.change_feed = Some(feed);
        self
    }

    /// Accept `PublishMessage` into `broker`.
    pub fn with_broker(mut self, broker: InMemoryBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    fn sockets(&self) -> Result<&Arc<SocketEnqueuer>, Status> {
        self.sockets
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("socket trigger is not enabled"))
    }
}

fn target_of(target: Option<proto::Target>) -> Result<Target, Status> {
    let target = target.ok_or_else(|| Status::invalid_argument("target is required"))?;
    if target.id.trim().is_empty() {
        return Err(Status::invalid_argument("target.id is required"));
    }
    Ok(target.into())
}

fn parse_json(field: &str, raw: &str) -> Result<serde_json::Value, Status> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| Status::invalid_argument(format!("{} is not valid JSON: {}", field, e)))
}

fn wire_frame(frame: SocketFrame) -> proto::SocketFrame {
    let frame = match frame {
        SocketFrame::Message { name, data } => socket_frame::Frame::Message(proto::SocketMessage { name, data }),
        SocketFrame::Close => socket_frame::Frame::Close(proto::SocketClosed {}),
    };
    proto::SocketFrame { frame: Some(frame) }
}

#[tonic::async_trait]
impl DispatchControl for ControlService {
    type SocketConnectStream = ReceiverStream<Result<proto::SocketFrame, Status>>;

    async fn subscribe(&self, request: Request<SubscribeRequest>) -> Result<Response<Done>, Status> {
        let request = request.into_inner();
        let target = target_of(request.target)?;
        let options = parse_json("options_json", &request.options_json)?;
        self.subscriptions
            .subscribe(&request.kind, target, options)
            .await
            .map_err(enqueue_status)?;
        Ok(Response::new(Done {}))
    }

    async fn unsubscribe(&self, request: Request<UnsubscribeRequest>) -> Result<Response<Done>, Status> {
        let request = request.into_inner();
        let target = target_of(request.target)?;
        self.subscriptions
            .unsubscribe(&request.kind, &target)
            .await
            .map_err(enqueue_status)?;
        Ok(Response::new(Done {}))
    }

    async fn dispatch_http(
        &self,
        request: Request<proto::HttpRequest>,
    ) -> Result<Response<proto::HttpResponse>, Status> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("http trigger is not enabled"))?;
        let wire = request.into_inner();
        let mut request = HttpRequest::new(wire.method, &wire.path).with_body(wire.body);
        for (name, value) in wire.headers {
            request = request.with_header(&name, value);
        }

        let response = http.dispatch(request).await;
        Ok(Response::new(proto::HttpResponse {
            status: u32::from(response.status),
            headers: response.headers.into_iter().collect(),
            body: response.body,
        }))
    }

    async fn socket_connect(
        &self,
        request: Request<SocketConnectRequest>,
    ) -> Result<Response<Self::SocketConnectStream>, Status> {
        let sockets = Arc::clone(self.sockets()?);
        let remote_address = request.into_inner().remote_address;
        let (client_id, mut frames) = sockets.connect(remote_address);
        let (tx, rx) = mpsc::channel(SOCKET_STREAM_BUFFER);

        tokio::spawn(async move {
            let connected = proto::SocketFrame {
                frame: Some(socket_frame::Frame::Connected(proto::SocketConnected {
                    client_id: client_id.clone(),
                })),
            };
            if tx.send(Ok(connected)).await.is_ok() {
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        frame = frames.recv() => {
                            let Some(frame) = frame else { break };
                            let close = frame == SocketFrame::Close;
                            if tx.send(Ok(wire_frame(frame))).await.is_err() || close {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(client_id = %client_id, "Socket stream ended");
            sockets.disconnect(&client_id);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn socket_receive(
        &self,
        request: Request<SocketReceiveRequest>,
    ) -> Result<Response<SocketReceiveResponse>, Status> {
        let message = request.into_inner();
        let enqueued = self
            .sockets()?
            .receive(&message.client_id, &message.name, &message.data)
            .map_err(socket_status)?;
        Ok(Response::new(SocketReceiveResponse {
            enqueued: u32::try_from(enqueued).unwrap_or(u32::MAX),
        }))
    }

    async fn socket_disconnect(
        &self,
        request: Request<SocketDisconnectRequest>,
    ) -> Result<Response<Done>, Status> {
        self.sockets()?.disconnect(&request.into_inner().client_id);
        Ok(Response::new(Done {}))
    }

    async fn publish_change(&self, request: Request<PublishChangeRequest>) -> Result<Response<Done>, Status> {
        let feed = self
            .change_feed
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("no built-in change feed is configured"))?;
        let change = request.into_inner();
        if change.collection.trim().is_empty() {
            return Err(Status::invalid_argument("collection is required"));
        }
        let operation = ChangeOperation::try_from(change.operation)
            .map_err(|_| Status::invalid_argument(format!("unknown operation {}", change.operation)))?;
        let key = parse_json("document_key_json", &change.document_key_json)?;
        let document = parse_json("document_json", &change.document_json)?;

        match operation {
            ChangeOperation::Insert => feed.insert(&change.collection, key, document),
            ChangeOperation::Update => feed.update(&change.collection, key, document),
            ChangeOperation::Replace => feed.replace(&change.collection, key, document),
            ChangeOperation::Delete => feed.delete(&change.collection, key),
        }
        debug!(collection = %change.collection, operation = ?operation, "Change published");
        Ok(Response::new(Done {}))
    }

    async fn publish_message(&self, request: Request<PublishMessageRequest>) -> Result<Response<Done>, Status> {
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("no built-in broker is configured"))?;
        let message = request.into_inner();
        if message.queue.trim().is_empty() {
            return Err(Status::invalid_argument("queue is required"));
        }
        let headers: BTreeMap<String, String> = message.headers.into_iter().collect();
        broker.publish(&message.url, &message.queue, message.body, headers);
        info!(url = %message.url, queue = %message.queue, "Message published to built-in broker");
        Ok(Response::new(Done {}))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::enqueuer::database::DatabaseEnqueuer;
    use crate::enqueuer::{DispatchContext, Enqueuer, EnqueuerSet, MessageQueueEnqueuer};
    use crate::event::EventType;
    use crate::queue::EventQueue;
    use crate::test_utils::target;

    struct Fixture {
        queue: Arc<EventQueue>,
        http: Arc<HttpEnqueuer>,
        sockets: Arc<SocketEnqueuer>,
        feed: Arc<InMemoryChangeStream>,
        broker: InMemoryBroker,
        service: ControlService,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(EventQueue::new());
        let http = Arc::new(HttpEnqueuer::new(Arc::clone(&queue)).with_response_timeout(Duration::from_secs(1)));
        let sockets = Arc::new(SocketEnqueuer::new(Arc::clone(&queue)));
        let feed = Arc::new(InMemoryChangeStream::new());
        let broker = InMemoryBroker::new();

        let source = Arc::clone(&feed);
        let mq_broker = broker.clone();
        let set = EnqueuerSet::builder(DispatchContext::new(Arc::clone(&queue)))
            .with_enqueuer(http.clone())
            .with_enqueuer(sockets.clone())
            .register(EventType::Database, move |ctx| {
                Arc::new(DatabaseEnqueuer::new(Arc::clone(&ctx.queue), source))
            })
            .register(EventType::MessageQueue, move |ctx| {
                Arc::new(MessageQueueEnqueuer::new(Arc::clone(&ctx.queue), Arc::new(mq_broker)))
            })
            .build();

        let service = ControlService::new(Subscriptions::Local(Arc::new(set)))
            .with_http(Arc::clone(&http))
            .with_sockets(Arc::clone(&sockets))
            .with_change_feed(Arc::clone(&feed))
            .with_broker(broker.clone());
        Fixture {
            queue,
            http,
            sockets,
            feed,
            broker,
            service,
        }
    }

    fn subscribe_request(kind: &str, id: &str, options: serde_json::Value) -> Request<SubscribeRequest> {
        Request::new(SubscribeRequest {
            kind: kind.to_string(),
            target: Some(target(id).into()),
            options_json: options.to_string(),
        })
    }

    async fn next_event(queue: &EventQueue) -> crate::Event {
        tokio::time::timeout(Duration::from_secs(1), queue.pop("worker-1"))
            .await
            .expect("timed out waiting for event")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let f = fixture();
        f.service
            .subscribe(subscribe_request("http", "fn-1", json!({ "method": "GET", "path": "/a" })))
            .await
            .unwrap();
        assert_eq!(f.http.subscriptions().await, vec![target("fn-1")]);

        let status = f
            .service
            .subscribe(subscribe_request("http", "fn-1", json!({ "method": "GET", "path": "/b" })))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);

        f.service
            .unsubscribe(Request::new(UnsubscribeRequest {
                kind: "http".into(),
                target: Some(target("fn-1").into()),
            }))
            .await
            .unwrap();
        assert!(f.http.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_bad_requests() {
        let f = fixture();

        let status = f
            .service
            .subscribe(subscribe_request("bigquery", "fn-1", json!({})))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = f
            .service
            .subscribe(Request::new(SubscribeRequest {
                kind: "http".into(),
                target: Some(target("fn-1").into()),
                options_json: "{not json".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = f
            .service
            .subscribe(Request::new(SubscribeRequest {
                kind: "system".into(),
                target: None,
                options_json: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_dispatch_http_round_trip() {
        let f = fixture();
        f.service
            .subscribe(subscribe_request("http", "fn-1", json!({ "method": "POST", "path": "/orders/{id}" })))
            .await
            .unwrap();

        let service = f.service.clone();
        let call = tokio::spawn(async move {
            service
                .dispatch_http(Request::new(proto::HttpRequest {
                    method: "POST".into(),
                    path: "/orders/42?expand=items".into(),
                    headers: [("X-Trace".to_string(), "t-1".to_string())].into_iter().collect(),
                    body: b"{}".to_vec(),
                }))
                .await
        });

        let event = next_event(&f.queue).await;
        let invocation = event.json_payload().unwrap();
        assert_eq!(invocation["params"]["id"], "42");
        assert_eq!(invocation["query"]["expand"], "items");
        assert_eq!(invocation["headers"]["x-trace"], "t-1");

        let response = crate::enqueuer::http::HttpResponse::text(201, "created");
        assert!(f.http.responses().respond(event.id(), response));
        let reply = call.await.unwrap().unwrap().into_inner();
        assert_eq!(reply.status, 201);
        assert_eq!(reply.body, b"created".to_vec());
    }

    #[tokio::test]
    async fn test_socket_stream_lifecycle() {
        let f = fixture();
        f.service
            .subscribe(subscribe_request("socket", "on-chat", json!({ "event": "chat" })))
            .await
            .unwrap();
        f.service
            .subscribe(subscribe_request("socket", "on-leave", json!({ "event": "disconnect" })))
            .await
            .unwrap();

        let mut stream = f
            .service
            .socket_connect(Request::new(SocketConnectRequest {
                remote_address: "10.1.1.1:9000".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        let client_id = match stream.next().await.unwrap().unwrap().frame {
            Some(socket_frame::Frame::Connected(connected)) => connected.client_id,
            other => panic!("expected connected frame, got {:?}", other),
        };

        let enqueued = f
            .service
            .socket_receive(Request::new(SocketReceiveRequest {
                client_id: client_id.clone(),
                name: "chat".into(),
                data: b"hello".to_vec(),
            }))
            .await
            .unwrap()
            .into_inner()
            .enqueued;
        assert_eq!(enqueued, 1);
        assert_eq!(next_event(&f.queue).await.target().id, "on-chat");

        f.sockets.hub().send(&client_id, "reply", b"hi".to_vec()).unwrap();
        match stream.next().await.unwrap().unwrap().frame {
            Some(socket_frame::Frame::Message(message)) => assert_eq!(message.name, "reply"),
            other => panic!("expected message frame, got {:?}", other),
        }

        // Dropping the stream disconnects the client.
        drop(stream);
        assert_eq!(next_event(&f.queue).await.target().id, "on-leave");
        assert!(!f.sockets.hub().contains(&client_id));
    }

    #[tokio::test]
    async fn test_socket_close_ends_stream() {
        let f = fixture();
        let mut stream = f
            .service
            .socket_connect(Request::new(SocketConnectRequest::default()))
            .await
            .unwrap()
            .into_inner();
        let Some(socket_frame::Frame::Connected(connected)) = stream.next().await.unwrap().unwrap().frame else {
            panic!("expected connected frame");
        };

        f.sockets.hub().close(&connected.client_id).unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap().frame,
            Some(socket_frame::Frame::Close(_))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_change_feeds_database_trigger() {
        let f = fixture();
        f.service
            .subscribe(subscribe_request("database", "fn-1", json!({ "collection": "orders" })))
            .await
            .unwrap();
        assert_eq!(f.feed.watcher_count("orders"), 1);

        f.service
            .publish_change(Request::new(PublishChangeRequest {
                collection: "orders".into(),
                operation: ChangeOperation::Insert as i32,
                document_key_json: r#"{"_id":"o-1"}"#.into(),
                document_json: r#"{"_id":"o-1","total":3}"#.into(),
            }))
            .await
            .unwrap();

        let event = next_event(&f.queue).await;
        assert_eq!(event.event_type(), EventType::Database);
        assert_eq!(event.json_payload().unwrap()["documentKey"], json!({ "_id": "o-1" }));

        let status = f
            .service
            .publish_change(Request::new(PublishChangeRequest {
                collection: "orders".into(),
                operation: 42,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_publish_message_feeds_broker_trigger() {
        let f = fixture();
        f.service
            .subscribe(subscribe_request(
                "rabbitmq",
                "fn-1",
                json!({ "url": "memory://local", "queue": "jobs" }),
            ))
            .await
            .unwrap();

        f.service
            .publish_message(Request::new(PublishMessageRequest {
                url: "memory://local".into(),
                queue: "jobs".into(),
                body: b"work".to_vec(),
                headers: Default::default(),
            }))
            .await
            .unwrap();

        let event = next_event(&f.queue).await;
        assert_eq!(event.event_type(), EventType::MessageQueue);
        assert_eq!(event.json_payload().unwrap()["queue"], "jobs");
        assert_eq!(f.broker.backlog("memory://local", "jobs"), 0);
    }

    #[tokio::test]
    async fn test_ingress_without_backing_trigger_is_rejected() {
        let queue = Arc::new(EventQueue::new());
        let set = EnqueuerSet::builder(DispatchContext::new(queue)).build();
        let service = ControlService::new(Subscriptions::Local(Arc::new(set)));

        let status = service
            .publish_message(Request::new(PublishMessageRequest {
                queue: "jobs".into(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status = service
            .dispatch_http(Request::new(proto::HttpRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
