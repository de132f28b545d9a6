//! End-to-end dispatch: triggers feed the queue, workers pop and answer over gRPC.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::oneshot;

use trigger_dispatch::config::{ClaimStorage, Config};
use trigger_dispatch::enqueuer::database::InMemoryChangeStream;
use trigger_dispatch::enqueuer::http::{HttpInvocation, HttpRequest};
use trigger_dispatch::enqueuer::message_queue::broker::Settlement;
use trigger_dispatch::enqueuer::message_queue::InMemoryBroker;
use trigger_dispatch::proto;
use trigger_dispatch::reducer::{ClaimStore, SqliteClaimStore};
use trigger_dispatch::runtime::Dispatcher;
use futures::StreamExt;
use trigger_dispatch::proto::socket_frame::Frame;
use trigger_dispatch::transport::{ControlClient, WorkerClient};
use trigger_dispatch::utils::clock::{Clock, TokioClock};
use trigger_dispatch::Target;

fn target(id: &str) -> Target {
    Target::new(id, format!("/functions/{}", id), "default")
}

fn test_config() -> Config {
    let mut config = Config::for_test();
    config.reducer.storage = ClaimStorage::Memory;
    config
}

/// A dispatcher serving workers in the background.
struct Running {
    dispatcher: Arc<Dispatcher>,
    addr: String,
    stop: Option<oneshot::Sender<()>>,
    served: tokio::task::JoinHandle<()>,
}

impl Running {
    async fn start(dispatcher: Dispatcher) -> Self {
        let dispatcher = Arc::new(dispatcher);
        let server = dispatcher.bind().await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let served = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .serve(server, async {
                        let _ = stopped.await;
                    })
                    .await
                    .unwrap();
            })
        };
        Self {
            dispatcher,
            addr,
            stop: Some(stop),
            served,
        }
    }

    async fn worker(&self) -> WorkerClient {
        WorkerClient::connect_with_retry(&self.addr).await.unwrap()
    }

    async fn control(&self) -> ControlClient {
        ControlClient::connect_with_retry(&self.addr).await.unwrap()
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.served).await.unwrap();
    }
}

async fn pop(worker: &WorkerClient) -> proto::Event {
    tokio::time::timeout(Duration::from_secs(2), worker.pop("worker-1"))
        .await
        .expect("timed out waiting for event")
        .unwrap()
        .expect("queue closed")
}

#[tokio::test]
async fn test_http_request_answered_by_worker() {
    let running = Running::start(Dispatcher::builder(test_config()).build().await.unwrap()).await;
    running
        .dispatcher
        .subscribe(
            "http",
            target("get-order"),
            json!({ "method": "GET", "path": "/orders/:id" }),
        )
        .await
        .unwrap();

    let http = Arc::clone(running.dispatcher.http());
    let request = tokio::spawn(async move {
        http.dispatch(HttpRequest::new("GET", "/orders/42?expand=lines").with_header("X-Trace", "t-1"))
            .await
    });

    let worker = running.worker().await;
    let event = pop(&worker).await;
    assert_eq!(event.r#type(), proto::EventType::Http);
    assert_eq!(event.target.as_ref().unwrap().cwd, "/functions/get-order");

    let invocation: HttpInvocation = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(invocation.method, "GET");
    assert_eq!(invocation.params["id"], "42");
    assert_eq!(invocation.query["expand"], "lines");
    assert_eq!(invocation.headers["x-trace"], "t-1");

    let headers = HashMap::from([("Content-Type".to_string(), "application/json".to_string())]);
    worker
        .http_respond(&event.id, 200, headers, br#"{"id":42}"#.to_vec())
        .await
        .unwrap();
    worker.ack(&event.id).await.unwrap();

    let response = request.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.headers["content-type"], "application/json");
    assert_eq!(response.body, br#"{"id":42}"#.to_vec());

    running.shutdown().await;
}

#[tokio::test]
async fn test_database_change_reaches_worker() {
    let source = Arc::new(InMemoryChangeStream::new());
    let dispatcher = Dispatcher::builder(test_config())
        .with_change_source(source.clone())
        .build()
        .await
        .unwrap();
    let running = Running::start(dispatcher).await;
    running
        .dispatcher
        .subscribe(
            "database",
            target("on-order"),
            json!({ "collection": "orders", "type": "INSERT" }),
        )
        .await
        .unwrap();

    source.insert("orders", json!({ "_id": "o-1" }), json!({ "_id": "o-1", "total": 10 }));

    let worker = running.worker().await;
    let event = pop(&worker).await;
    let payload: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(payload["type"], "INSERT");
    assert_eq!(payload["documentKey"], json!({ "_id": "o-1" }));
    worker.ack(&event.id).await.unwrap();

    running.shutdown().await;
}

#[tokio::test]
async fn test_broker_delivery_settled_by_worker_outcome() {
    let broker = InMemoryBroker::new();
    let mut config = test_config();
    config.message_queue.default_url = Some("amqp://localhost:5672".into());
    let dispatcher = Dispatcher::builder(config)
        .with_broker(Arc::new(broker.clone()))
        .build()
        .await
        .unwrap();
    let running = Running::start(dispatcher).await;
    running
        .dispatcher
        .subscribe("rabbitmq", target("billing"), json!({ "queueName": "invoices" }))
        .await
        .unwrap();

    broker.publish("amqp://localhost:5672", "invoices", b"first".to_vec(), BTreeMap::new());
    broker.publish("amqp://localhost:5672", "invoices", b"second".to_vec(), BTreeMap::new());

    let worker = running.worker().await;
    let first = pop(&worker).await;
    worker.ack(&first.id).await.unwrap();
    let second = pop(&worker).await;
    worker.error(&second.id, "declined").await.unwrap();

    let settlements = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let settlements = broker.settlements();
            if settlements.len() == 2 {
                return settlements;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(settlements[0].settlement, Settlement::Acked);
    assert_eq!(settlements[1].settlement, Settlement::Nacked { requeue: false });

    running.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_occurrence_fires_once_across_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("claims.db");

    // Just short of a minute boundary, so the first tick comes quickly.
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 59).unwrap() + chrono::Duration::milliseconds(700);
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(start));

    let mut replicas = Vec::new();
    for _ in 0..3 {
        let store: Arc<dyn ClaimStore> = Arc::new(SqliteClaimStore::connect(&db_path).await.unwrap());
        let dispatcher = Dispatcher::builder(test_config())
            .with_claim_store(store)
            .with_clock(Arc::clone(&clock))
            .build()
            .await
            .unwrap();
        dispatcher
            .subscribe("schedule", target("nightly"), json!({ "frequency": "* * * * *" }))
            .await
            .unwrap();
        replicas.push(dispatcher);
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let fired: usize = replicas.iter().map(|d| d.queue().size()).sum();
    assert_eq!(fired, 1);
}

#[tokio::test]
async fn test_shutdown_releases_parked_worker() {
    let running = Running::start(Dispatcher::builder(test_config()).build().await.unwrap()).await;
    let worker = running.worker().await;

    let parked = tokio::spawn(async move { worker.pop("worker-1").await });
    tokio::time::timeout(Duration::from_secs(2), async {
        while running.dispatcher.queue().waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    running.shutdown().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), parked)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Ok(None)));
}

#[tokio::test]
async fn test_shutdown_answers_pending_http_dispatch() {
    let running = Running::start(Dispatcher::builder(test_config()).build().await.unwrap()).await;
    let control = running.control().await;
    control
        .subscribe("http", target("slow"), &json!({ "method": "GET", "path": "/slow" }))
        .await
        .unwrap();

    let request = {
        let control = control.clone();
        tokio::spawn(async move {
            control
                .dispatch_http(proto::HttpRequest {
                    method: "GET".into(),
                    path: "/slow".into(),
                    ..Default::default()
                })
                .await
        })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while running.dispatcher.queue().size() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), running.shutdown())
        .await
        .unwrap();
    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status, 503);
}

#[tokio::test]
async fn test_control_plane_http_ingress() {
    let running = Running::start(Dispatcher::builder(test_config()).build().await.unwrap()).await;
    let control = running.control().await;
    control
        .subscribe("http", target("search"), &json!({ "method": "GET", "path": "/search" }))
        .await
        .unwrap();

    let request = {
        let control = control.clone();
        tokio::spawn(async move {
            control
                .dispatch_http(proto::HttpRequest {
                    method: "GET".into(),
                    path: "/search?q=caf%C3%A9+au+lait".into(),
                    ..Default::default()
                })
                .await
        })
    };

    let worker = running.worker().await;
    let event = pop(&worker).await;
    let invocation: HttpInvocation = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(invocation.query["q"], "café au lait");
    worker
        .http_respond(&event.id, 204, HashMap::new(), Vec::new())
        .await
        .unwrap();
    worker.ack(&event.id).await.unwrap();

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status, 204);

    control
        .unsubscribe("http", target("search"))
        .await
        .unwrap();
    let response = control
        .dispatch_http(proto::HttpRequest {
            method: "GET".into(),
            path: "/search".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.status, 404);

    running.shutdown().await;
}

#[tokio::test]
async fn test_control_plane_change_and_message_ingress() {
    let dispatcher = Dispatcher::builder(test_config())
        .with_change_feed(Arc::new(InMemoryChangeStream::new()))
        .build()
        .await
        .unwrap();
    let running = Running::start(dispatcher).await;
    let control = running.control().await;
    control
        .subscribe("database", target("on-user"), &json!({ "collection": "users" }))
        .await
        .unwrap();
    control
        .subscribe(
            "message_queue",
            target("on-job"),
            &json!({ "url": "memory://jobs", "queue": "work" }),
        )
        .await
        .unwrap();

    control
        .publish_change(
            "users",
            proto::ChangeOperation::Delete,
            &json!({ "_id": "u-1" }),
            None,
        )
        .await
        .unwrap();
    let worker = running.worker().await;
    let event = pop(&worker).await;
    assert_eq!(event.r#type(), proto::EventType::Database);
    let payload: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(payload["type"], "DELETE");
    worker.ack(&event.id).await.unwrap();

    control
        .publish_message("memory://jobs", "work", b"job-1".to_vec(), HashMap::new())
        .await
        .unwrap();
    let event = pop(&worker).await;
    assert_eq!(event.r#type(), proto::EventType::MessageQueue);
    worker.ack(&event.id).await.unwrap();

    let broker = running.dispatcher.broker().unwrap().clone();
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.settlements().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.settlements()[0].settlement, Settlement::Acked);

    running.shutdown().await;
}

#[tokio::test]
async fn test_control_plane_socket_session() {
    let running = Running::start(Dispatcher::builder(test_config()).build().await.unwrap()).await;
    let control = running.control().await;
    control
        .subscribe("firehose", target("chat"), &json!({ "event": "message" }))
        .await
        .unwrap();

    let mut frames = control.socket_connect("192.0.2.10:5000").await.unwrap();
    let client_id = match frames.next().await.unwrap().unwrap().frame {
        Some(Frame::Connected(connected)) => connected.client_id,
        other => panic!("expected connected frame, got {:?}", other),
    };

    let enqueued = control
        .socket_receive(&client_id, "message", b"hello".to_vec())
        .await
        .unwrap();
    assert_eq!(enqueued, 1);

    let worker = running.worker().await;
    let event = pop(&worker).await;
    assert_eq!(event.r#type(), proto::EventType::Socket);
    worker.socket_send(&client_id, "message", b"welcome".to_vec()).await.unwrap();
    worker.socket_close(&client_id).await.unwrap();
    worker.ack(&event.id).await.unwrap();

    match frames.next().await.unwrap().unwrap().frame {
        Some(Frame::Message(message)) => assert_eq!(message.data, b"welcome".to_vec()),
        other => panic!("expected message frame, got {:?}", other),
    }
    assert!(matches!(
        frames.next().await.unwrap().unwrap().frame,
        Some(Frame::Close(_))
    ));
    assert!(frames.next().await.is_none());

    running.shutdown().await;
}
