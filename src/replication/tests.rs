use std::time::Duration;

use serde_json::json;

use super::*;
use crate::enqueuer::{DispatchContext, Enqueuer, SocketEnqueuer};
use crate::event::EventType;
use crate::queue::EventQueue;
use crate::test_utils::target;

struct Replica {
    socket: Arc<SocketEnqueuer>,
    replicated: ReplicatedEnqueuers,
}

async fn replica(coordinator: ChannelCoordinator) -> Replica {
    let queue = Arc::new(EventQueue::new());
    let socket = Arc::new(SocketEnqueuer::new(Arc::clone(&queue)));
    let set = EnqueuerSet::builder(DispatchContext::new(queue))
        .with_enqueuer(socket.clone())
        .build();
    let replicated = ReplicatedEnqueuers::new(Arc::new(set), Arc::new(coordinator))
        .await
        .unwrap();
    Replica { socket, replicated }
}

async fn wait_for_subscriptions(enqueuer: &dyn Enqueuer, expected: usize) {
    for _ in 0..100 {
        if enqueuer.subscriptions().await.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {} subscriptions, found {}",
        expected,
        enqueuer.subscriptions().await.len()
    );
}

#[tokio::test]
async fn test_subscribe_and_unsubscribe_converge_across_replicas() {
    let network = ChannelCoordinator::new("replica-a");
    let b_coordinator = network.replica("replica-b");
    let c_coordinator = network.replica("replica-c");
    let a = replica(network).await;
    let b = replica(b_coordinator).await;
    let c = replica(c_coordinator).await;

    a.replicated
        .subscribe("firehose", target("fn-1"), json!({ "event": "chat" }))
        .await
        .unwrap();

    wait_for_subscriptions(b.socket.as_ref(), 1).await;
    wait_for_subscriptions(c.socket.as_ref(), 1).await;
    assert_eq!(a.socket.subscriptions().await, vec![target("fn-1")]);

    b.replicated.unsubscribe("socket", &target("fn-1")).await.unwrap();

    wait_for_subscriptions(a.socket.as_ref(), 0).await;
    wait_for_subscriptions(c.socket.as_ref(), 0).await;
}

#[tokio::test]
async fn test_local_failure_is_not_mirrored() {
    let network = ChannelCoordinator::new("replica-a");
    let b_coordinator = network.replica("replica-b");
    let a = replica(network).await;
    let b = replica(b_coordinator).await;

    let err = a
        .replicated
        .subscribe("socket", target("fn-1"), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::InvalidOptions { .. }));

    let err = a
        .replicated
        .subscribe("bigquery", target("fn-1"), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::UnknownKind(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(b.socket.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_subscriptions_are_tolerated() {
    let network = ChannelCoordinator::new("replica-a");
    let b_coordinator = network.replica("replica-b");
    let a = replica(network).await;
    let b = replica(b_coordinator).await;

    a.replicated
        .subscribe("socket", target("fn-1"), json!({ "event": "chat" }))
        .await
        .unwrap();
    b.replicated
        .subscribe("socket", target("fn-1"), json!({ "event": "chat" }))
        .await
        .unwrap_or(());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.socket.subscriptions().await.len(), 1);
    assert_eq!(b.socket.subscriptions().await.len(), 1);
}

#[tokio::test]
async fn test_publish_requires_registration() {
    let coordinator = ChannelCoordinator::new("replica-a");
    let call = ReplicatedCall {
        origin: "replica-a".into(),
        instance: "functions".into(),
        method: "register".into(),
        args: json!({}),
    };

    let err = coordinator.publish(call.clone()).await.unwrap_err();
    assert!(matches!(err, ReplicationError::Unregistered { .. }));

    coordinator.register("functions", &["register"]).await.unwrap();
    let mut incoming = coordinator.incoming();
    coordinator.publish(call.clone()).await.unwrap();
    assert_eq!(incoming.next().await, Some(call));
}

#[tokio::test]
async fn test_own_calls_are_not_reapplied() {
    let coordinator = ChannelCoordinator::new("replica-a");
    let observer = coordinator.replica("observer");
    let mut observed = observer.incoming();
    let a = replica(coordinator).await;

    a.replicated
        .subscribe("socket", target("fn-1"), json!({ "event": "chat" }))
        .await
        .unwrap();

    let call = observed.next().await.unwrap();
    assert_eq!(call.origin, "replica-a");
    assert_eq!(call.method, SUBSCRIBE);
    assert_eq!(call.args["kind"], "socket");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.socket.subscriptions().await.len(), 1);
    assert_eq!(a.replicated.set().get(EventType::Socket).map(|e| e.kind()), Some(EventType::Socket));
}
