//! Process assembly.
//!
//! [`DispatcherBuilder`] turns a [`Config`] plus the external collaborators
//! (change source, broker, replication coordinator) into a [`Dispatcher`]:
//! the event queue, the job reducer, one enqueuer per trigger kind and the
//! gRPC endpoint serving workers and the control plane.
//!
//! ```ignore
//! let dispatcher = Dispatcher::builder(Config::load(None)?)
//!     .with_change_source(source)
//!     .build()
//!     .await?;
//! dispatcher.run_until(tokio::signal::ctrl_c().map(|_| ())).await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::{ClaimStorage, Config, ConfigError};
use crate::enqueuer::database::{ChangeSource, InMemoryChangeStream};
use crate::enqueuer::message_queue::{InMemoryBroker, MessageBroker};
use crate::enqueuer::{
    DatabaseEnqueuer, DispatchContext, EnqueueError, EnqueuerSet, HttpEnqueuer, MessageQueueEnqueuer,
    ScheduleEnqueuer, SocketEnqueuer, SystemEnqueuer,
};
use crate::event::{EventType, Target};
use crate::queue::EventQueue;
use crate::reducer::{ClaimReaper, ClaimStore, JobReducer, MemoryClaimStore, ReapFilter, ReducerError};
use crate::replication::{ReplicatedEnqueuers, ReplicationCoordinator, ReplicationError, Subscriptions};
use crate::transport::{ControlService, DispatchServer, TransportError, WorkerService};
use crate::utils::clock::{Clock, SystemClock};

/// Result type for dispatcher assembly and serving.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reducer(#[from] ReducerError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct DispatcherBuilder {
    config: Config,
    change_source: Option<Arc<dyn ChangeSource>>,
    change_feed: Option<Arc<InMemoryChangeStream>>,
    broker: Option<Arc<dyn MessageBroker>>,
    coordinator: Option<Arc<dyn ReplicationCoordinator>>,
    claim_store: Option<Arc<dyn ClaimStore>>,
    clock: Arc<dyn Clock>,
}

impl DispatcherBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            change_source: None,
            change_feed: None,
            broker: None,
            coordinator: None,
            claim_store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Enable the database-change trigger over `source`.
    pub fn with_change_source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.change_source = Some(source);
        self
    }

    /// Enable the database-change trigger over an in-process feed that the
    /// control plane's `PublishChange` writes into.
    pub fn with_change_feed(mut self, feed: Arc<InMemoryChangeStream>) -> Self {
        self.change_source = Some(feed.clone());
        self.change_feed = Some(feed);
        self
    }

    /// Broker for the message-queue trigger.
    ///
    /// When unset, an in-memory broker is used and the control plane's
    /// `PublishMessage` publishes into it.
    pub fn with_broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Mirror subscriptions to other replicas.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn ReplicationCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Claim store overriding the configured one.
    pub fn with_claim_store(mut self, store: Arc<dyn ClaimStore>) -> Self {
        self.claim_store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn claim_store(&self) -> Result<Arc<dyn ClaimStore>> {
        if let Some(store) = &self.claim_store {
            return Ok(Arc::clone(store));
        }
        match self.config.reducer.storage {
            ClaimStorage::Memory => Ok(Arc::new(MemoryClaimStore::new())),
            #[cfg(feature = "sqlite")]
            ClaimStorage::Sqlite => {
                let store = crate::reducer::SqliteClaimStore::connect(&self.config.reducer.sqlite_path).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "sqlite"))]
            ClaimStorage::Sqlite => Err(ConfigError::Invalid(
                "reducer.storage is sqlite but sqlite support is not compiled in".to_string(),
            )
            .into()),
        }
    }

    pub async fn build(self) -> Result<Dispatcher> {
        self.config.validate()?;

        let queue = Arc::new(EventQueue::with_completion_capacity(
            self.config.queue.completion_capacity,
        ));

        let reducer = if self.config.reducer.enabled {
            let store = self.claim_store().await?;
            Some(Arc::new(
                JobReducer::new(store)
                    .with_validity(self.config.reducer.validity())
                    .with_clock(Arc::clone(&self.clock)),
            ))
        } else {
            None
        };

        let mut context = DispatchContext::new(Arc::clone(&queue)).with_clock(Arc::clone(&self.clock));
        if let Some(reducer) = &reducer {
            context = context.with_reducer(Arc::clone(reducer));
        }

        let http = Arc::new(
            HttpEnqueuer::new(Arc::clone(&queue)).with_response_timeout(self.config.http.response_timeout()),
        );
        let sockets = Arc::new(SocketEnqueuer::new(Arc::clone(&queue)));
        let (broker, built_in_broker): (Arc<dyn MessageBroker>, _) = match self.broker.clone() {
            Some(broker) => (broker, None),
            None => {
                let broker = InMemoryBroker::new();
                (Arc::new(broker.clone()), Some(broker))
            }
        };

        let timezone = self.config.schedule.timezone()?;
        let debounce = self.config.system.debounce();
        let default_url = self.config.message_queue.default_url.clone();

        let mut builder = EnqueuerSet::builder(context)
            .with_enqueuer(http.clone())
            .with_enqueuer(sockets.clone())
            .register(EventType::Schedule, move |ctx| {
                Arc::new(ScheduleEnqueuer::new(ctx).with_default_timezone(timezone))
            })
            .register(EventType::System, move |ctx| {
                Arc::new(SystemEnqueuer::new(Arc::clone(&ctx.queue)).with_debounce(debounce))
            })
            .register(EventType::MessageQueue, move |ctx| {
                let enqueuer = MessageQueueEnqueuer::new(Arc::clone(&ctx.queue), broker);
                Arc::new(match default_url {
                    Some(url) => enqueuer.with_default_url(url),
                    None => enqueuer,
                })
            });
        if let Some(source) = self.change_source.clone() {
            let buffer = self.config.database.signal_buffer;
            builder = builder.register(EventType::Database, move |ctx| {
                Arc::new(DatabaseEnqueuer::with_signal_buffer(
                    Arc::clone(&ctx.queue),
                    source,
                    buffer,
                ))
            });
        }
        let enqueuers = Arc::new(builder.build());

        let subscriptions = match self.coordinator.clone() {
            Some(coordinator) => Subscriptions::Replicated(Arc::new(
                ReplicatedEnqueuers::new(Arc::clone(&enqueuers), coordinator).await?,
            )),
            None => Subscriptions::Local(Arc::clone(&enqueuers)),
        };
        let replica_id = match &subscriptions {
            Subscriptions::Replicated(replicated) => replicated.replica_id().to_string(),
            Subscriptions::Local(_) => self
                .config
                .replication
                .replica_id
                .clone()
                .unwrap_or_else(|| format!("replica-{}", Uuid::new_v4())),
        };

        info!(
            replica_id = %replica_id,
            kinds = ?enqueuers.kinds().map(|kind| kind.as_str()).collect::<Vec<_>>(),
            reducer = reducer.is_some(),
            replicated = subscriptions.is_replicated(),
            change_feed = self.change_feed.is_some(),
            built_in_broker = built_in_broker.is_some(),
            "Dispatcher assembled"
        );

        Ok(Dispatcher {
            config: self.config,
            replica_id,
            queue,
            reducer,
            enqueuers,
            subscriptions,
            http,
            sockets,
            change_feed: self.change_feed,
            broker: built_in_broker,
        })
    }
}

pub struct Dispatcher {
    config: Config,
    replica_id: String,
    queue: Arc<EventQueue>,
    reducer: Option<Arc<JobReducer>>,
    enqueuers: Arc<EnqueuerSet>,
    subscriptions: Subscriptions,
    http: Arc<HttpEnqueuer>,
    sockets: Arc<SocketEnqueuer>,
    change_feed: Option<Arc<InMemoryChangeStream>>,
    broker: Option<InMemoryBroker>,
}

impl Dispatcher {
    pub fn builder(config: Config) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn reducer(&self) -> Option<&Arc<JobReducer>> {
        self.reducer.as_ref()
    }

    pub fn enqueuers(&self) -> &Arc<EnqueuerSet> {
        &self.enqueuers
    }

    /// HTTP trigger, for the host HTTP framework to dispatch requests into.
    pub fn http(&self) -> &Arc<HttpEnqueuer> {
        &self.http
    }

    /// Socket trigger, for the host socket server to report clients through.
    pub fn sockets(&self) -> &Arc<SocketEnqueuer> {
        &self.sockets
    }

    /// Built-in broker, when no external one was supplied.
    pub fn broker(&self) -> Option<&InMemoryBroker> {
        self.broker.as_ref()
    }

    /// Subscribe a target, mirroring the call when replication is enabled.
    pub async fn subscribe(
        &self,
        kind: &str,
        target: Target,
        options: serde_json::Value,
    ) -> std::result::Result<(), EnqueueError> {
        self.subscriptions.subscribe(kind, target, options).await
    }

    pub async fn unsubscribe(&self, kind: &str, target: &Target) -> std::result::Result<(), EnqueueError> {
        self.subscriptions.unsubscribe(kind, target).await
    }

    /// Control-plane service backed by this dispatcher.
    pub fn control_service(&self) -> ControlService {
        let mut control = ControlService::new(self.subscriptions.clone())
            .with_http(Arc::clone(&self.http))
            .with_sockets(Arc::clone(&self.sockets));
        if let Some(feed) = &self.change_feed {
            control = control.with_change_feed(Arc::clone(feed));
        }
        if let Some(broker) = &self.broker {
            control = control.with_broker(broker.clone());
        }
        control
    }

    /// Bind the gRPC endpoint at the configured address.
    pub async fn bind(&self) -> Result<DispatchServer> {
        let worker = WorkerService::new(Arc::clone(&self.queue))
            .with_http(self.http.responses())
            .with_sockets(self.sockets.hub().clone());
        let server = DispatchServer::bind(&self.config.server.addr(), worker)
            .await?
            .with_control(self.control_service());
        Ok(server)
    }

    /// Tear down every subscription, release waiting HTTP requests and socket
    /// streams, and close the queue so parked pops return empty.
    async fn stop(&self) {
        if self.queue.is_closed() {
            return;
        }
        info!(replica_id = %self.replica_id, "Shutting down dispatcher");
        self.enqueuers.shutdown().await;
        self.queue.close();
    }

    /// Serve on `server` until `shutdown` resolves.
    ///
    /// Teardown runs before the endpoint drains, so in-flight pops and HTTP
    /// dispatches complete instead of holding the endpoint open.
    pub async fn serve<F>(&self, server: DispatchServer, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let reaper = self.reducer.as_ref().map(|reducer| {
            ClaimReaper::new(
                Arc::clone(reducer),
                ReapFilter::older_than(self.config.reducer.retention()),
            )
            .with_interval(self.config.reducer.reap_interval())
            .spawn()
        });

        info!(replica_id = %self.replica_id, "Dispatcher running");
        let served = server
            .serve_with_shutdown(async {
                shutdown.await;
                self.stop().await;
            })
            .await;

        if let Some(reaper) = reaper {
            reaper.abort();
        }
        self.stop().await;
        Ok(served?)
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = self.bind().await?;
        self.serve(server, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueuer::database::InMemoryChangeStream;
    use crate::replication::ChannelCoordinator;
    use crate::test_utils::target;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_builds_every_kind_with_change_source() {
        let dispatcher = Dispatcher::builder(Config::for_test())
            .with_change_source(Arc::new(InMemoryChangeStream::new()))
            .build()
            .await
            .unwrap();

        let kinds: Vec<_> = dispatcher.enqueuers().kinds().collect();
        assert_eq!(kinds, EventType::ALL.to_vec());
        assert!(dispatcher.reducer().is_some());
        assert!(dispatcher.replica_id().starts_with("replica-"));
    }

    #[tokio::test]
    async fn test_database_kind_requires_change_source() {
        let dispatcher = Dispatcher::builder(Config::for_test()).build().await.unwrap();
        let err = dispatcher
            .subscribe("database", target("fn-1"), json!({ "collection": "orders" }))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn test_reducer_can_be_disabled() {
        let mut config = Config::for_test();
        config.reducer.enabled = false;
        let dispatcher = Dispatcher::builder(config).build().await.unwrap();
        assert!(dispatcher.reducer().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::for_test();
        config.schedule.default_timezone = "Nowhere/Special".into();
        let err = Dispatcher::builder(config).build().await.err().unwrap();
        assert!(matches!(err, DispatchError::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_replicated_subscribe_reaches_peer() {
        let network = ChannelCoordinator::new("replica-a");
        let peer_coordinator = network.replica("replica-b");
        let a = Dispatcher::builder(Config::for_test())
            .with_coordinator(Arc::new(network))
            .build()
            .await
            .unwrap();
        let b = Dispatcher::builder(Config::for_test())
            .with_coordinator(Arc::new(peer_coordinator))
            .build()
            .await
            .unwrap();
        assert_eq!(a.replica_id(), "replica-a");

        a.subscribe("socket", target("fn-1"), json!({ "event": "connection" }))
            .await
            .unwrap();

        let peer_socket = b.enqueuers().get(EventType::Socket).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while peer_socket.subscriptions().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_subscriptions_and_closes_queue() {
        let dispatcher = Dispatcher::builder(Config::for_test()).build().await.unwrap();
        dispatcher
            .subscribe("system", target("fn-1"), json!({}))
            .await
            .unwrap();

        let server = dispatcher.bind().await.unwrap();
        dispatcher.serve(server, async {}).await.unwrap();

        assert!(dispatcher.queue().is_closed());
        let system = dispatcher.enqueuers().get(EventType::System).unwrap();
        assert!(system.subscriptions().await.is_empty());
    }
}
