//! The routing core of the monster mqtt broker: a cluster aware session
//! router with a dual subscription index, eventually consistent cluster
//! maps, a coalescing retention/archive pipeline and runtime controlled
//! archive groups. Wire protocol, transports and persistent store drivers
//! live outside, behind the interfaces in [`store`] and [`cluster`].

#[macro_use]
extern crate log;

pub mod archive;
pub mod cluster;
pub mod router;
pub mod session;
pub mod store;
pub mod subscription;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use archive::controller::{ArchiveController, ArchiveError};
use archive::writer::{ArchiveWriter, DEFAULT_QUEUE_CAPACITY};
use cluster::health::HealthMonitor;
use cluster::maps::{ReplicatedMap, ReplicatedSetMap};
use cluster::{
    BusEvent, ClusterBus, LocalBus, NodeMetricsSnapshot, CLIENT_NODE_MAPPING, TOPIC_NODE_MAPPING,
};
use router::{MessageExpander, PublishWorkerPool, Router, RouterMessage, Shared};
use store::memory::{MemoryConfigStore, MemoryMessageStore, MemorySessionStore};
use store::{ConfigStore, MessageStore, SessionStore, StoreError};
use subscription::IndexStats;

pub use router::Outgoing;
pub use session::{ClientSession, ClientStatus, Subscription};

// request/reply over the bus treats a late answer as no answer
const REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Hand distribution to the worker pool instead of the loop
    pub bulk_publish: bool,
    pub publish_workers: usize,
    pub worker_queue_capacity: usize,
    pub publish_bulk_size: usize,
    pub publish_bulk_timeout_ms: u64,
    pub client_bulk_size: usize,
    pub client_bulk_timeout_ms: u64,
    pub node_bulk_size: usize,
    pub node_bulk_timeout_ms: u64,
    /// Ring of messages parked for a client between connect and ready
    pub inflight_capacity: usize,
    /// Chunk size of the qos 0 fan out; the loop yields between chunks
    pub qos0_chunk: usize,
    /// Upper bound of retained messages delivered per subscribe
    pub retained_fetch_limit: usize,
    /// A filter of exactly `#` can be refused broker wide
    pub allow_root_wildcard: bool,
    pub persist_queue_capacity: usize,
    pub max_expansion_depth: usize,
    /// Topics `<prefix>/<nodeId>/...` short circuit to that node's command
    /// channel
    pub api_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            bulk_publish: false,
            publish_workers: 4,
            worker_queue_capacity: 1000,
            publish_bulk_size: 1000,
            publish_bulk_timeout_ms: 50,
            client_bulk_size: 100,
            client_bulk_timeout_ms: 50,
            node_bulk_size: 1000,
            node_bulk_timeout_ms: 50,
            inflight_capacity: 10_000,
            qos0_chunk: 100,
            retained_fetch_limit: 10_000,
            allow_root_wildcard: true,
            persist_queue_capacity: 100_000,
            max_expansion_depth: 4,
            api_prefix: "$api".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
}

/// Everything a node needs to run, injected at construction. No global
/// state anywhere in the core
pub struct BrokerContext {
    pub node_id: String,
    pub cluster_mode: bool,
    pub config: Config,
    pub bus: Arc<dyn ClusterBus>,
    pub session_store: Arc<dyn SessionStore>,
    pub message_store: Arc<dyn MessageStore>,
    pub config_store: Arc<dyn ConfigStore>,
    pub expander: Option<Arc<dyn MessageExpander>>,
    /// Invoked when the cluster removed this node; the default fails fast
    pub fatal: Arc<dyn Fn() + Send + Sync>,
}

impl BrokerContext {
    /// Single node context on an in-process bus with in-memory stores
    pub fn new<S: Into<String>>(node_id: S) -> BrokerContext {
        BrokerContext {
            node_id: node_id.into(),
            cluster_mode: false,
            config: Config::default(),
            bus: Arc::new(LocalBus::new()),
            session_store: Arc::new(MemorySessionStore::new()),
            message_store: Arc::new(MemoryMessageStore::new()),
            config_store: Arc::new(MemoryConfigStore::new()),
            expander: None,
            fatal: Arc::new(|| std::process::exit(1)),
        }
    }
}

/// A running node: the router loop, replication, archive control and the
/// health monitor
pub struct Broker {
    node_id: String,
    router_tx: mpsc::Sender<RouterMessage>,
    controller: Arc<ArchiveController>,
    health: Arc<HealthMonitor>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    pub async fn start(ctx: BrokerContext) -> Result<Broker, Error> {
        let BrokerContext {
            node_id,
            cluster_mode,
            config,
            bus,
            session_store,
            message_store,
            config_store,
            expander,
            fatal,
        } = ctx;

        let client_node = ReplicatedMap::new(CLIENT_NODE_MAPPING, &node_id, bus.clone());
        let topic_node = ReplicatedSetMap::new(TOPIC_NODE_MAPPING, &node_id, bus.clone());
        let mut tasks = Vec::new();
        tasks.push(client_node.start_replication());
        tasks.push(topic_node.start_replication());

        let (persist_tx, persist_rx) = flume::bounded(config.router.persist_queue_capacity);
        tasks.push(tokio::spawn(router::persist_drainer(
            persist_rx,
            session_store.clone(),
        )));

        let shared = Arc::new(Shared::new(
            node_id.clone(),
            config.router.clone(),
            client_node.clone(),
            topic_node.clone(),
            bus.clone(),
            persist_tx,
        ));

        let retained_writer = ArchiveWriter::spawn(
            "retained",
            DEFAULT_QUEUE_CAPACITY,
            Some(message_store.clone()),
            None,
            None,
        )?;

        let workers = if config.router.bulk_publish {
            Some(PublishWorkerPool::spawn(
                &shared,
                config.router.publish_workers,
                config.router.worker_queue_capacity,
            )?)
        } else {
            None
        };

        let (router, router_tx) = Router::new(
            shared.clone(),
            session_store.clone(),
            message_store,
            retained_writer,
            workers,
            expander,
        );
        tasks.push(tokio::spawn(router.start()));

        let controller = ArchiveController::new(&node_id, bus.clone(), config_store, router_tx.clone());
        tasks.push(controller.spawn_event_listener());
        controller.start_enabled().await?;

        let health = HealthMonitor::new(
            node_id.clone(),
            cluster_mode,
            bus,
            session_store,
            client_node,
            topic_node,
            router_tx.clone(),
            fatal,
        );
        tasks.push(health.spawn());

        info!("broker node {} started", node_id);
        Ok(Broker {
            node_id,
            router_tx,
            controller,
            health,
            shared,
            tasks,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Handle the frontends and embedders talk to the router with
    pub fn handle(&self) -> mpsc::Sender<RouterMessage> {
        self.router_tx.clone()
    }

    pub fn archives(&self) -> &Arc<ArchiveController> {
        &self.controller
    }

    pub fn is_leader(&self) -> bool {
        self.health.is_leader()
    }

    pub fn metrics(&self) -> NodeMetricsSnapshot {
        self.shared.metrics_snapshot()
    }

    pub fn subscription_stats(&self) -> IndexStats {
        match self.shared.subscriptions.read() {
            Ok(index) => index.stats(),
            Err(poisoned) => poisoned.into_inner().stats(),
        }
    }

    /// Nodes currently advertised for a filter
    pub fn topic_nodes(&self, filter: &str) -> Option<HashSet<String>> {
        self.shared.topic_node.get_set(filter)
    }

    /// Node a client currently lives on
    pub fn client_node(&self, client_id: &str) -> Option<String> {
        self.shared.client_node.get(client_id)
    }

    /// Collects the counters of any node over the bus. A missing reply
    /// within the deadline is tolerated and reported as `None`
    pub async fn node_metrics(&self, node_id: &str, reset: bool) -> Option<NodeMetricsSnapshot> {
        let channel = if reset {
            cluster::node_metrics_and_reset(node_id)
        } else {
            cluster::node_metrics(node_id)
        };
        let reply_to = format!("{}.reply.{}", channel, self.node_id);
        let rx = self.shared.bus.subscribe(&reply_to);
        self.shared
            .bus
            .publish(&channel, BusEvent::MetricsRequest { reply_to });

        match tokio::time::timeout(REQUEST_TIMEOUT, rx.recv_async()).await {
            Ok(Ok(BusEvent::MetricsReply(snapshot))) => Some(snapshot),
            _ => None,
        }
    }

    /// `(messages_in, messages_out)` of a session, asked of its owning
    /// node. Missing stats are tolerated
    pub async fn session_metrics(&self, client_id: &str) -> Option<(u64, u64)> {
        let owner = self.client_node(client_id)?;
        let reply_to = cluster::session_metrics(&owner, client_id);
        let rx = self.shared.bus.subscribe(&reply_to);
        self.shared.bus.publish(
            &cluster::node_commands(&owner),
            BusEvent::SessionMetricsRequest {
                client_id: client_id.to_owned(),
                reply_to,
            },
        );

        match tokio::time::timeout(REQUEST_TIMEOUT, rx.recv_async()).await {
            Ok(Ok(BusEvent::SessionMetricsReply { messages_in, messages_out, .. })) => {
                Some((messages_in, messages_out))
            }
            _ => None,
        }
    }

    /// Graceful shutdown: archive groups, then the router with its drain
    /// budget, then the background tasks
    pub async fn shutdown(self) {
        self.controller.stop_all().await;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .router_tx
            .send(RouterMessage::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(Duration::from_secs(10), ack_rx).await;
        }

        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use monster_core::{BrokerMessage, QoS};
    use std::time::Duration;
    use tokio::time;

    async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }

            time::sleep(Duration::from_millis(10)).await;
        }

        panic!("timed out waiting for {}", what);
    }

    fn context(
        node_id: &str,
        cluster_mode: bool,
        bus: Arc<dyn ClusterBus>,
        session_store: Arc<MemorySessionStore>,
        message_store: Arc<MemoryMessageStore>,
    ) -> BrokerContext {
        BrokerContext {
            node_id: node_id.to_owned(),
            cluster_mode,
            config: Config::default(),
            bus,
            session_store,
            message_store,
            config_store: Arc::new(MemoryConfigStore::new()),
            expander: None,
            fatal: Arc::new(|| ()),
        }
    }

    async fn single_node() -> (Broker, Arc<MemorySessionStore>, Arc<MemoryMessageStore>) {
        let session_store = Arc::new(MemorySessionStore::new());
        let message_store = Arc::new(MemoryMessageStore::new());
        let ctx = context(
            "node-a",
            false,
            Arc::new(LocalBus::new()),
            session_store.clone(),
            message_store.clone(),
        );
        (Broker::start(ctx).await.unwrap(), session_store, message_store)
    }

    async fn connect(broker: &Broker, session: ClientSession) -> flume::Receiver<Outgoing> {
        let client_id = session.client_id.clone();
        let (tx, rx) = flume::bounded(1024);
        broker
            .handle()
            .send(RouterMessage::Connect { session, handle: tx })
            .await
            .unwrap();
        broker
            .handle()
            .send(RouterMessage::Ready { client_id })
            .await
            .unwrap();
        rx
    }

    async fn subscribe(broker: &Broker, client_id: &str, filter: &str, qos: QoS) -> bool {
        let (reply, rx) = oneshot::channel();
        broker
            .handle()
            .send(RouterMessage::Subscribe {
                client_id: client_id.to_owned(),
                filter: filter.to_owned(),
                qos,
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn subscribed(broker: &Broker, client_id: &str, filter: &str, qos: QoS) {
        assert!(subscribe(broker, client_id, filter, qos).await);
        // the add is applied once the broadcast comes back around
        wait_until("subscription propagation", || {
            broker
                .topic_nodes(filter)
                .map_or(false, |nodes| nodes.contains(broker.node_id()))
        })
        .await;
    }

    async fn publish(broker: &Broker, message: BrokerMessage) {
        broker
            .handle()
            .send(RouterMessage::Publish(message))
            .await
            .unwrap();
    }

    async fn recv_messages(rx: &flume::Receiver<Outgoing>, count: usize) -> Vec<BrokerMessage> {
        let mut out = Vec::new();
        while out.len() < count {
            let outgoing = time::timeout(Duration::from_secs(2), rx.recv_async())
                .await
                .expect("timed out waiting for a delivery")
                .expect("client handle closed");
            match outgoing {
                Outgoing::Message(message) => out.push(message),
                Outgoing::Bulk(mut messages) => out.append(&mut messages),
            }
        }

        out
    }

    async fn assert_no_more(rx: &flume::Receiver<Outgoing>) {
        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.is_empty(), "unexpected extra deliveries");
    }

    #[tokio::test]
    async fn exact_publish_reaches_the_subscriber_once() {
        let (broker, _, _) = single_node().await;
        let rx = connect(&broker, ClientSession::new("a", "", true)).await;
        subscribed(&broker, "a", "sensors/temp", QoS::AtLeastOnce).await;

        publish(&broker, BrokerMessage::new("b", "sensors/temp", QoS::AtLeastOnce, "42")).await;

        let received = recv_messages(&rx, 1).await;
        assert_eq!(received[0].topic, "sensors/temp");
        assert_eq!(received[0].payload, &b"42"[..]);
        assert_eq!(received[0].qos, QoS::AtLeastOnce);
        assert_no_more(&rx).await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn retained_messages_catch_up_on_subscribe() {
        let (broker, _, message_store) = single_node().await;

        publish(
            &broker,
            BrokerMessage::new("b", "home/living/light", QoS::AtLeastOnce, "on").retain(),
        )
        .await;
        wait_until("retained write", || message_store.get("home/living/light").is_some()).await;

        let rx = connect(&broker, ClientSession::new("a", "", true)).await;
        assert!(subscribe(&broker, "a", "home/#", QoS::AtMostOnce).await);

        let received = recv_messages(&rx, 1).await;
        assert_eq!(received[0].topic, "home/living/light");
        assert_eq!(received[0].payload, &b"on"[..]);
        assert!(received[0].retain);
        assert_eq!(received[0].qos, QoS::AtMostOnce);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn an_empty_retained_payload_deletes_the_value() {
        let (broker, _, message_store) = single_node().await;

        publish(
            &broker,
            BrokerMessage::new("b", "home/living/light", QoS::AtMostOnce, "on").retain(),
        )
        .await;
        wait_until("retained write", || message_store.get("home/living/light").is_some()).await;

        publish(
            &broker,
            BrokerMessage::new("b", "home/living/light", QoS::AtMostOnce, "").retain(),
        )
        .await;
        wait_until("retained delete", || message_store.get("home/living/light").is_none()).await;

        // a fresh subscriber sees nothing for the topic
        let rx = connect(&broker, ClientSession::new("a", "", true)).await;
        assert!(subscribe(&broker, "a", "home/#", QoS::AtMostOnce).await);
        assert_no_more(&rx).await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn subscriber_qos_caps_the_delivered_qos() {
        let (broker, session_store, _) = single_node().await;
        let rx = connect(&broker, ClientSession::new("a", "", false)).await;
        subscribed(&broker, "a", "x/+", QoS::AtMostOnce).await;

        publish(&broker, BrokerMessage::new("b", "x/y", QoS::ExactlyOnce, "p")).await;

        let received = recv_messages(&rx, 1).await;
        assert_eq!(received[0].qos, QoS::AtMostOnce);
        // a qos 0 delivery never touches the durable queue
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session_store.queued_len("a"), 0);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn publishes_cross_the_cluster_to_remote_subscribers() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let session_store = Arc::new(MemorySessionStore::new());
        let n1 = Broker::start(context(
            "n1",
            true,
            bus.clone(),
            session_store.clone(),
            Arc::new(MemoryMessageStore::new()),
        ))
        .await
        .unwrap();
        let n2 = Broker::start(context(
            "n2",
            true,
            bus,
            session_store,
            Arc::new(MemoryMessageStore::new()),
        ))
        .await
        .unwrap();

        let rx = connect(&n1, ClientSession::new("c1", "", true)).await;
        assert!(subscribe(&n1, "c1", "a/b", QoS::AtLeastOnce).await);
        // the subscription has to reach the publishing node
        wait_until("cross node propagation", || {
            n2.topic_nodes("a/b").map_or(false, |nodes| nodes.contains("n1"))
        })
        .await;

        publish(&n2, BrokerMessage::new("c2", "a/b", QoS::AtLeastOnce, "p")).await;

        let received = recv_messages(&rx, 1).await;
        assert_eq!(received[0].payload, &b"p"[..]);
        assert_no_more(&rx).await;
        n1.shutdown().await;
        n2.shutdown().await;
    }

    #[tokio::test]
    async fn offline_persistent_sessions_queue_and_redeliver_in_order() {
        let (broker, session_store, _) = single_node().await;
        let rx = connect(&broker, ClientSession::new("c", "", false)).await;
        subscribed(&broker, "c", "t", QoS::AtLeastOnce).await;

        broker
            .handle()
            .send(RouterMessage::Disconnect {
                client_id: "c".to_owned(),
                execute_will: false,
            })
            .await
            .unwrap();
        drop(rx);

        for i in 0..3 {
            publish(&broker, BrokerMessage::new("b", "t", QoS::AtLeastOnce, format!("m{}", i))).await;
        }
        wait_until("durable queueing", || session_store.queued_len("c") == 3).await;

        let rx = connect(&broker, ClientSession::new("c", "", false)).await;
        let received = recv_messages(&rx, 3).await;
        let payloads: Vec<String> = received
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2"]);

        // live traffic flows after the backlog
        publish(&broker, BrokerMessage::new("b", "t", QoS::AtLeastOnce, "live")).await;
        let received = recv_messages(&rx, 1).await;
        assert_eq!(received[0].payload, &b"live"[..]);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn messages_wait_in_flight_until_the_client_is_ready() {
        let (broker, _, _) = single_node().await;

        // connected but not yet ready
        let (tx, rx) = flume::bounded(1024);
        broker
            .handle()
            .send(RouterMessage::Connect {
                session: ClientSession::new("a", "", true),
                handle: tx,
            })
            .await
            .unwrap();
        subscribed(&broker, "a", "t", QoS::AtLeastOnce).await;

        publish(&broker, BrokerMessage::new("b", "t", QoS::AtLeastOnce, "parked")).await;
        time::sleep(Duration::from_millis(150)).await;
        assert!(rx.is_empty());

        broker
            .handle()
            .send(RouterMessage::Ready { client_id: "a".to_owned() })
            .await
            .unwrap();
        let received = recv_messages(&rx, 1).await;
        assert_eq!(received[0].payload, &b"parked"[..]);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_returns_the_index_and_maps_to_their_prior_state() {
        let (broker, _, _) = single_node().await;
        let _rx = connect(&broker, ClientSession::new("a", "", true)).await;
        subscribed(&broker, "a", "a/b", QoS::AtLeastOnce).await;

        let (reply, reply_rx) = oneshot::channel();
        broker
            .handle()
            .send(RouterMessage::Unsubscribe {
                client_id: "a".to_owned(),
                filter: "a/b".to_owned(),
                reply,
            })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap());

        wait_until("map cleanup", || broker.topic_nodes("a/b").is_none()).await;
        wait_until("index cleanup", || {
            broker.subscription_stats() == IndexStats::default()
        })
        .await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn dead_node_cleanup_publishes_wills_and_purges_the_maps() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let session_store = Arc::new(MemorySessionStore::new());
        let n1 = Broker::start(context(
            "n1",
            true,
            bus.clone(),
            session_store.clone(),
            Arc::new(MemoryMessageStore::new()),
        ))
        .await
        .unwrap();
        let n2 = Broker::start(context(
            "n2",
            true,
            bus.clone(),
            session_store.clone(),
            Arc::new(MemoryMessageStore::new()),
        ))
        .await
        .unwrap();
        wait_until("leader election", || n1.is_leader()).await;

        let watcher = connect(&n1, ClientSession::new("watcher", "", true)).await;
        subscribed(&n1, "watcher", "wills/c2", QoS::AtLeastOnce).await;

        let will = BrokerMessage::new("c2", "wills/c2", QoS::AtLeastOnce, "gone");
        let _c2 = connect(&n2, ClientSession::new("c2", "", false).with_will(will)).await;
        wait_until("client mapping", || n1.client_node("c2").as_deref() == Some("n2")).await;

        bus.publish(cluster::MEMBERSHIP, cluster::BusEvent::NodeRemoved("n2".to_owned()));

        let received = recv_messages(&watcher, 1).await;
        assert_eq!(received[0].payload, &b"gone"[..]);
        assert_no_more(&watcher).await;

        wait_until("client map purge", || n1.client_node("c2").is_none()).await;
        // the persistent session survives, paused
        assert!(session_store.queued_len("c2") == 0);
        n1.shutdown().await;
        n2.shutdown().await;
    }

    #[tokio::test]
    async fn a_single_leader_survives_node_loss() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let session_store = Arc::new(MemorySessionStore::new());
        let n1 = Broker::start(context(
            "n1",
            true,
            bus.clone(),
            session_store.clone(),
            Arc::new(MemoryMessageStore::new()),
        ))
        .await
        .unwrap();
        let n2 = Broker::start(context(
            "n2",
            true,
            bus.clone(),
            session_store,
            Arc::new(MemoryMessageStore::new()),
        ))
        .await
        .unwrap();

        wait_until("initial election", || n1.is_leader() ^ n2.is_leader()).await;
        assert!(n1.is_leader());
        assert!(!n2.is_leader());

        bus.publish(cluster::MEMBERSHIP, cluster::BusEvent::NodeRemoved("n1".to_owned()));
        wait_until("failover", || n2.is_leader()).await;
        n1.shutdown().await;
        n2.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_travel_the_bus_with_a_tolerated_miss() {
        let (broker, _, _) = single_node().await;
        let rx = connect(&broker, ClientSession::new("a", "", true)).await;
        subscribed(&broker, "a", "t", QoS::AtLeastOnce).await;

        publish(&broker, BrokerMessage::new("b", "t", QoS::AtLeastOnce, "x")).await;
        let _ = recv_messages(&rx, 1).await;

        let snapshot = broker.node_metrics("node-a", false).await.unwrap();
        assert!(snapshot.messages_in >= 1);
        assert!(snapshot.messages_out >= 1);

        let (_, messages_out) = broker.session_metrics("a").await.unwrap();
        assert!(messages_out >= 1);

        // nobody answers for an unmapped client
        assert!(broker.session_metrics("ghost").await.is_none());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn bulk_publish_mode_delivers_exactly_once() {
        let session_store = Arc::new(MemorySessionStore::new());
        let message_store = Arc::new(MemoryMessageStore::new());
        let mut ctx = context(
            "node-a",
            false,
            Arc::new(LocalBus::new()),
            session_store,
            message_store,
        );
        ctx.config.router.bulk_publish = true;
        ctx.config.router.publish_workers = 1;
        let broker = Broker::start(ctx).await.unwrap();

        let rx = connect(&broker, ClientSession::new("a", "", true)).await;
        subscribed(&broker, "a", "sensors/+", QoS::AtLeastOnce).await;

        for i in 0..5 {
            publish(
                &broker,
                BrokerMessage::new("b", "sensors/temp", QoS::AtLeastOnce, format!("m{}", i)),
            )
            .await;
        }

        let received = recv_messages(&rx, 5).await;
        let payloads: Vec<String> = received
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_no_more(&rx).await;
        broker.shutdown().await;
    }
}
