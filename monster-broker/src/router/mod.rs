//! The session router. One event loop task owns the hot path: commands from
//! the local frontends, cluster bus events and the flush timer. Dedicated
//! worker threads take over distribution when bulk publish processing is
//! enabled.

mod bulk;
mod clients;
mod workers;

use monster_core::{matches, now_millis, valid_filter, BrokerMessage, QoS};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::archive::writer::ArchiveWriter;
use crate::archive::ArchiveGroup;
use crate::cluster::{
    self, node_commands, node_messages, BusEvent, ClusterBus, NodeMetricsSnapshot,
};
use crate::session::{ClientSession, ClientStatus, Subscription};
use crate::store::{MessageStore, SessionStore, StoreError};
use crate::subscription::SubscriptionIndex;
use crate::RouterConfig;

use bulk::BulkBuffers;
use clients::{LocalClient, RouterMetrics};
pub(crate) use workers::PublishWorkerPool;

const COMMAND_CHANNEL_CAPACITY: usize = 1000;
const FLUSH_TICK: Duration = Duration::from_millis(25);

/// What the frontend receives on a client handle
#[derive(Debug, Clone)]
pub enum Outgoing {
    Message(BrokerMessage),
    Bulk(Vec<BrokerMessage>),
}

impl Outgoing {
    fn len(&self) -> usize {
        match self {
            Outgoing::Message(_) => 1,
            Outgoing::Bulk(messages) => messages.len(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Hook expanding one published message into derived messages, e.g. a
/// metric-per-topic fan out of an encoded device payload. The router bounds
/// the recursion depth on top of whatever the expander guarantees
pub trait MessageExpander: Send + Sync {
    fn matches(&self, topic: &str) -> bool;
    fn expand(&self, message: &BrokerMessage) -> Result<Vec<BrokerMessage>, ExpandError>;
}

/// Router message to orchestrate data between the frontends, the archive
/// controller and the routing core
#[derive(Debug)]
pub enum RouterMessage {
    /// Accepted connect plus the handle messages are delivered on
    Connect {
        session: ClientSession,
        handle: flume::Sender<Outgoing>,
    },
    /// The client drained its backlog and is ready for live traffic
    Ready { client_id: String },
    Publish(BrokerMessage),
    Subscribe {
        client_id: String,
        filter: String,
        qos: QoS,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        client_id: String,
        filter: String,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        client_id: String,
        execute_will: bool,
    },
    /// Explicit removal of a session regardless of clean flag
    RemoveClient { client_id: String },
    RegisterArchive(Arc<ArchiveGroup>),
    DeregisterArchive(String),
    Shutdown(oneshot::Sender<()>),
}

/// Durable writes queued off the hot path and drained by their own task.
/// Overflow is data loss, never a crash
#[derive(Debug)]
pub(crate) enum PersistJob {
    AddSubscriptions(Vec<Subscription>),
    DelSubscriptions(Vec<(String, String)>),
    EnqueueMessages(Vec<(BrokerMessage, Vec<String>)>),
    RemoveMessages(Vec<(String, String)>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared between the router loop and the publish workers. The loop
/// is the only writer of the subscription index and the status map; workers
/// read through the locks
pub(crate) struct Shared {
    pub node_id: String,
    pub config: RouterConfig,
    pub subscriptions: RwLock<SubscriptionIndex>,
    pub statuses: RwLock<HashMap<String, ClientStatus>>,
    pub locals: Mutex<HashMap<String, LocalClient>>,
    pub client_buffers: BulkBuffers,
    pub node_buffers: BulkBuffers,
    pub client_node: Arc<crate::cluster::maps::ReplicatedMap>,
    pub topic_node: Arc<crate::cluster::maps::ReplicatedSetMap>,
    pub bus: Arc<dyn ClusterBus>,
    pub persist_tx: flume::Sender<PersistJob>,
    pub metrics: RouterMetrics,
}

impl Shared {
    pub fn new(
        node_id: String,
        config: RouterConfig,
        client_node: Arc<crate::cluster::maps::ReplicatedMap>,
        topic_node: Arc<crate::cluster::maps::ReplicatedSetMap>,
        bus: Arc<dyn ClusterBus>,
        persist_tx: flume::Sender<PersistJob>,
    ) -> Shared {
        let client_buffers = BulkBuffers::new(
            config.client_bulk_size,
            Duration::from_millis(config.client_bulk_timeout_ms),
            config.client_bulk_size * 4,
        );
        let node_buffers = BulkBuffers::new(
            config.node_bulk_size,
            Duration::from_millis(config.node_bulk_timeout_ms),
            config.node_bulk_size * 4,
        );

        Shared {
            node_id,
            config,
            subscriptions: RwLock::new(SubscriptionIndex::new()),
            statuses: RwLock::new(HashMap::new()),
            locals: Mutex::new(HashMap::new()),
            client_buffers,
            node_buffers,
            client_node,
            topic_node,
            bus,
            persist_tx,
            metrics: RouterMetrics::default(),
        }
    }

    pub fn status_of(&self, client_id: &str) -> ClientStatus {
        read(&self.statuses)
            .get(client_id)
            .copied()
            .unwrap_or(ClientStatus::Unknown)
    }

    pub fn metrics_snapshot(&self) -> NodeMetricsSnapshot {
        let clients = lock(&self.locals).len();
        self.metrics.snapshot(clients)
    }

    /// Subscribers of the topic whose owning node is this one (or is not
    /// mapped yet)
    pub fn local_subscribers(&self, topic: &str) -> Vec<(String, QoS)> {
        read(&self.subscriptions)
            .find_all_subscribers(topic)
            .into_iter()
            .filter(|(client_id, _)| {
                self.client_node
                    .get(client_id)
                    .map_or(true, |node| node == self.node_id)
            })
            .collect()
    }

    /// Nodes that have at least one subscriber for the topic
    pub fn target_nodes(&self, topic: &str) -> HashSet<String> {
        let mut nodes = HashSet::new();
        for filter in self.topic_node.keys() {
            if matches(topic, &filter) {
                if let Some(set) = self.topic_node.get_set(&filter) {
                    nodes.extend(set);
                }
            }
        }

        nodes
    }

    pub fn persist(&self, job: PersistJob) {
        if let Err(flume::TrySendError::Full(job)) = self.persist_tx.try_send(job) {
            error!("durable queue full. Dropping {:?}", job);
            self.metrics.incr_dropped(1);
        }
    }

    /// Sends straight to a connected client's handle. Gives the value back
    /// when the client is absent, paused or its ring is full
    fn send_direct(&self, client_id: &str, outgoing: Outgoing) -> Result<(), Outgoing> {
        let (handle, session_metrics) = {
            let locals = lock(&self.locals);
            match locals.get(client_id).and_then(|local| {
                local
                    .handle
                    .as_ref()
                    .map(|handle| (handle.clone(), local.metrics.clone()))
            }) {
                Some(found) => found,
                None => return Err(outgoing),
            }
        };

        let count = outgoing.len() as u64;
        match handle.try_send(outgoing) {
            Ok(()) => {
                self.metrics.incr_out(count);
                session_metrics.incr_out(count);
                Ok(())
            }
            Err(flume::TrySendError::Full(outgoing)) => Err(outgoing),
            Err(flume::TrySendError::Disconnected(outgoing)) => Err(outgoing),
        }
    }

    /// Flushes a batch to a client. A slow or dead consumer loses qos 0
    /// traffic; for a persistent session everything else goes durable for
    /// redelivery
    pub fn flush_client_batch(&self, client_id: &str, batch: Vec<BrokerMessage>) {
        match self.send_direct(client_id, Outgoing::Bulk(batch)) {
            Ok(()) => (),
            Err(outgoing) => {
                let batch = match outgoing {
                    Outgoing::Bulk(batch) => batch,
                    Outgoing::Message(message) => vec![message],
                };

                warn!(
                    "client {} not reachable for {} messages. Queueing durably",
                    client_id,
                    batch.len()
                );
                let entries = batch
                    .into_iter()
                    .map(|message| (message, vec![client_id.to_owned()]))
                    .collect();
                self.persist(PersistJob::EnqueueMessages(entries));
            }
        }
    }

    /// Delivery of one message to one subscriber: loop prevention, qos
    /// downgrade and the status dependent path
    pub fn deliver_one(&self, client_id: &str, subscription_qos: QoS, message: &BrokerMessage) {
        if message.sender_id.as_deref() == Some(client_id) {
            return;
        }

        let effective = message.qos.downgrade(subscription_qos);
        let outgoing = if effective != message.qos {
            message.with_qos(effective)
        } else {
            message.clone()
        };

        if effective == QoS::AtMostOnce {
            // send and forget, never persisted
            if self.send_direct(client_id, Outgoing::Message(outgoing)).is_err() {
                self.metrics.incr_dropped(1);
            }
            return;
        }

        match self.status_of(client_id) {
            ClientStatus::Online => {
                if let Some(batch) = self.client_buffers.push(client_id, outgoing) {
                    self.flush_client_batch(client_id, batch);
                }
            }
            ClientStatus::Created => {
                let mut locals = lock(&self.locals);
                match locals.get_mut(client_id) {
                    Some(local) => {
                        if !local.push_inflight(outgoing, self.config.inflight_capacity) {
                            error!("in-flight buffer of {} full. Dropping message", client_id);
                            self.metrics.incr_dropped(1);
                        }
                    }
                    None => {
                        drop(locals);
                        self.persist(PersistJob::EnqueueMessages(vec![(
                            outgoing,
                            vec![client_id.to_owned()],
                        )]));
                    }
                }
            }
            ClientStatus::Paused => {
                self.persist(PersistJob::EnqueueMessages(vec![(
                    outgoing,
                    vec![client_id.to_owned()],
                )]));
            }
            ClientStatus::Unknown | ClientStatus::Delete => {
                debug!("no deliverable session for {}. Skipping", client_id);
            }
        }
    }

    /// Appends to the destination node's bulk buffer; a threshold crossing
    /// ships the batch on the node's message channel
    pub fn remote_push(&self, node: &str, message: BrokerMessage) {
        if let Some(batch) = self.node_buffers.push(node, message) {
            self.bus.publish(&node_messages(node), BusEvent::Bulk(batch));
        }
    }

    /// Worker path: one subscription lookup for every message on the topic,
    /// then local delivery and remote buffering
    pub fn distribute_topic(&self, topic: &str, messages: Vec<BrokerMessage>) {
        let subscribers = self.local_subscribers(topic);
        for message in messages.iter() {
            for (client_id, qos) in subscribers.iter() {
                self.deliver_one(client_id, *qos, message);
            }
        }

        for node in self.target_nodes(topic) {
            if node == self.node_id {
                continue;
            }

            for message in messages.iter() {
                self.remote_push(&node, message.clone());
            }
        }
    }
}

/// The router task. Owns the subscription index and all per client runtime
/// state through `Shared`
pub struct Router {
    shared: Arc<Shared>,
    session_store: Arc<dyn SessionStore>,
    message_store: Arc<dyn MessageStore>,
    retained_writer: ArchiveWriter,
    archives: Vec<Arc<ArchiveGroup>>,
    expander: Option<Arc<dyn MessageExpander>>,
    workers: Option<PublishWorkerPool>,
    command_rx: mpsc::Receiver<RouterMessage>,
    // top level publish ring feeding the worker pool
    publish_tx: flume::Sender<BrokerMessage>,
    publish_rx: flume::Receiver<BrokerMessage>,
    last_publish_flush: Instant,
    sub_add_rx: flume::Receiver<BusEvent>,
    sub_del_rx: flume::Receiver<BusEvent>,
    status_rx: flume::Receiver<BusEvent>,
    messages_rx: flume::Receiver<BusEvent>,
    broadcast_rx: flume::Receiver<BusEvent>,
    commands_rx: flume::Receiver<BusEvent>,
    metrics_rx: flume::Receiver<BusEvent>,
    metrics_reset_rx: flume::Receiver<BusEvent>,
}

impl Router {
    pub(crate) fn new(
        shared: Arc<Shared>,
        session_store: Arc<dyn SessionStore>,
        message_store: Arc<dyn MessageStore>,
        retained_writer: ArchiveWriter,
        workers: Option<PublishWorkerPool>,
        expander: Option<Arc<dyn MessageExpander>>,
    ) -> (Router, mpsc::Sender<RouterMessage>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (publish_tx, publish_rx) =
            flume::bounded(shared.config.publish_bulk_size.max(1) * 4);

        let bus = &shared.bus;
        let node_id = shared.node_id.clone();
        let router = Router {
            sub_add_rx: bus.subscribe(cluster::SUBSCRIPTION_ADD),
            sub_del_rx: bus.subscribe(cluster::SUBSCRIPTION_DEL),
            status_rx: bus.subscribe(cluster::CLIENT_STATUS),
            messages_rx: bus.subscribe(&node_messages(&node_id)),
            broadcast_rx: bus.subscribe(cluster::BROADCAST),
            commands_rx: bus.subscribe(&node_commands(&node_id)),
            metrics_rx: bus.subscribe(&cluster::node_metrics(&node_id)),
            metrics_reset_rx: bus.subscribe(&cluster::node_metrics_and_reset(&node_id)),
            shared,
            session_store,
            message_store,
            retained_writer,
            archives: Vec::new(),
            expander,
            workers,
            command_rx,
            publish_tx,
            publish_rx,
            last_publish_flush: Instant::now(),
        };

        (router, command_tx)
    }

    pub async fn start(mut self) {
        let mut flush = time::interval(FLUSH_TICK);
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(RouterMessage::Shutdown(ack)) => {
                        self.finish(ack).await;
                        return;
                    }
                    Some(command) => self.command(command).await,
                    None => break,
                },
                event = self.sub_add_rx.recv_async() => if let Ok(event) = event {
                    self.subscription_event(event);
                },
                event = self.sub_del_rx.recv_async() => if let Ok(event) = event {
                    self.subscription_event(event);
                },
                event = self.status_rx.recv_async() => if let Ok(event) = event {
                    self.status_event(event);
                },
                event = self.messages_rx.recv_async() => if let Ok(event) = event {
                    self.incoming(event).await;
                },
                event = self.broadcast_rx.recv_async() => if let Ok(event) = event {
                    self.incoming(event).await;
                },
                event = self.commands_rx.recv_async() => if let Ok(event) = event {
                    self.node_command(event).await;
                },
                event = self.metrics_rx.recv_async() => if let Ok(event) = event {
                    self.metrics_request(event, false);
                },
                event = self.metrics_reset_rx.recv_async() => if let Ok(event) = event {
                    self.metrics_request(event, true);
                },
                _ = flush.tick() => self.on_tick().await,
            }
        }

        info!("router loop done");
    }

    async fn command(&mut self, command: RouterMessage) {
        match command {
            RouterMessage::Connect { session, handle } => {
                self.handle_connect(session, handle).await;
            }
            RouterMessage::Ready { client_id } => self.handle_ready(client_id).await,
            RouterMessage::Publish(message) => self.publish(message).await,
            RouterMessage::Subscribe { client_id, filter, qos, reply } => {
                let accepted = self.handle_subscribe(&client_id, &filter, qos);
                let _ = reply.send(accepted);
            }
            RouterMessage::Unsubscribe { client_id, filter, reply } => {
                let accepted = self.handle_unsubscribe(&client_id, &filter);
                let _ = reply.send(accepted);
            }
            RouterMessage::Disconnect { client_id, execute_will } => {
                self.handle_disconnect(client_id, execute_will).await;
            }
            RouterMessage::RemoveClient { client_id } => self.handle_remove(client_id).await,
            RouterMessage::RegisterArchive(group) => {
                info!("archive group {} registered for fan out", group.name());
                self.archives.retain(|existing| existing.name() != group.name());
                self.archives.push(group);
            }
            RouterMessage::DeregisterArchive(name) => {
                self.archives.retain(|existing| existing.name() != name);
            }
            RouterMessage::Shutdown(_) => (),
        }
    }

    /// The publish pipeline. Expanded messages re-enter behind the original
    /// with a bounded depth
    async fn publish(&mut self, message: BrokerMessage) {
        let mut pending = VecDeque::new();
        pending.push_back((message, 0usize));

        while let Some((message, depth)) = pending.pop_front() {
            // broker emitted $SYS traffic must not feed the counters it is
            // derived from
            if !message.topic.starts_with("$SYS/") {
                self.shared.metrics.incr_in();
                if let Some(local) = lock(&self.shared.locals).get(&message.client_id) {
                    local.metrics.incr_in();
                }
            }

            // reserved api requests carry their target node in the topic
            if let Some(target) = api_target(&message.topic, &self.shared.config.api_prefix) {
                self.shared
                    .bus
                    .publish(&node_commands(target), BusEvent::Message(message.clone()));
            }

            if message.retain {
                self.retained_writer.enqueue(message.clone());
            }

            for group in self.archives.iter() {
                if group.matches(&message) {
                    group.enqueue(message.clone());
                }
            }

            if depth < self.shared.config.max_expansion_depth {
                if let Some(expander) = self.expander.clone() {
                    if expander.matches(&message.topic) {
                        match expander.expand(&message) {
                            Ok(derived) => {
                                for message in derived {
                                    pending.push_back((message, depth + 1));
                                }
                            }
                            Err(e) => {
                                self.shared.metrics.incr_expansion_errors();
                                debug!("expansion failed on {}. Error = {}", message.topic, e);
                            }
                        }
                    }
                }
            }

            if self.workers.is_some() {
                // distribution happens once, on the worker owning the batch
                match self.publish_tx.try_send(message) {
                    Ok(()) => {
                        if self.publish_rx.len() >= self.shared.config.publish_bulk_size {
                            self.flush_publish_queue();
                        }
                    }
                    Err(flume::TrySendError::Full(message)) => {
                        error!("publish buffer full. Dropping message {}", message.uuid);
                        self.shared.metrics.incr_dropped(1);
                    }
                    Err(flume::TrySendError::Disconnected(_)) => (),
                }
            } else {
                self.distribute(message).await;
            }
        }
    }

    async fn distribute(&self, message: BrokerMessage) {
        self.deliver_local(&message).await;
        for node in self.shared.target_nodes(&message.topic) {
            if node != self.shared.node_id {
                self.shared.remote_push(&node, message.clone());
            }
        }
    }

    /// Chunked local fan out. Large subscriber sets yield between chunks so
    /// one hot topic cannot starve the loop
    async fn deliver_local(&self, message: &BrokerMessage) {
        let subscribers = self.shared.local_subscribers(&message.topic);
        if subscribers.is_empty() {
            return;
        }

        let chunked = subscribers.len() > self.shared.config.qos0_chunk;
        for chunk in subscribers.chunks(self.shared.config.qos0_chunk.max(1)) {
            for (client_id, qos) in chunk.iter() {
                self.shared.deliver_one(client_id, *qos, message);
            }

            if chunked {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Messages targeted at this node by a peer: a single message or a
    /// whole bulk, delivered locally only
    async fn incoming(&self, event: BusEvent) {
        match event {
            BusEvent::Message(message) => self.deliver_local(&message).await,
            BusEvent::Bulk(messages) => {
                for message in messages.iter() {
                    self.deliver_local(message).await;
                }
            }
            _ => (),
        }
    }

    fn subscription_event(&self, event: BusEvent) {
        match event {
            BusEvent::SubscriptionAdd { client_id, filter, qos, node_id } => {
                write(&self.shared.subscriptions).subscribe(&client_id, &filter, qos);
                // only the owning node advertises itself for the filter
                if node_id == self.shared.node_id {
                    self.shared.topic_node.add_to_set(&filter, &node_id);
                }
            }
            BusEvent::SubscriptionDel { client_id, filter, node_id } => {
                write(&self.shared.subscriptions).unsubscribe(&client_id, &filter);
                if node_id == self.shared.node_id {
                    // stay in the filter's node set while any local
                    // subscriber still holds it
                    let holders = read(&self.shared.subscriptions).subscribers_of_filter(&filter);
                    let any_local = holders.iter().any(|holder| {
                        self.shared
                            .client_node
                            .get(holder)
                            .map_or(true, |node| node == self.shared.node_id)
                    });

                    if !any_local {
                        self.shared.topic_node.remove_from_set(&filter, &node_id);
                    }
                }
            }
            _ => (),
        }
    }

    fn status_event(&self, event: BusEvent) {
        if let BusEvent::ClientStatus { client_id, status, .. } = event {
            let mut statuses = write(&self.shared.statuses);
            if status == ClientStatus::Delete {
                statuses.remove(&client_id);
            } else {
                statuses.insert(client_id, status);
            }
        }
    }

    fn set_status(&self, client_id: &str, status: ClientStatus) {
        self.status_event(BusEvent::ClientStatus {
            client_id: client_id.to_owned(),
            status,
            node_id: self.shared.node_id.clone(),
        });
        self.shared.bus.publish(
            cluster::CLIENT_STATUS,
            BusEvent::ClientStatus {
                client_id: client_id.to_owned(),
                status,
                node_id: self.shared.node_id.clone(),
            },
        );
    }

    async fn handle_connect(&mut self, mut session: ClientSession, handle: flume::Sender<Outgoing>) {
        let client_id = session.client_id.clone();
        info!("Connect. Id = {:?}", client_id);

        if session.clean_session {
            // a clean session starts from nothing
            match self.session_store.del_client(&client_id).await {
                Ok(dropped) => {
                    for subscription in dropped {
                        self.shared.bus.publish(
                            cluster::SUBSCRIPTION_DEL,
                            BusEvent::SubscriptionDel {
                                client_id: client_id.clone(),
                                filter: subscription.filter,
                                node_id: self.shared.node_id.clone(),
                            },
                        );
                    }
                }
                Err(e) => error!("session cleanup failed. Id = {}, Error = {:?}", client_id, e),
            }
        }

        session.node_id = self.shared.node_id.clone();
        session.status = ClientStatus::Created;
        session.connected = true;
        session.time = now_millis();
        let will = session.last_will.clone();
        let clean_session = session.clean_session;
        if let Err(e) = self.session_store.set_client(session).await {
            error!("session persist failed. Id = {}, Error = {:?}", client_id, e);
        }

        lock(&self.shared.locals)
            .insert(client_id.clone(), LocalClient::new(handle, clean_session, will));
        self.shared.client_node.put(&client_id, &self.shared.node_id);
        self.set_status(&client_id, ClientStatus::Created);
    }

    /// Promotes a created client to online: durable backlog first, then the
    /// in-flight buffer, then live traffic
    async fn handle_ready(&mut self, client_id: String) {
        match self.session_store.dequeue_messages(&client_id).await {
            Ok(backlog) if !backlog.is_empty() => {
                let removals: Vec<(String, String)> = backlog
                    .iter()
                    .map(|message| (client_id.clone(), message.uuid.clone()))
                    .collect();
                match self.shared.send_direct(&client_id, Outgoing::Bulk(backlog)) {
                    Ok(()) => self.shared.persist(PersistJob::RemoveMessages(removals)),
                    Err(Outgoing::Bulk(backlog)) => {
                        // client vanished between connect and ready
                        let entries = backlog
                            .into_iter()
                            .map(|message| (message, vec![client_id.clone()]))
                            .collect();
                        self.shared.persist(PersistJob::EnqueueMessages(entries));
                    }
                    Err(_) => (),
                }
            }
            Ok(_) => (),
            Err(e) => error!("dequeue failed. Id = {}, Error = {:?}", client_id, e),
        }

        let inflight: Vec<BrokerMessage> = {
            let mut locals = lock(&self.shared.locals);
            match locals.get_mut(&client_id) {
                Some(local) => local.inflight.drain(..).collect(),
                None => Vec::new(),
            }
        };

        if !inflight.is_empty() {
            self.shared.flush_client_batch(&client_id, inflight);
        }

        if let Err(e) = self.session_store.set_connected(&client_id, true).await {
            error!("session update failed. Id = {}, Error = {:?}", client_id, e);
        }

        self.set_status(&client_id, ClientStatus::Online);
    }

    fn handle_subscribe(&mut self, client_id: &str, filter: &str, qos: QoS) -> bool {
        if !valid_filter(filter) {
            warn!("rejecting malformed filter {:?} from {}", filter, client_id);
            return false;
        }

        if filter == "#" && !self.shared.config.allow_root_wildcard {
            warn!("rejecting root wildcard subscription from {}", client_id);
            return false;
        }

        // retained catch up goes out before live traffic
        match self
            .message_store
            .find_matching(filter, self.shared.config.retained_fetch_limit)
        {
            Ok(retained) => {
                if !retained.is_empty() {
                    let copies: Vec<BrokerMessage> = retained
                        .iter()
                        .map(|message| message.with_qos(message.qos.downgrade(qos)))
                        .collect();
                    if self
                        .shared
                        .send_direct(client_id, Outgoing::Bulk(copies))
                        .is_err()
                    {
                        debug!("retained catch up skipped for {}", client_id);
                    }
                }
            }
            Err(e) => error!("retained lookup failed. Error = {:?}", e),
        }

        self.shared.bus.publish(
            cluster::SUBSCRIPTION_ADD,
            BusEvent::SubscriptionAdd {
                client_id: client_id.to_owned(),
                filter: filter.to_owned(),
                qos,
                node_id: self.shared.node_id.clone(),
            },
        );
        self.shared.persist(PersistJob::AddSubscriptions(vec![Subscription::new(
            client_id, filter, qos,
        )]));
        true
    }

    fn handle_unsubscribe(&mut self, client_id: &str, filter: &str) -> bool {
        self.shared.bus.publish(
            cluster::SUBSCRIPTION_DEL,
            BusEvent::SubscriptionDel {
                client_id: client_id.to_owned(),
                filter: filter.to_owned(),
                node_id: self.shared.node_id.clone(),
            },
        );
        self.shared.persist(PersistJob::DelSubscriptions(vec![(
            client_id.to_owned(),
            filter.to_owned(),
        )]));
        true
    }

    async fn handle_disconnect(&mut self, client_id: String, execute_will: bool) {
        info!("Disconnect. Id = {}", client_id);
        let (clean_session, will) = {
            let mut locals = lock(&self.shared.locals);
            match locals.get_mut(&client_id) {
                Some(local) => {
                    local.handle = None;
                    (local.clean_session, local.last_will.take())
                }
                None => return,
            }
        };

        if execute_will {
            if let Some(will) = will {
                info!("publishing last will of {}", client_id);
                self.publish(will).await;
            }
        }

        if clean_session {
            self.drop_client(&client_id).await;
        } else {
            if let Err(e) = self.session_store.set_connected(&client_id, false).await {
                error!("session update failed. Id = {}, Error = {:?}", client_id, e);
            }

            self.set_status(&client_id, ClientStatus::Paused);
        }
    }

    async fn handle_remove(&mut self, client_id: String) {
        info!("Removing client. Id = {}", client_id);
        self.drop_client(&client_id).await;
    }

    /// Removes every trace of a client: runtime state, durable state, its
    /// subscriptions everywhere and the cluster mappings
    async fn drop_client(&mut self, client_id: &str) {
        lock(&self.shared.locals).remove(client_id);
        match self.session_store.del_client(client_id).await {
            Ok(dropped) => {
                for subscription in dropped {
                    self.shared.bus.publish(
                        cluster::SUBSCRIPTION_DEL,
                        BusEvent::SubscriptionDel {
                            client_id: client_id.to_owned(),
                            filter: subscription.filter,
                            node_id: self.shared.node_id.clone(),
                        },
                    );
                }
            }
            Err(e) => error!("session removal failed. Id = {}, Error = {:?}", client_id, e),
        }

        self.shared.client_node.remove(client_id);
        self.set_status(client_id, ClientStatus::Delete);
    }

    /// Requests arriving on this node's command channel. Raw api messages
    /// are consumed by the admin service, not the router
    async fn node_command(&mut self, event: BusEvent) {
        match event {
            BusEvent::SessionMetricsRequest { client_id, reply_to } => {
                let metrics = lock(&self.shared.locals)
                    .get(&client_id)
                    .map(|local| local.metrics.clone());
                if let Some(metrics) = metrics {
                    self.shared.bus.publish(
                        &reply_to,
                        BusEvent::SessionMetricsReply {
                            client_id,
                            messages_in: metrics.messages_in.load(std::sync::atomic::Ordering::Relaxed),
                            messages_out: metrics.messages_out.load(std::sync::atomic::Ordering::Relaxed),
                        },
                    );
                }
            }
            BusEvent::SessionDetailsRequest { client_id, reply_to } => {
                let status = self.shared.status_of(&client_id);
                let (address, subscriptions) = match self.session_store.iterate_all_sessions().await
                {
                    Ok(sessions) => {
                        let address = sessions
                            .iter()
                            .find(|session| session.client_id == client_id)
                            .and_then(|session| session.client_address.clone());
                        let subscriptions = match self.session_store.iterate_subscriptions().await {
                            Ok(subscriptions) => subscriptions
                                .iter()
                                .filter(|subscription| subscription.client_id == client_id)
                                .count(),
                            Err(_) => 0,
                        };
                        (address, subscriptions)
                    }
                    Err(_) => (None, 0),
                };

                self.shared.bus.publish(
                    &reply_to,
                    BusEvent::SessionDetailsReply {
                        client_id,
                        status,
                        client_address: address,
                        subscriptions,
                    },
                );
            }
            _ => (),
        }
    }

    fn metrics_request(&mut self, event: BusEvent, reset: bool) {
        if let BusEvent::MetricsRequest { reply_to } = event {
            let snapshot = self.shared.metrics_snapshot();
            if reset {
                self.shared.metrics.reset();
            }

            self.shared.bus.publish(&reply_to, BusEvent::MetricsReply(snapshot));
        }
    }

    fn flush_publish_queue(&mut self) {
        let batch: Vec<BrokerMessage> = self.publish_rx.try_iter().collect();
        self.last_publish_flush = Instant::now();
        if batch.is_empty() {
            return;
        }

        if let Some(workers) = &self.workers {
            workers.dispatch(&self.shared, batch);
        }
    }

    async fn on_tick(&mut self) {
        if self.workers.is_some()
            && !self.publish_rx.is_empty()
            && self.last_publish_flush.elapsed()
                >= Duration::from_millis(self.shared.config.publish_bulk_timeout_ms)
        {
            self.flush_publish_queue();
        }

        for (client_id, batch) in self.shared.client_buffers.flush_expired() {
            self.shared.flush_client_batch(&client_id, batch);
        }

        for (node, batch) in self.shared.node_buffers.flush_expired() {
            self.shared.bus.publish(&node_messages(&node), BusEvent::Bulk(batch));
        }
    }

    /// Graceful shutdown: flush what is buffered, stop the workers and give
    /// the retained writer its drain budget
    async fn finish(self, ack: oneshot::Sender<()>) {
        info!("router shutting down");
        let Router {
            shared,
            retained_writer,
            workers,
            publish_rx,
            ..
        } = self;

        let batch: Vec<BrokerMessage> = publish_rx.try_iter().collect();
        if let Some(workers) = &workers {
            if !batch.is_empty() {
                workers.dispatch(&shared, batch);
            }
        }

        drop(workers);
        for (client_id, batch) in shared.client_buffers.flush_all() {
            shared.flush_client_batch(&client_id, batch);
        }

        for (node, batch) in shared.node_buffers.flush_all() {
            shared.bus.publish(&node_messages(&node), BusEvent::Bulk(batch));
        }

        let stopped = tokio::task::spawn_blocking(move || {
            retained_writer.stop(Duration::from_secs(5))
        })
        .await
        .unwrap_or(false);
        if !stopped {
            error!("retained writer did not stop within its budget");
        }

        let _ = ack.send(());
    }
}

pub(crate) async fn persist_drainer(
    rx: flume::Receiver<PersistJob>,
    store: Arc<dyn SessionStore>,
) {
    while let Ok(job) = rx.recv_async().await {
        let result = match job {
            PersistJob::AddSubscriptions(subscriptions) => {
                store.add_subscriptions(&subscriptions).await
            }
            PersistJob::DelSubscriptions(subscriptions) => {
                store.del_subscriptions(&subscriptions).await
            }
            PersistJob::EnqueueMessages(entries) => store.enqueue_messages(&entries).await,
            PersistJob::RemoveMessages(entries) => store.remove_messages(&entries).await,
        };

        match result {
            Ok(()) => (),
            // bounded queues lose the overflow, they never block or crash
            Err(StoreError::QueueFull) => {
                warn!("queued message quota reached. Dropping the overflow")
            }
            Err(e) => error!("durable persist failed. Error = {:?}", e),
        }
    }
}

/// Reserved api request topics look like `<prefix>/<targetNodeId>/...`
fn api_target<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let node = rest.split('/').next()?;
    if node.is_empty() {
        None
    } else {
        Some(node)
    }
}
