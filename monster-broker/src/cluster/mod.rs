//! Cluster wide communication. Every node shares a set of named pub/sub
//! channels; the channel strings have to match exactly across nodes.

pub mod health;
pub mod maps;

use monster_core::{BrokerMessage, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::session::ClientStatus;

pub const SUBSCRIPTION_ADD: &str = "cluster.subscription.add";
pub const SUBSCRIPTION_DEL: &str = "cluster.subscription.del";
pub const CLIENT_STATUS: &str = "cluster.client.status";
pub const CLIENT_NODE_MAPPING: &str = "cluster.client.node-mapping";
pub const TOPIC_NODE_MAPPING: &str = "cluster.topic.node-mapping";
pub const BROADCAST: &str = "cluster.broadcast";
pub const MEMBERSHIP: &str = "cluster.membership";
pub const LEADER: &str = "cluster.leader";
pub const ARCHIVE_EVENTS: &str = "mq.cluster.archive.events";

pub fn node_messages(node_id: &str) -> String {
    format!("node.{}.messages", node_id)
}

pub fn node_metrics(node_id: &str) -> String {
    format!("node.{}.metrics", node_id)
}

pub fn node_metrics_and_reset(node_id: &str) -> String {
    format!("node.{}.metrics-and-reset", node_id)
}

pub fn node_commands(node_id: &str) -> String {
    format!("node.{}.commands", node_id)
}

pub fn session_metrics(node_id: &str, client_id: &str) -> String {
    format!("node.{}.session.{}.metrics", node_id, client_id)
}

pub fn session_details(node_id: &str, client_id: &str) -> String {
    format!("node.{}.session.{}.details", node_id, client_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveLifecycle {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetricsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub messages_dropped: u64,
    pub expansion_errors: u64,
    pub clients: usize,
}

/// Everything that travels on a cluster channel. A production transport
/// frames these with serde; the in-process bus moves them as is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    SubscriptionAdd {
        client_id: String,
        filter: String,
        qos: QoS,
        node_id: String,
    },
    SubscriptionDel {
        client_id: String,
        filter: String,
        node_id: String,
    },
    ClientStatus {
        client_id: String,
        status: ClientStatus,
        node_id: String,
    },
    Message(BrokerMessage),
    Bulk(Vec<BrokerMessage>),
    // replicated map deltas, tagged with the origin node so peers can
    // ignore their own echoes
    MapPut {
        key: String,
        value: String,
        time: u64,
        origin: String,
    },
    MapRemove {
        key: String,
        time: u64,
        origin: String,
    },
    SetAdd {
        key: String,
        value: String,
        time: u64,
        origin: String,
    },
    SetRemove {
        key: String,
        value: String,
        time: u64,
        origin: String,
    },
    SetDropValue {
        value: String,
        time: u64,
        origin: String,
    },
    SyncRequest {
        reply_to: String,
        origin: String,
    },
    MapSnapshot {
        entries: Vec<(String, Option<String>, u64)>,
        origin: String,
    },
    SetSnapshot {
        entries: Vec<(String, Vec<(String, bool, u64)>)>,
        origin: String,
    },
    LeaderClaim {
        node_id: String,
        birth: u64,
    },
    LeaderClear,
    NodeAdded(String),
    NodeRemoved(String),
    Archive {
        event: ArchiveLifecycle,
        group: String,
        node_id: String,
    },
    MetricsRequest {
        reply_to: String,
    },
    MetricsReply(NodeMetricsSnapshot),
    SessionMetricsRequest {
        client_id: String,
        reply_to: String,
    },
    SessionMetricsReply {
        client_id: String,
        messages_in: u64,
        messages_out: u64,
    },
    SessionDetailsRequest {
        client_id: String,
        reply_to: String,
    },
    SessionDetailsReply {
        client_id: String,
        status: ClientStatus,
        client_address: Option<String>,
        subscriptions: usize,
    },
}

/// Named pub/sub channels shared by all nodes. Publish never blocks; a full
/// subscriber ring drops the event for that subscriber
pub trait ClusterBus: Send + Sync {
    fn publish(&self, channel: &str, event: BusEvent);
    fn subscribe(&self, channel: &str) -> flume::Receiver<BusEvent>;
}

/// In-process bus used by tests and single node deployments. A clustered
/// deployment plugs a real transport behind the same trait
pub struct LocalBus {
    capacity: usize,
    channels: Mutex<HashMap<String, Vec<flume::Sender<BusEvent>>>>,
}

impl LocalBus {
    pub fn new() -> LocalBus {
        LocalBus::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> LocalBus {
        LocalBus {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Vec<flume::Sender<BusEvent>>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> LocalBus {
        LocalBus::new()
    }
}

impl ClusterBus for LocalBus {
    fn publish(&self, channel: &str, event: BusEvent) {
        let mut channels = self.channels();
        let subscribers = match channels.get_mut(channel) {
            Some(subscribers) => subscribers,
            None => return,
        };

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                error!("bus channel {} full. Dropping event", channel);
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }

    fn subscribe(&self, channel: &str) -> flume::Receiver<BusEvent> {
        let (tx, rx) = flume::bounded(self.capacity);
        self.channels().entry(channel.to_owned()).or_default().push(tx);
        rx
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn published_events_reach_every_subscriber() {
        let bus = LocalBus::new();
        let rx1 = bus.subscribe(BROADCAST);
        let rx2 = bus.subscribe(BROADCAST);

        bus.publish(BROADCAST, BusEvent::NodeAdded("node-a".to_owned()));

        for rx in &[rx1, rx2] {
            match rx.try_recv() {
                Ok(BusEvent::NodeAdded(node)) => assert_eq!(node, "node-a"),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn publishing_to_an_unknown_channel_is_a_no_op() {
        let bus = LocalBus::new();
        bus.publish("nobody.listens", BusEvent::LeaderClear);
    }

    #[test]
    fn full_subscriber_rings_drop_instead_of_blocking() {
        let bus = LocalBus::with_capacity(1);
        let rx = bus.subscribe(BROADCAST);

        bus.publish(BROADCAST, BusEvent::NodeAdded("a".to_owned()));
        bus.publish(BROADCAST, BusEvent::NodeAdded("b".to_owned()));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
