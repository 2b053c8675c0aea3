//! Node health, periodic purges and leader election. The leader slot is a
//! `(leader, birth)` pair converged over the bus: the earliest claim wins,
//! ties break on node id. The elected node runs the singleton tasks: purges
//! and dead node cleanup.

use monster_core::now_millis;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use super::maps::{ReplicatedMap, ReplicatedSetMap};
use super::{BusEvent, ClusterBus, CLIENT_STATUS, LEADER, MEMBERSHIP};
use crate::router::RouterMessage;
use crate::session::ClientStatus;
use crate::store::SessionStore;

const PURGE_INTERVAL: Duration = Duration::from_secs(600);
// claims race for a moment after a leader loss before cleanup proceeds
const CLAIM_SETTLE: Duration = Duration::from_millis(100);

pub struct HealthMonitor {
    node_id: String,
    cluster_mode: bool,
    bus: Arc<dyn ClusterBus>,
    session_store: Arc<dyn SessionStore>,
    client_node: Arc<ReplicatedMap>,
    topic_node: Arc<ReplicatedSetMap>,
    router_tx: mpsc::Sender<RouterMessage>,
    leader: RwLock<Option<(String, u64)>>,
    fatal: Arc<dyn Fn() + Send + Sync>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        cluster_mode: bool,
        bus: Arc<dyn ClusterBus>,
        session_store: Arc<dyn SessionStore>,
        client_node: Arc<ReplicatedMap>,
        topic_node: Arc<ReplicatedSetMap>,
        router_tx: mpsc::Sender<RouterMessage>,
        fatal: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor {
            node_id,
            cluster_mode,
            bus,
            session_store,
            client_node,
            topic_node,
            router_tx,
            leader: RwLock::new(None),
            fatal,
        })
    }

    fn leader_read(&self) -> RwLockReadGuard<'_, Option<(String, u64)>> {
        match self.leader.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn leader_write(&self) -> RwLockWriteGuard<'_, Option<(String, u64)>> {
        match self.leader.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A single node deployment is always its own leader
    pub fn is_leader(&self) -> bool {
        if !self.cluster_mode {
            return true;
        }

        self.leader_read()
            .as_ref()
            .map_or(false, |(leader, _)| *leader == self.node_id)
    }

    pub fn leader(&self) -> Option<String> {
        self.leader_read().as_ref().map(|(leader, _)| leader.clone())
    }

    fn claim(&self) {
        let birth = now_millis();
        self.apply_claim(&self.node_id, birth);
        self.bus.publish(
            LEADER,
            BusEvent::LeaderClaim {
                node_id: self.node_id.clone(),
                birth,
            },
        );
    }

    /// First writer wins: the earliest birth keeps the slot, ties break on
    /// the smaller node id
    fn apply_claim(&self, node_id: &str, birth: u64) {
        let mut leader = self.leader_write();
        let replace = match leader.as_ref() {
            Some((current, current_birth)) => {
                (birth, node_id) < (*current_birth, current.as_str())
            }
            None => true,
        };

        if replace {
            info!("leader is now {} (birth {})", node_id, birth);
            *leader = Some((node_id.to_owned(), birth));
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let leader_rx = this.bus.subscribe(LEADER);
        let membership_rx = this.bus.subscribe(MEMBERSHIP);

        tokio::spawn(async move {
            this.boot_purge().await;
            if this.cluster_mode {
                this.claim();
            }

            let mut interval = time::interval(PURGE_INTERVAL);
            // the immediate first tick was the boot purge
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if this.is_leader() {
                            this.periodic_purge().await;
                        }
                    }
                    event = leader_rx.recv_async() => match event {
                        Ok(event) => this.leader_event(event),
                        Err(_) => break,
                    },
                    event = membership_rx.recv_async() => match event {
                        Ok(event) => this.membership_event(event).await,
                        Err(_) => break,
                    },
                }
            }
        })
    }

    async fn boot_purge(&self) {
        match self.session_store.purge_sessions().await {
            Ok(purged) if purged > 0 => info!("purged {} expired sessions", purged),
            Err(e) => error!("session purge failed. Error = {:?}", e),
            _ => (),
        }

        self.periodic_purge().await;
    }

    async fn periodic_purge(&self) {
        match self.session_store.purge_queued_messages().await {
            Ok(purged) if purged > 0 => info!("purged {} queued messages", purged),
            Err(e) => error!("queued message purge failed. Error = {:?}", e),
            _ => (),
        }
    }

    fn leader_event(&self, event: BusEvent) {
        match event {
            BusEvent::LeaderClaim { node_id, birth } => self.apply_claim(&node_id, birth),
            BusEvent::LeaderClear => {
                *self.leader_write() = None;
                if self.cluster_mode {
                    self.claim();
                }
            }
            _ => (),
        }
    }

    async fn membership_event(&self, event: BusEvent) {
        match event {
            BusEvent::NodeAdded(node) => debug!("node {} joined the cluster", node),
            BusEvent::NodeRemoved(node) => self.node_removed(node).await,
            _ => (),
        }
    }

    async fn node_removed(&self, node: String) {
        if node == self.node_id {
            // the rest of the cluster already considers this node gone
            error!("this node was removed from the cluster. Failing fast");
            (self.fatal)();
            return;
        }

        info!("node {} left the cluster", node);
        let leader_lost = self
            .leader_read()
            .as_ref()
            .map_or(false, |(leader, _)| *leader == node);
        if leader_lost {
            *self.leader_write() = None;
            self.claim();
            // let competing claims converge before acting as leader
            time::sleep(CLAIM_SETTLE).await;
        }

        if self.is_leader() {
            self.cleanup_node(&node).await;
        }
    }

    /// Leader only. Publishes the last wills of the dead node's sessions,
    /// deletes clean ones, pauses persistent ones and purges the node from
    /// the cluster maps
    async fn cleanup_node(&self, node: &str) {
        info!("cleaning up sessions of dead node {}", node);
        match self.session_store.iterate_node_clients(node).await {
            Ok(sessions) => {
                for session in sessions {
                    if let Some(will) = session.last_will.clone() {
                        if self.router_tx.send(RouterMessage::Publish(will)).await.is_err() {
                            error!("will publish failed for {}", session.client_id);
                        }
                    }

                    if session.clean_session {
                        if let Err(e) = self.session_store.del_client(&session.client_id).await {
                            error!(
                                "session removal failed. Id = {}, Error = {:?}",
                                session.client_id, e
                            );
                        }

                        self.publish_status(&session.client_id, ClientStatus::Delete);
                    } else {
                        let mut paused = session.clone();
                        paused.status = ClientStatus::Paused;
                        paused.connected = false;
                        paused.time = now_millis();
                        if let Err(e) = self.session_store.set_client(paused).await {
                            error!(
                                "session update failed. Id = {}, Error = {:?}",
                                session.client_id, e
                            );
                        }

                        self.publish_status(&session.client_id, ClientStatus::Paused);
                    }
                }
            }
            Err(e) => error!("session iteration failed. Error = {:?}", e),
        }

        self.client_node.remove_node(node);
        self.topic_node.remove_value_from_all_sets(node);
    }

    fn publish_status(&self, client_id: &str, status: ClientStatus) {
        self.bus.publish(
            CLIENT_STATUS,
            BusEvent::ClientStatus {
                client_id: client_id.to_owned(),
                status,
                node_id: self.node_id.clone(),
            },
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::LocalBus;
    use crate::cluster::{CLIENT_NODE_MAPPING, TOPIC_NODE_MAPPING};
    use crate::store::memory::MemorySessionStore;

    fn monitor(node_id: &str, bus: Arc<dyn ClusterBus>) -> Arc<HealthMonitor> {
        let store = Arc::new(MemorySessionStore::new());
        let client_node = ReplicatedMap::new(CLIENT_NODE_MAPPING, node_id, bus.clone());
        let topic_node = ReplicatedSetMap::new(TOPIC_NODE_MAPPING, node_id, bus.clone());
        let (router_tx, _router_rx) = mpsc::channel(16);
        // keep the router end alive for the monitor's lifetime
        std::mem::forget(_router_rx);
        HealthMonitor::new(
            node_id.to_owned(),
            true,
            bus,
            store,
            client_node,
            topic_node,
            router_tx,
            Arc::new(|| ()),
        )
    }

    #[test]
    fn earliest_claim_wins_and_ties_break_on_node_id() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let monitor = monitor("node-b", bus);

        monitor.apply_claim("node-b", 200);
        assert!(monitor.is_leader());

        monitor.apply_claim("node-a", 100);
        assert!(!monitor.is_leader());
        assert_eq!(monitor.leader(), Some("node-a".to_owned()));

        // later claims never displace the holder
        monitor.apply_claim("node-c", 300);
        assert_eq!(monitor.leader(), Some("node-a".to_owned()));

        // a tie goes to the smaller node id
        monitor.apply_claim("node-0", 100);
        assert_eq!(monitor.leader(), Some("node-0".to_owned()));
    }

    #[test]
    fn both_claimants_converge_to_one_leader() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let a = monitor("node-a", bus.clone());
        let b = monitor("node-b", bus);

        a.apply_claim("node-a", 100);
        b.apply_claim("node-a", 100);
        a.apply_claim("node-b", 105);
        b.apply_claim("node-b", 105);

        assert!(a.is_leader());
        assert!(!b.is_leader());
    }
}
