//! Runtime lifecycle of archive groups: start and stop on demand, register
//! the group with the router's fan out list and keep the rest of the
//! cluster informed.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{ArchiveGroup, ArchiveGroupConfig};
use crate::cluster::{ArchiveLifecycle, BusEvent, ClusterBus, ARCHIVE_EVENTS};
use crate::router::RouterMessage;
use crate::store::{self, ConfigStore, StoreError};

const UNDEPLOY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("unknown archive group `{0}`")]
    UnknownGroup(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("router unavailable")]
    RouterClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ArchiveController {
    node_id: String,
    bus: Arc<dyn ClusterBus>,
    config_store: Arc<dyn ConfigStore>,
    router_tx: mpsc::Sender<RouterMessage>,
    groups: Mutex<HashMap<String, Arc<ArchiveGroup>>>,
}

impl ArchiveController {
    pub fn new(
        node_id: &str,
        bus: Arc<dyn ClusterBus>,
        config_store: Arc<dyn ConfigStore>,
        router_tx: mpsc::Sender<RouterMessage>,
    ) -> Arc<ArchiveController> {
        Arc::new(ArchiveController {
            node_id: node_id.to_owned(),
            bus,
            config_store,
            router_tx,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent: starting a running group succeeds without a second
    /// writer
    pub async fn start_archive_group(
        &self,
        name: &str,
        should_broadcast: bool,
    ) -> Result<(), ArchiveError> {
        let mut groups = self.groups.lock().await;
        if groups.contains_key(name) {
            return Ok(());
        }

        let config = self
            .config_store
            .archive_group(name)
            .await?
            .ok_or_else(|| ArchiveError::UnknownGroup(name.to_owned()))?;

        let group = Arc::new(self.spawn_group(config)?);
        self.router_tx
            .send(RouterMessage::RegisterArchive(group.clone()))
            .await
            .map_err(|_| ArchiveError::RouterClosed)?;
        groups.insert(name.to_owned(), group);
        drop(groups);

        info!("archive group {} started", name);
        if should_broadcast {
            self.broadcast(ArchiveLifecycle::Started, name);
        }

        Ok(())
    }

    /// Idempotent. The writer gets a hard undeploy budget; expiry forces
    /// the bookkeeping and still reports the stop
    pub async fn stop_archive_group(
        &self,
        name: &str,
        should_broadcast: bool,
    ) -> Result<(), ArchiveError> {
        let group = self.groups.lock().await.remove(name);
        let group = match group {
            Some(group) => group,
            None => return Ok(()),
        };

        self.router_tx
            .send(RouterMessage::DeregisterArchive(name.to_owned()))
            .await
            .map_err(|_| ArchiveError::RouterClosed)?;

        let stopped = {
            let group = group.clone();
            tokio::task::spawn_blocking(move || group.stop(UNDEPLOY_TIMEOUT))
                .await
                .unwrap_or(false)
        };
        if !stopped {
            error!("archive group {} did not stop within {:?}", name, UNDEPLOY_TIMEOUT);
        }

        info!("archive group {} stopped", name);
        if should_broadcast {
            self.broadcast(ArchiveLifecycle::Stopped, name);
        }

        Ok(())
    }

    /// Starts every group flagged enabled in the config store. Used at boot
    pub async fn start_enabled(&self) -> Result<(), ArchiveError> {
        let groups = self.config_store.all_archive_groups().await?;
        for (config, enabled) in groups {
            if enabled {
                self.start_archive_group(&config.name, false).await?;
            }
        }

        Ok(())
    }

    pub async fn stop_all(&self) {
        let names = self.running().await;
        let stops = names
            .iter()
            .map(|name| self.stop_archive_group(name, false));
        for result in join_all(stops).await {
            if let Err(e) = result {
                error!("archive group stop failed. Error = {:?}", e);
            }
        }
    }

    pub async fn running(&self) -> Vec<String> {
        self.groups.lock().await.keys().cloned().collect()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.groups.lock().await.contains_key(name)
    }

    fn spawn_group(&self, config: ArchiveGroupConfig) -> Result<ArchiveGroup, std::io::Error> {
        let retained = store::message_store(config.retained_store);
        let history = store::archive_sink(config.archive_sink, config.retention_ms);
        let last_value = store::archive_sink(config.last_value_sink, config.retention_ms);
        ArchiveGroup::start(config, retained, history, last_value)
    }

    fn broadcast(&self, event: ArchiveLifecycle, group: &str) {
        self.bus.publish(
            ARCHIVE_EVENTS,
            BusEvent::Archive {
                event,
                group: group.to_owned(),
                node_id: self.node_id.clone(),
            },
        );
    }

    /// Replays archive lifecycle broadcasts from other nodes with the
    /// broadcast flag off; own events are ignored
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let rx = this.bus.subscribe(ARCHIVE_EVENTS);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                if let BusEvent::Archive { event, group, node_id } = event {
                    if node_id == this.node_id {
                        continue;
                    }

                    let result = match event {
                        ArchiveLifecycle::Started => this.start_archive_group(&group, false).await,
                        ArchiveLifecycle::Stopped => this.stop_archive_group(&group, false).await,
                    };

                    if let Err(e) = result {
                        error!("archive event replay failed for {}. Error = {:?}", group, e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::LocalBus;
    use crate::store::memory::MemoryConfigStore;
    use crate::store::StoreKind;

    async fn controller() -> (Arc<ArchiveController>, mpsc::Receiver<RouterMessage>) {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let config_store = Arc::new(MemoryConfigStore::new());
        let mut group = ArchiveGroupConfig::named("history");
        group.archive_sink = StoreKind::Memory;
        config_store.save_archive_group(group, true).await.unwrap();

        let (router_tx, router_rx) = mpsc::channel(16);
        let controller = ArchiveController::new("node-a", bus, config_store, router_tx);
        (controller, router_rx)
    }

    #[tokio::test]
    async fn starting_twice_keeps_a_single_writer() {
        let (controller, mut router_rx) = controller().await;

        controller.start_archive_group("history", false).await.unwrap();
        controller.start_archive_group("history", false).await.unwrap();

        assert_eq!(controller.running().await, vec!["history".to_owned()]);
        // exactly one registration reached the router
        assert!(matches!(
            router_rx.try_recv(),
            Ok(RouterMessage::RegisterArchive(_))
        ));
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_then_stop_nets_out_to_zero() {
        let (controller, mut router_rx) = controller().await;

        controller.start_archive_group("history", false).await.unwrap();
        controller.stop_archive_group("history", false).await.unwrap();
        // stopping again is fine
        controller.stop_archive_group("history", false).await.unwrap();

        assert!(controller.running().await.is_empty());
        assert!(matches!(
            router_rx.try_recv(),
            Ok(RouterMessage::RegisterArchive(_))
        ));
        assert!(matches!(
            router_rx.try_recv(),
            Ok(RouterMessage::DeregisterArchive(_))
        ));
    }

    #[tokio::test]
    async fn unknown_groups_are_rejected() {
        let (controller, _router_rx) = controller().await;
        let result = controller.start_archive_group("missing", false).await;
        assert!(matches!(result, Err(ArchiveError::UnknownGroup(_))));
    }

    #[tokio::test]
    async fn broadcasts_replay_on_the_other_node() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let config_store = Arc::new(MemoryConfigStore::new());
        let mut group = ArchiveGroupConfig::named("history");
        group.archive_sink = StoreKind::Memory;
        config_store.save_archive_group(group, true).await.unwrap();

        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let a = ArchiveController::new("node-a", bus.clone(), config_store.clone(), tx_a);
        let b = ArchiveController::new("node-b", bus.clone(), config_store.clone(), tx_b);
        let _listener = b.spawn_event_listener();

        a.start_archive_group("history", true).await.unwrap();

        // the listener needs a moment to replay the event
        for _ in 0..50 {
            if b.is_running("history").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(b.is_running("history").await);
        assert!(a.is_running("history").await);
    }
}
