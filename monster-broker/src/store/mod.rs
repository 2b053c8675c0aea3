//! Store interfaces the core depends on. A concrete backend is chosen by
//! the factory at configuration time; the engine itself never names one.

pub mod memory;

use async_trait::async_trait;
use monster_core::BrokerMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::archive::ArchiveGroupConfig;
use crate::session::{ClientSession, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown client `{0}`")]
    UnknownClient(String),
    #[error("queue full")]
    QueueFull,
}

/// Durable per client state: sessions, subscriptions, queued messages and
/// last wills
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set_client(&self, session: ClientSession) -> Result<(), StoreError>;
    async fn set_connected(&self, client_id: &str, connected: bool) -> Result<(), StoreError>;
    /// Removes the session and everything hanging off it. Returns the
    /// subscriptions that were dropped so callers can unapply them
    async fn del_client(&self, client_id: &str) -> Result<Vec<Subscription>, StoreError>;
    async fn set_last_will(
        &self,
        client_id: &str,
        will: Option<BrokerMessage>,
    ) -> Result<(), StoreError>;
    async fn add_subscriptions(&self, subscriptions: &[Subscription]) -> Result<(), StoreError>;
    /// `(client_id, filter)` pairs
    async fn del_subscriptions(&self, subscriptions: &[(String, String)]) -> Result<(), StoreError>;
    /// Each message is queued for every client id attached to it
    async fn enqueue_messages(
        &self,
        entries: &[(BrokerMessage, Vec<String>)],
    ) -> Result<(), StoreError>;
    /// `(client_id, message_uuid)` pairs
    async fn remove_messages(&self, entries: &[(String, String)]) -> Result<(), StoreError>;
    /// Drains the queued backlog of a client in arrival order
    async fn dequeue_messages(&self, client_id: &str) -> Result<Vec<BrokerMessage>, StoreError>;
    async fn iterate_all_sessions(&self) -> Result<Vec<ClientSession>, StoreError>;
    async fn iterate_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;
    async fn iterate_node_clients(&self, node_id: &str) -> Result<Vec<ClientSession>, StoreError>;
    /// Drops expired sessions, returns how many were removed
    async fn purge_sessions(&self) -> Result<usize, StoreError>;
    /// Drops queued messages that no longer have a session, returns how
    /// many were removed
    async fn purge_queued_messages(&self) -> Result<usize, StoreError>;
    async fn is_present(&self, client_id: &str) -> Result<bool, StoreError>;
}

/// Latest retained value per topic. Called from archive writer threads, so
/// the interface stays synchronous
pub trait MessageStore: Send + Sync {
    fn add_all(&self, messages: &[BrokerMessage]) -> Result<(), StoreError>;
    fn del_all(&self, topics: &[String]) -> Result<(), StoreError>;
    fn find_matching(&self, filter: &str, limit: usize) -> Result<Vec<BrokerMessage>, StoreError>;
}

/// Append-only history and last-value sinks
pub trait ArchiveSink: Send + Sync {
    fn add_history(&self, messages: &[BrokerMessage]) -> Result<(), StoreError>;
    /// Bulk upsert of the latest value per topic
    fn add_all(&self, messages: &[BrokerMessage]) -> Result<(), StoreError>;
    fn connection_status(&self) -> bool;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn all_archive_groups(&self) -> Result<Vec<(ArchiveGroupConfig, bool)>, StoreError>;
    async fn archive_group(&self, name: &str) -> Result<Option<ArchiveGroupConfig>, StoreError>;
    async fn save_archive_group(
        &self,
        group: ArchiveGroupConfig,
        enabled: bool,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    None,
    Memory,
}

impl Default for StoreKind {
    fn default() -> StoreKind {
        StoreKind::None
    }
}

pub fn message_store(kind: StoreKind) -> Option<Arc<dyn MessageStore>> {
    match kind {
        StoreKind::None => None,
        StoreKind::Memory => Some(Arc::new(memory::MemoryMessageStore::new())),
    }
}

pub fn archive_sink(kind: StoreKind, retention_ms: Option<u64>) -> Option<Arc<dyn ArchiveSink>> {
    match kind {
        StoreKind::None => None,
        StoreKind::Memory => Some(Arc::new(memory::MemoryArchiveSink::new(retention_ms))),
    }
}
