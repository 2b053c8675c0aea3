//! In-memory store implementations. They back the defaults, single node
//! deployments and the test suite; persistent drivers live outside the core
//! behind the same traits.

use async_trait::async_trait;
use monster_core::{matches, now_millis, BrokerMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{ArchiveSink, ConfigStore, MessageStore, SessionStore, StoreError};
use crate::archive::ArchiveGroupConfig;
use crate::session::{ClientSession, ClientStatus, Subscription};

const DEFAULT_QUEUE_QUOTA: usize = 10_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct SessionState {
    sessions: HashMap<String, ClientSession>,
    // client -> subscriptions by filter
    subscriptions: HashMap<String, HashMap<String, Subscription>>,
    // client -> queued backlog in arrival order
    queued: HashMap<String, VecDeque<BrokerMessage>>,
}

pub struct MemorySessionStore {
    state: Mutex<SessionState>,
    queue_quota: usize,
}

impl MemorySessionStore {
    pub fn new() -> MemorySessionStore {
        MemorySessionStore::with_quota(DEFAULT_QUEUE_QUOTA)
    }

    /// `queue_quota` bounds the queued backlog per client. Overflow drops
    /// the incoming message
    pub fn with_quota(queue_quota: usize) -> MemorySessionStore {
        MemorySessionStore {
            state: Mutex::new(SessionState::default()),
            queue_quota,
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> MemorySessionStore {
        MemorySessionStore::new()
    }
}

impl MemorySessionStore {
    /// Queued backlog size of a client without consuming it
    pub fn queued_len(&self, client_id: &str) -> usize {
        lock(&self.state)
            .queued
            .get(client_id)
            .map_or(0, |queue| queue.len())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set_client(&self, session: ClientSession) -> Result<(), StoreError> {
        lock(&self.state).sessions.insert(session.client_id.clone(), session);
        Ok(())
    }

    async fn set_connected(&self, client_id: &str, connected: bool) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let session = state
            .sessions
            .get_mut(client_id)
            .ok_or_else(|| StoreError::UnknownClient(client_id.to_owned()))?;

        session.connected = connected;
        session.status = if connected { ClientStatus::Online } else { ClientStatus::Paused };
        session.time = now_millis();
        Ok(())
    }

    async fn del_client(&self, client_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut state = lock(&self.state);
        state.sessions.remove(client_id);
        state.queued.remove(client_id);
        let subscriptions = state
            .subscriptions
            .remove(client_id)
            .map(|subscriptions| subscriptions.into_iter().map(|(_, sub)| sub).collect())
            .unwrap_or_default();
        Ok(subscriptions)
    }

    async fn set_last_will(
        &self,
        client_id: &str,
        will: Option<BrokerMessage>,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let session = state
            .sessions
            .get_mut(client_id)
            .ok_or_else(|| StoreError::UnknownClient(client_id.to_owned()))?;

        session.last_will = will;
        Ok(())
    }

    async fn add_subscriptions(&self, subscriptions: &[Subscription]) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        for subscription in subscriptions.iter() {
            state
                .subscriptions
                .entry(subscription.client_id.clone())
                .or_default()
                .insert(subscription.filter.clone(), subscription.clone());
        }
        Ok(())
    }

    async fn del_subscriptions(&self, subscriptions: &[(String, String)]) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        for (client_id, filter) in subscriptions.iter() {
            let empty = match state.subscriptions.get_mut(client_id) {
                Some(filters) => {
                    filters.remove(filter);
                    filters.is_empty()
                }
                None => false,
            };

            if empty {
                state.subscriptions.remove(client_id);
            }
        }
        Ok(())
    }

    async fn enqueue_messages(
        &self,
        entries: &[(BrokerMessage, Vec<String>)],
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let mut overflow = false;
        for (message, client_ids) in entries.iter() {
            for client_id in client_ids.iter() {
                let queue = state.queued.entry(client_id.clone()).or_default();
                if queue.len() >= self.queue_quota {
                    // what fits stays queued; the caller decides how loudly
                    // to report the loss
                    overflow = true;
                    continue;
                }

                let mut message = message.clone();
                message.queued = true;
                queue.push_back(message);
            }
        }

        if overflow {
            return Err(StoreError::QueueFull);
        }

        Ok(())
    }

    async fn remove_messages(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        for (client_id, uuid) in entries.iter() {
            if let Some(queue) = state.queued.get_mut(client_id) {
                queue.retain(|message| message.uuid != *uuid);
            }
        }
        Ok(())
    }

    async fn dequeue_messages(&self, client_id: &str) -> Result<Vec<BrokerMessage>, StoreError> {
        let mut state = lock(&self.state);
        let messages = state
            .queued
            .remove(client_id)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default();
        Ok(messages)
    }

    async fn iterate_all_sessions(&self) -> Result<Vec<ClientSession>, StoreError> {
        Ok(lock(&self.state).sessions.values().cloned().collect())
    }

    async fn iterate_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(lock(&self.state)
            .subscriptions
            .values()
            .flat_map(|filters| filters.values().cloned())
            .collect())
    }

    async fn iterate_node_clients(&self, node_id: &str) -> Result<Vec<ClientSession>, StoreError> {
        Ok(lock(&self.state)
            .sessions
            .values()
            .filter(|session| session.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn purge_sessions(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut state = lock(&self.state);
        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|session| session.expired(now) || session.status == ClientStatus::Delete)
            .map(|session| session.client_id.clone())
            .collect();

        for client_id in expired.iter() {
            state.sessions.remove(client_id);
            state.subscriptions.remove(client_id);
            state.queued.remove(client_id);
        }

        Ok(expired.len())
    }

    async fn purge_queued_messages(&self) -> Result<usize, StoreError> {
        let mut state = lock(&self.state);
        let orphans: Vec<String> = state
            .queued
            .keys()
            .filter(|client_id| !state.sessions.contains_key(*client_id))
            .cloned()
            .collect();

        let mut purged = 0;
        for client_id in orphans.iter() {
            if let Some(queue) = state.queued.remove(client_id) {
                purged += queue.len();
            }
        }

        Ok(purged)
    }

    async fn is_present(&self, client_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.state).sessions.contains_key(client_id))
    }
}

/// Latest retained value per topic
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<String, BrokerMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> MemoryMessageStore {
        MemoryMessageStore {
            messages: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, topic: &str) -> Option<BrokerMessage> {
        lock(&self.messages).get(topic).cloned()
    }
}

impl Default for MemoryMessageStore {
    fn default() -> MemoryMessageStore {
        MemoryMessageStore::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn add_all(&self, messages: &[BrokerMessage]) -> Result<(), StoreError> {
        let mut map = lock(&self.messages);
        for message in messages.iter() {
            map.insert(message.topic.clone(), message.clone());
        }
        Ok(())
    }

    fn del_all(&self, topics: &[String]) -> Result<(), StoreError> {
        let mut map = lock(&self.messages);
        for topic in topics.iter() {
            map.remove(topic);
        }
        Ok(())
    }

    fn find_matching(&self, filter: &str, limit: usize) -> Result<Vec<BrokerMessage>, StoreError> {
        Ok(lock(&self.messages)
            .values()
            .filter(|message| matches(&message.topic, filter))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// History plus last-value sink with an optional retention window applied
/// on append
pub struct MemoryArchiveSink {
    retention_ms: Option<u64>,
    history: Mutex<Vec<BrokerMessage>>,
    last: Mutex<HashMap<String, BrokerMessage>>,
}

impl MemoryArchiveSink {
    pub fn new(retention_ms: Option<u64>) -> MemoryArchiveSink {
        MemoryArchiveSink {
            retention_ms,
            history: Mutex::new(Vec::new()),
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn history(&self) -> Vec<BrokerMessage> {
        lock(&self.history).clone()
    }

    pub fn last_value(&self, topic: &str) -> Option<BrokerMessage> {
        lock(&self.last).get(topic).cloned()
    }
}

impl ArchiveSink for MemoryArchiveSink {
    fn add_history(&self, messages: &[BrokerMessage]) -> Result<(), StoreError> {
        let mut history = lock(&self.history);
        history.extend_from_slice(messages);
        if let Some(retention_ms) = self.retention_ms {
            let cutoff = now_millis().saturating_sub(retention_ms);
            history.retain(|message| message.time >= cutoff);
        }
        Ok(())
    }

    fn add_all(&self, messages: &[BrokerMessage]) -> Result<(), StoreError> {
        let mut last = lock(&self.last);
        for message in messages.iter() {
            last.insert(message.topic.clone(), message.clone());
        }
        Ok(())
    }

    fn connection_status(&self) -> bool {
        true
    }
}

pub struct MemoryConfigStore {
    groups: Mutex<HashMap<String, (ArchiveGroupConfig, bool)>>,
}

impl MemoryConfigStore {
    pub fn new() -> MemoryConfigStore {
        MemoryConfigStore {
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> MemoryConfigStore {
        MemoryConfigStore::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn all_archive_groups(&self) -> Result<Vec<(ArchiveGroupConfig, bool)>, StoreError> {
        Ok(lock(&self.groups).values().cloned().collect())
    }

    async fn archive_group(&self, name: &str) -> Result<Option<ArchiveGroupConfig>, StoreError> {
        Ok(lock(&self.groups).get(name).map(|(group, _)| group.clone()))
    }

    async fn save_archive_group(
        &self,
        group: ArchiveGroupConfig,
        enabled: bool,
    ) -> Result<(), StoreError> {
        lock(&self.groups).insert(group.name.clone(), (group, enabled));
        Ok(())
    }
}
