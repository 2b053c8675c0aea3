//! Eventually consistent replicated maps. Every node keeps a local mirror
//! and publishes timestamped deltas on the map's bus channel; peers apply
//! remote deltas and ignore their own echoes. A joining node asks any peer
//! for a snapshot; since snapshots and deltas both carry timestamps and are
//! merged last-writer-wins, they can arrive in any order.

use monster_core::now_millis;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;

use super::{BusEvent, ClusterBus};

#[derive(Debug, Clone)]
struct Entry {
    // `None` is a tombstone so that a late put with an older timestamp
    // cannot resurrect a removed key
    value: Option<String>,
    time: u64,
}

/// Last-writer-wins map of single values, e.g. `clientId -> nodeId`
pub struct ReplicatedMap {
    channel: &'static str,
    node_id: String,
    bus: Arc<dyn ClusterBus>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ReplicatedMap {
    pub fn new(channel: &'static str, node_id: &str, bus: Arc<dyn ClusterBus>) -> Arc<ReplicatedMap> {
        Arc::new(ReplicatedMap {
            channel,
            node_id: node_id.to_owned(),
            bus,
            entries: RwLock::new(HashMap::new()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn put(&self, key: &str, value: &str) {
        let time = now_millis();
        self.merge(key, Some(value.to_owned()), time);
        self.bus.publish(
            self.channel,
            BusEvent::MapPut {
                key: key.to_owned(),
                value: value.to_owned(),
                time,
                origin: self.node_id.clone(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        let time = now_millis();
        self.merge(key, None, time);
        self.bus.publish(
            self.channel,
            BusEvent::MapRemove {
                key: key.to_owned(),
                time,
                origin: self.node_id.clone(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).and_then(|entry| entry.value.clone())
    }

    pub fn size(&self) -> usize {
        self.read().values().filter(|entry| entry.value.is_some()).count()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Removes every key currently mapped to `node`. Used when a cluster
    /// member disappears
    pub fn remove_node(&self, node: &str) {
        let keys: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, entry)| entry.value.as_deref() == Some(node))
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            self.remove(&key);
        }
    }

    fn merge(&self, key: &str, value: Option<String>, time: u64) {
        let mut entries = self.write();
        match entries.get(key) {
            Some(existing) if existing.time > time => (),
            _ => {
                entries.insert(key.to_owned(), Entry { value, time });
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, Option<String>, u64)> {
        self.read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.time))
            .collect()
    }

    pub fn apply(&self, event: &BusEvent) {
        match event {
            BusEvent::MapPut { key, value, time, origin } if *origin != self.node_id => {
                self.merge(key, Some(value.clone()), *time);
            }
            BusEvent::MapRemove { key, time, origin } if *origin != self.node_id => {
                self.merge(key, None, *time);
            }
            BusEvent::SyncRequest { reply_to, origin } if *origin != self.node_id => {
                self.bus.publish(
                    reply_to,
                    BusEvent::MapSnapshot {
                        entries: self.snapshot(),
                        origin: self.node_id.clone(),
                    },
                );
            }
            BusEvent::MapSnapshot { entries, origin } if *origin != self.node_id => {
                for (key, value, time) in entries.iter() {
                    self.merge(key, value.clone(), *time);
                }
            }
            _ => (),
        }
    }

    /// Consumes the map's bus channel, answers sync requests and merges
    /// remote state. Also announces this node so an existing peer ships its
    /// snapshot
    pub fn start_replication(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let rx = this.bus.subscribe(this.channel);
        let reply_to = format!("{}.sync.{}", this.channel, this.node_id);
        let sync_rx = this.bus.subscribe(&reply_to);
        this.bus.publish(
            this.channel,
            BusEvent::SyncRequest {
                reply_to,
                origin: this.node_id.clone(),
            },
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv_async() => match event {
                        Ok(event) => this.apply(&event),
                        Err(_) => break,
                    },
                    event = sync_rx.recv_async() => match event {
                        Ok(event) => this.apply(&event),
                        Err(_) => break,
                    },
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
struct MemberEntry {
    present: bool,
    time: u64,
}

/// Replicated map of sets, e.g. `topicFilter -> {nodeIds}`. Adds and
/// removes of distinct members commute; for the same member the later
/// timestamp wins
pub struct ReplicatedSetMap {
    channel: &'static str,
    node_id: String,
    bus: Arc<dyn ClusterBus>,
    entries: RwLock<HashMap<String, HashMap<String, MemberEntry>>>,
}

impl ReplicatedSetMap {
    pub fn new(channel: &'static str, node_id: &str, bus: Arc<dyn ClusterBus>) -> Arc<ReplicatedSetMap> {
        Arc::new(ReplicatedSetMap {
            channel,
            node_id: node_id.to_owned(),
            bus,
            entries: RwLock::new(HashMap::new()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, MemberEntry>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, MemberEntry>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_to_set(&self, key: &str, value: &str) {
        let time = now_millis();
        self.merge(key, value, true, time);
        self.bus.publish(
            self.channel,
            BusEvent::SetAdd {
                key: key.to_owned(),
                value: value.to_owned(),
                time,
                origin: self.node_id.clone(),
            },
        );
    }

    pub fn remove_from_set(&self, key: &str, value: &str) {
        let time = now_millis();
        self.merge(key, value, false, time);
        self.bus.publish(
            self.channel,
            BusEvent::SetRemove {
                key: key.to_owned(),
                value: value.to_owned(),
                time,
                origin: self.node_id.clone(),
            },
        );
    }

    /// `None` when no member is present for the key
    pub fn get_set(&self, key: &str) -> Option<HashSet<String>> {
        let entries = self.read();
        let members: HashSet<String> = entries
            .get(key)?
            .iter()
            .filter(|(_, member)| member.present)
            .map(|(value, _)| value.clone())
            .collect();

        if members.is_empty() {
            None
        } else {
            Some(members)
        }
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.read()
            .get(key)
            .and_then(|members| members.get(value))
            .map_or(false, |member| member.present)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, members)| members.values().any(|member| member.present))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn remove_value_from_all_sets(&self, value: &str) {
        let time = now_millis();
        self.drop_value(value, time);
        self.bus.publish(
            self.channel,
            BusEvent::SetDropValue {
                value: value.to_owned(),
                time,
                origin: self.node_id.clone(),
            },
        );
    }

    fn merge(&self, key: &str, value: &str, present: bool, time: u64) {
        let mut entries = self.write();
        let members = entries.entry(key.to_owned()).or_default();
        match members.get(value) {
            Some(existing) if existing.time > time => (),
            _ => {
                members.insert(value.to_owned(), MemberEntry { present, time });
            }
        }
    }

    fn drop_value(&self, value: &str, time: u64) {
        let mut entries = self.write();
        for members in entries.values_mut() {
            if let Some(member) = members.get_mut(value) {
                if member.time <= time {
                    member.present = false;
                    member.time = time;
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, Vec<(String, bool, u64)>)> {
        self.read()
            .iter()
            .map(|(key, members)| {
                let members = members
                    .iter()
                    .map(|(value, member)| (value.clone(), member.present, member.time))
                    .collect();
                (key.clone(), members)
            })
            .collect()
    }

    pub fn apply(&self, event: &BusEvent) {
        match event {
            BusEvent::SetAdd { key, value, time, origin } if *origin != self.node_id => {
                self.merge(key, value, true, *time);
            }
            BusEvent::SetRemove { key, value, time, origin } if *origin != self.node_id => {
                self.merge(key, value, false, *time);
            }
            BusEvent::SetDropValue { value, time, origin } if *origin != self.node_id => {
                self.drop_value(value, *time);
            }
            BusEvent::SyncRequest { reply_to, origin } if *origin != self.node_id => {
                self.bus.publish(
                    reply_to,
                    BusEvent::SetSnapshot {
                        entries: self.snapshot(),
                        origin: self.node_id.clone(),
                    },
                );
            }
            BusEvent::SetSnapshot { entries, origin } if *origin != self.node_id => {
                for (key, members) in entries.iter() {
                    for (value, present, time) in members.iter() {
                        self.merge(key, value, *present, *time);
                    }
                }
            }
            _ => (),
        }
    }

    pub fn start_replication(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let rx = this.bus.subscribe(this.channel);
        let reply_to = format!("{}.sync.{}", this.channel, this.node_id);
        let sync_rx = this.bus.subscribe(&reply_to);
        this.bus.publish(
            this.channel,
            BusEvent::SyncRequest {
                reply_to,
                origin: this.node_id.clone(),
            },
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv_async() => match event {
                        Ok(event) => this.apply(&event),
                        Err(_) => break,
                    },
                    event = sync_rx.recv_async() => match event {
                        Ok(event) => this.apply(&event),
                        Err(_) => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::{LocalBus, CLIENT_NODE_MAPPING, TOPIC_NODE_MAPPING};

    fn two_maps() -> (Arc<ReplicatedMap>, Arc<ReplicatedMap>) {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let a = ReplicatedMap::new(CLIENT_NODE_MAPPING, "node-a", bus.clone());
        let b = ReplicatedMap::new(CLIENT_NODE_MAPPING, "node-b", bus);
        (a, b)
    }

    fn drain(rx: &flume::Receiver<BusEvent>, map: &ReplicatedMap) {
        while let Ok(event) = rx.try_recv() {
            map.apply(&event);
        }
    }

    #[test]
    fn deltas_replicate_and_own_echoes_are_ignored() {
        let (a, b) = two_maps();
        let b_rx = b.bus.subscribe(CLIENT_NODE_MAPPING);
        let a_rx = a.bus.subscribe(CLIENT_NODE_MAPPING);

        a.put("c1", "node-a");
        drain(&b_rx, &b);
        drain(&a_rx, &a);

        assert_eq!(a.get("c1"), Some("node-a".to_owned()));
        assert_eq!(b.get("c1"), Some("node-a".to_owned()));
        assert_eq!(b.size(), 1);
    }

    #[test]
    fn later_writes_win() {
        let (a, _) = two_maps();
        a.merge("c1", Some("node-a".to_owned()), 100);
        a.merge("c1", Some("node-b".to_owned()), 200);
        // stale delta arriving late does not overwrite
        a.merge("c1", Some("node-c".to_owned()), 150);

        assert_eq!(a.get("c1"), Some("node-b".to_owned()));
    }

    #[test]
    fn removed_keys_leave_tombstones() {
        let (a, _) = two_maps();
        a.merge("c1", Some("node-a".to_owned()), 100);
        a.merge("c1", None, 200);
        a.merge("c1", Some("node-a".to_owned()), 150);

        assert_eq!(a.get("c1"), None);
        assert_eq!(a.size(), 0);
        assert!(a.keys().is_empty());
    }

    #[test]
    fn remove_node_purges_every_mapping_to_it() {
        let (a, _) = two_maps();
        a.put("c1", "node-a");
        a.put("c2", "node-b");
        a.put("c3", "node-a");

        a.remove_node("node-a");

        assert_eq!(a.get("c1"), None);
        assert_eq!(a.get("c2"), Some("node-b".to_owned()));
        assert_eq!(a.get("c3"), None);
    }

    #[test]
    fn snapshot_sync_brings_a_joining_node_up_to_date() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let a = ReplicatedMap::new(CLIENT_NODE_MAPPING, "node-a", bus.clone());
        let a_rx = bus.subscribe(CLIENT_NODE_MAPPING);
        a.put("c1", "node-a");
        a.put("c2", "node-a");

        // node-b joins and requests a snapshot
        let b = ReplicatedMap::new(CLIENT_NODE_MAPPING, "node-b", bus.clone());
        let sync_rx = bus.subscribe("cluster.client.node-mapping.sync.node-b");
        bus.publish(
            CLIENT_NODE_MAPPING,
            BusEvent::SyncRequest {
                reply_to: "cluster.client.node-mapping.sync.node-b".to_owned(),
                origin: "node-b".to_owned(),
            },
        );
        drain(&a_rx, &a);
        while let Ok(event) = sync_rx.try_recv() {
            b.apply(&event);
        }

        assert_eq!(b.get("c1"), Some("node-a".to_owned()));
        assert_eq!(b.get("c2"), Some("node-a".to_owned()));
    }

    #[test]
    fn set_map_add_and_remove() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let map = ReplicatedSetMap::new(TOPIC_NODE_MAPPING, "node-a", bus);

        map.add_to_set("a/b", "node-a");
        map.add_to_set("a/b", "node-b");
        assert!(map.contains("a/b", "node-a"));
        assert_eq!(map.get_set("a/b").map(|set| set.len()), Some(2));

        map.remove_from_set("a/b", "node-a");
        map.remove_from_set("a/b", "node-b");
        // entry is gone once the set is empty
        assert_eq!(map.get_set("a/b"), None);
        assert!(map.keys().is_empty());
    }

    #[test]
    fn dropping_a_value_clears_it_from_every_set() {
        let bus: Arc<dyn ClusterBus> = Arc::new(LocalBus::new());
        let map = ReplicatedSetMap::new(TOPIC_NODE_MAPPING, "node-a", bus);

        map.add_to_set("a/b", "node-a");
        map.add_to_set("c/d", "node-a");
        map.add_to_set("c/d", "node-b");

        map.remove_value_from_all_sets("node-a");

        assert_eq!(map.get_set("a/b"), None);
        assert_eq!(
            map.get_set("c/d"),
            Some(vec!["node-b".to_owned()].into_iter().collect())
        );
    }
}
