use fnv::FnvHashMap;
use monster_core::{has_wildcards, QoS};

/// Answers "who subscribes to this topic" with a dual index. Concrete
/// filters live in a hash of hashes, wildcard filters in a trie split by
/// `/`. A lookup walks both sides and unions the result.
///
/// Writes happen only on the router loop; workers read through a shared
/// read lock
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    // topic -> client -> qos, no wildcards on this side
    exact: FnvHashMap<String, FnvHashMap<String, QoS>>,
    root: TrieNode,
    wildcard_patterns: usize,
    wildcard_subscriptions: usize,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: FnvHashMap<String, TrieNode>,
    plus: Option<Box<TrieNode>>,
    // subscribers whose filter terminates exactly at this node
    leaf: FnvHashMap<String, QoS>,
    // subscribers of a `#` hanging off this node. `#` is terminal and
    // matches the remaining levels including zero of them
    hash: FnvHashMap<String, QoS>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.plus.is_none() && self.leaf.is_empty() && self.hash.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub exact_topics: usize,
    pub exact_subscriptions: usize,
    pub wildcard_patterns: usize,
    pub wildcard_subscriptions: usize,
}

impl SubscriptionIndex {
    pub fn new() -> SubscriptionIndex {
        SubscriptionIndex::default()
    }

    /// Idempotent. Subscribing the same `(client, filter)` again only
    /// overwrites the qos
    pub fn subscribe(&mut self, client_id: &str, filter: &str, qos: QoS) {
        if !has_wildcards(filter) {
            self.exact
                .entry(filter.to_owned())
                .or_default()
                .insert(client_id.to_owned(), qos);
            return;
        }

        let mut node = &mut self.root;
        let mut segments = filter.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segment == "#" {
                // validated filters only carry `#` as the last segment
                let was_empty = node.hash.is_empty();
                if node.hash.insert(client_id.to_owned(), qos).is_none() {
                    self.wildcard_subscriptions += 1;
                    if was_empty {
                        self.wildcard_patterns += 1;
                    }
                }
                return;
            }

            node = if segment == "+" {
                node.plus.get_or_insert_with(Default::default)
            } else {
                node.children.entry(segment.to_owned()).or_default()
            };

            if segments.peek().is_none() {
                let was_empty = node.leaf.is_empty();
                if node.leaf.insert(client_id.to_owned(), qos).is_none() {
                    self.wildcard_subscriptions += 1;
                    if was_empty {
                        self.wildcard_patterns += 1;
                    }
                }
            }
        }
    }

    /// No-op when the subscription is absent
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) {
        if !has_wildcards(filter) {
            if let Some(clients) = self.exact.get_mut(filter) {
                clients.remove(client_id);
                if clients.is_empty() {
                    self.exact.remove(filter);
                }
            }
            return;
        }

        let segments: Vec<&str> = filter.split('/').collect();
        let (removed, pattern_gone) = Self::remove_wild(&mut self.root, &segments, client_id);
        if removed {
            self.wildcard_subscriptions -= 1;
        }
        if pattern_gone {
            self.wildcard_patterns -= 1;
        }
    }

    fn remove_wild(node: &mut TrieNode, segments: &[&str], client_id: &str) -> (bool, bool) {
        match segments.split_first() {
            Some((&"#", _)) => {
                let removed = node.hash.remove(client_id).is_some();
                (removed, removed && node.hash.is_empty())
            }
            Some((segment, rest)) => {
                let result = if *segment == "+" {
                    match node.plus.as_mut() {
                        Some(plus) => {
                            let result = Self::remove_wild(plus, rest, client_id);
                            if plus.is_empty() {
                                node.plus = None;
                            }
                            result
                        }
                        None => (false, false),
                    }
                } else {
                    match node.children.get_mut(*segment) {
                        Some(child) => {
                            let result = Self::remove_wild(child, rest, client_id);
                            if child.is_empty() {
                                node.children.remove(*segment);
                            }
                            result
                        }
                        None => (false, false),
                    }
                };
                result
            }
            None => {
                let removed = node.leaf.remove(client_id).is_some();
                (removed, removed && node.leaf.is_empty())
            }
        }
    }

    /// Union of the exact and wildcard sides for a concrete topic. A client
    /// matched through more than one filter appears once, at the highest
    /// matching qos
    pub fn find_all_subscribers(&self, topic: &str) -> FnvHashMap<String, QoS> {
        let mut out = FnvHashMap::default();
        if let Some(clients) = self.exact.get(topic) {
            merge(&mut out, clients);
        }

        let segments: Vec<&str> = topic.split('/').collect();
        let reserved = topic.starts_with('$');
        Self::walk(&self.root, &segments, 0, reserved, &mut out);
        out
    }

    fn walk(
        node: &TrieNode,
        segments: &[&str],
        depth: usize,
        reserved: bool,
        out: &mut FnvHashMap<String, QoS>,
    ) {
        // a `$` topic is never matched by a wildcard at the first level
        let wildcards_allowed = !(reserved && depth == 0);
        if wildcards_allowed {
            merge(out, &node.hash);
        }

        if depth == segments.len() {
            merge(out, &node.leaf);
            return;
        }

        if let Some(child) = node.children.get(segments[depth]) {
            Self::walk(child, segments, depth + 1, reserved, out);
        }

        if wildcards_allowed {
            if let Some(plus) = &node.plus {
                Self::walk(plus, segments, depth + 1, reserved, out);
            }
        }
    }

    /// Clients holding exactly this filter (not filters that merely overlap
    /// with it)
    pub fn subscribers_of_filter(&self, filter: &str) -> Vec<String> {
        if !has_wildcards(filter) {
            return self
                .exact
                .get(filter)
                .map(|clients| clients.keys().cloned().collect())
                .unwrap_or_default();
        }

        let mut node = &self.root;
        let mut segments = filter.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segment == "#" {
                return node.hash.keys().cloned().collect();
            }

            let next = if segment == "+" {
                node.plus.as_deref()
            } else {
                node.children.get(segment)
            };

            node = match next {
                Some(next) => next,
                None => return Vec::new(),
            };

            if segments.peek().is_none() {
                return node.leaf.keys().cloned().collect();
            }
        }

        Vec::new()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            exact_topics: self.exact.len(),
            exact_subscriptions: self.exact.values().map(|clients| clients.len()).sum(),
            wildcard_patterns: self.wildcard_patterns,
            wildcard_subscriptions: self.wildcard_subscriptions,
        }
    }
}

fn merge(out: &mut FnvHashMap<String, QoS>, subscribers: &FnvHashMap<String, QoS>) {
    for (client_id, qos) in subscribers.iter() {
        let entry = out.entry(client_id.clone()).or_insert(*qos);
        if (*qos as u8) > (*entry as u8) {
            *entry = *qos;
        }
    }
}
