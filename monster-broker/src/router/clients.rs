//! Runtime state of clients connected to this node, plus the node level
//! counters. Durable session state lives in the session store; this is only
//! what the dispatch path needs at hand.

use monster_core::BrokerMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::Outgoing;
use crate::cluster::NodeMetricsSnapshot;

#[derive(Debug, Default)]
pub(crate) struct SessionMetrics {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
}

impl SessionMetrics {
    pub fn incr_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_out(&self, count: u64) {
        self.messages_out.fetch_add(count, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub(crate) struct LocalClient {
    /// Transport handle. `None` while a persistent session is paused
    pub handle: Option<flume::Sender<Outgoing>>,
    pub clean_session: bool,
    pub last_will: Option<BrokerMessage>,
    /// Messages arriving between connect and readiness, drained in order
    /// when the client goes online
    pub inflight: VecDeque<BrokerMessage>,
    pub metrics: Arc<SessionMetrics>,
}

impl LocalClient {
    pub fn new(
        handle: flume::Sender<Outgoing>,
        clean_session: bool,
        last_will: Option<BrokerMessage>,
    ) -> LocalClient {
        LocalClient {
            handle: Some(handle),
            clean_session,
            last_will,
            inflight: VecDeque::new(),
            metrics: Arc::new(SessionMetrics::default()),
        }
    }

    /// Bounded. Returns false when the ring is full and the message was
    /// dropped
    pub fn push_inflight(&mut self, message: BrokerMessage, capacity: usize) -> bool {
        if self.inflight.len() >= capacity {
            return false;
        }

        self.inflight.push_back(message);
        true
    }
}

#[derive(Debug, Default)]
pub(crate) struct RouterMetrics {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    messages_dropped: AtomicU64,
    expansion_errors: AtomicU64,
}

impl RouterMetrics {
    pub fn incr_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_out(&self, count: u64) {
        self.messages_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_expansion_errors(&self) {
        self.expansion_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, clients: usize) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            expansion_errors: self.expansion_errors.load(Ordering::Relaxed),
            clients,
        }
    }

    pub fn reset(&self) {
        self.messages_in.store(0, Ordering::Relaxed);
        self.messages_out.store(0, Ordering::Relaxed);
        self.messages_dropped.store(0, Ordering::Relaxed);
        self.expansion_errors.store(0, Ordering::Relaxed);
    }
}
