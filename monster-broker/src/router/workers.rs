//! The publish worker pool. When bulk publish processing is on, the router
//! hands whole batches to daemon OS threads round robin. Each worker groups
//! its batch by topic so one subscription lookup serves every message on
//! that topic.

use monster_core::BrokerMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use super::Shared;

pub(crate) struct PublishWorkerPool {
    senders: Vec<flume::Sender<Vec<BrokerMessage>>>,
    next: AtomicUsize,
}

impl PublishWorkerPool {
    pub fn spawn(
        shared: &Arc<Shared>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<PublishWorkerPool, std::io::Error> {
        let mut senders = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = flume::bounded(queue_capacity);
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("publish-worker-{}", id))
                .spawn(move || worker_loop(shared, rx))?;
            senders.push(tx);
        }

        Ok(PublishWorkerPool { senders, next: AtomicUsize::new(0) })
    }

    /// Round robin hand off. A full worker queue drops the whole batch
    pub fn dispatch(&self, shared: &Shared, batch: Vec<BrokerMessage>) {
        if self.senders.is_empty() {
            return;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if let Err(flume::TrySendError::Full(batch)) = self.senders[index].try_send(batch) {
            error!(
                "publish worker {} queue full. Dropping batch of {}",
                index,
                batch.len()
            );
            shared.metrics.incr_dropped(batch.len() as u64);
        }
    }
}

fn worker_loop(shared: Arc<Shared>, rx: flume::Receiver<Vec<BrokerMessage>>) {
    while let Ok(batch) = rx.recv() {
        // per topic order inside the batch is the arrival order
        let mut by_topic: HashMap<String, Vec<BrokerMessage>> = HashMap::new();
        for message in batch {
            by_topic.entry(message.topic.clone()).or_default().push(message);
        }

        for (topic, messages) in by_topic {
            shared.distribute_topic(&topic, messages);
        }
    }
}
