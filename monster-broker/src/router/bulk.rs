//! Outbound bulk buffers keyed by destination (a client or a peer node).
//! Enqueue goes straight into a bounded ring; only the flush decision takes
//! a small mutex so concurrent flushers cannot drain the same buffer twice.

use monster_core::BrokerMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// empty buffers idle past this window are reaped
const STALE_AFTER: Duration = Duration::from_secs(5);

struct BulkBuffer {
    tx: flume::Sender<BrokerMessage>,
    rx: flume::Receiver<BrokerMessage>,
    last_flush: Mutex<Instant>,
}

impl BulkBuffer {
    fn new(capacity: usize) -> Arc<BulkBuffer> {
        let (tx, rx) = flume::bounded(capacity);
        Arc::new(BulkBuffer {
            tx,
            rx,
            last_flush: Mutex::new(Instant::now()),
        })
    }

    fn drain(&self) -> Option<Vec<BrokerMessage>> {
        let mut last_flush = lock(&self.last_flush);
        let batch: Vec<BrokerMessage> = self.rx.try_iter().collect();
        *last_flush = Instant::now();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct BulkBuffers {
    buffers: Mutex<HashMap<String, Arc<BulkBuffer>>>,
    capacity: usize,
    bulk_size: usize,
    timeout: Duration,
}

impl BulkBuffers {
    pub fn new(bulk_size: usize, timeout: Duration, capacity: usize) -> BulkBuffers {
        BulkBuffers {
            buffers: Mutex::new(HashMap::new()),
            capacity,
            bulk_size,
            timeout,
        }
    }

    /// Enqueues for a destination. Returns a batch once the size threshold
    /// is crossed; time based flushing happens through `flush_expired`
    pub fn push(&self, destination: &str, message: BrokerMessage) -> Option<Vec<BrokerMessage>> {
        let buffer = {
            let mut buffers = lock(&self.buffers);
            buffers
                .entry(destination.to_owned())
                .or_insert_with(|| BulkBuffer::new(self.capacity))
                .clone()
        };

        if let Err(flume::TrySendError::Full(message)) = buffer.tx.try_send(message) {
            error!(
                "bulk buffer for {} full. Dropping message {}",
                destination, message.uuid
            );
            return None;
        }

        if buffer.rx.len() >= self.bulk_size {
            buffer.drain()
        } else {
            None
        }
    }

    /// Drains every buffer whose flush timeout elapsed and reaps buffers
    /// that have been empty past the stale window
    pub fn flush_expired(&self) -> Vec<(String, Vec<BrokerMessage>)> {
        let now = Instant::now();
        let mut flushed = Vec::new();
        let mut buffers = lock(&self.buffers);
        buffers.retain(|destination, buffer| {
            if buffer.rx.is_empty() {
                let last_flush = *lock(&buffer.last_flush);
                return now.duration_since(last_flush) < STALE_AFTER;
            }

            let due = {
                let last_flush = lock(&buffer.last_flush);
                now.duration_since(*last_flush) >= self.timeout
            };

            if due {
                if let Some(batch) = buffer.drain() {
                    flushed.push((destination.clone(), batch));
                }
            }

            true
        });

        flushed
    }

    /// Unconditional drain of everything, used at shutdown
    pub fn flush_all(&self) -> Vec<(String, Vec<BrokerMessage>)> {
        let buffers = lock(&self.buffers);
        buffers
            .iter()
            .filter_map(|(destination, buffer)| {
                buffer.drain().map(|batch| (destination.clone(), batch))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use monster_core::QoS;

    fn message(payload: &str) -> BrokerMessage {
        BrokerMessage::new("pub", "t", QoS::AtLeastOnce, payload)
    }

    #[test]
    fn size_threshold_returns_a_full_batch() {
        let buffers = BulkBuffers::new(3, Duration::from_secs(60), 16);

        assert!(buffers.push("c1", message("m0")).is_none());
        assert!(buffers.push("c1", message("m1")).is_none());
        let batch = buffers.push("c1", message("m2")).unwrap();
        assert_eq!(batch.len(), 3);

        // the buffer starts over after a flush
        assert!(buffers.push("c1", message("m3")).is_none());
    }

    #[test]
    fn destinations_do_not_share_buffers() {
        let buffers = BulkBuffers::new(2, Duration::from_secs(60), 16);
        assert!(buffers.push("c1", message("m0")).is_none());
        assert!(buffers.push("c2", message("m1")).is_none());
        assert!(buffers.push("c1", message("m2")).is_some());
    }

    #[test]
    fn timeout_flush_drains_pending_messages() {
        let buffers = BulkBuffers::new(100, Duration::from_millis(0), 16);
        buffers.push("c1", message("m0"));

        let flushed = buffers.flush_expired();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "c1");
        assert_eq!(flushed[0].1.len(), 1);

        // nothing left to flush
        assert!(buffers.flush_expired().is_empty());
    }

    #[test]
    fn overflow_drops_the_incoming_message() {
        let buffers = BulkBuffers::new(100, Duration::from_secs(60), 2);
        buffers.push("c1", message("m0"));
        buffers.push("c1", message("m1"));
        buffers.push("c1", message("m2"));

        let flushed = buffers.flush_all();
        assert_eq!(flushed[0].1.len(), 2);
    }
}
