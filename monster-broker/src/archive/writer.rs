//! The batching writer behind every archive group and behind the broker's
//! retained store. A dedicated thread drains the group's bounded queue into
//! blocks and hands them to the sinks. Sink failures are logged and never
//! propagate into the publish path.

use monster_core::BrokerMessage;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::store::{ArchiveSink, MessageStore};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const FLUSH_BATCH: usize = 4000;

pub struct ArchiveWriter {
    tx: flume::Sender<BrokerMessage>,
    done: flume::Receiver<()>,
    stopped: Arc<AtomicBool>,
}

impl ArchiveWriter {
    pub fn spawn(
        name: &str,
        capacity: usize,
        retained: Option<Arc<dyn MessageStore>>,
        history: Option<Arc<dyn ArchiveSink>>,
        last_value: Option<Arc<dyn ArchiveSink>>,
    ) -> Result<ArchiveWriter, std::io::Error> {
        let (tx, rx) = flume::bounded(capacity);
        let (done_tx, done_rx) = flume::bounded(1);
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_flag = stopped.clone();
        thread::Builder::new()
            .name(format!("archive-{}", name))
            .spawn(move || {
                let mut block = Vec::with_capacity(FLUSH_BATCH);
                loop {
                    match rx.recv_timeout(FLUSH_INTERVAL) {
                        Ok(message) => {
                            block.push(message);
                            while block.len() < FLUSH_BATCH {
                                match rx.try_recv() {
                                    Ok(message) => block.push(message),
                                    Err(_) => break,
                                }
                            }

                            flush(&mut block, &retained, &history, &last_value);
                        }
                        Err(flume::RecvTimeoutError::Timeout) => (),
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    }

                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                }

                // drain whatever arrived before the stop was observed
                block.extend(rx.try_iter());
                flush(&mut block, &retained, &history, &last_value);
                let _ = done_tx.send(());
            })?;

        Ok(ArchiveWriter {
            tx,
            done: done_rx,
            stopped,
        })
    }

    /// Try-add. Dropping on overflow keeps the publisher from ever blocking
    /// on a slow sink
    pub fn enqueue(&self, message: BrokerMessage) -> bool {
        if self.stopped.load(Ordering::Relaxed) {
            return false;
        }

        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(message)) => {
                error!("archive queue full. Dropping message {}", message.uuid);
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Signals the writer and waits at most `timeout` for it to drain and
    /// exit. Returns false when the deadline expired
    pub fn stop(&self, timeout: Duration) -> bool {
        self.stopped.store(true, Ordering::Relaxed);
        self.done.recv_timeout(timeout).is_ok()
    }
}

fn flush(
    block: &mut Vec<BrokerMessage>,
    retained: &Option<Arc<dyn MessageStore>>,
    history: &Option<Arc<dyn ArchiveSink>>,
    last_value: &Option<Arc<dyn ArchiveSink>>,
) {
    if block.is_empty() {
        return;
    }

    if let Some(store) = retained {
        let (upserts, deletes) = coalesce_retained(block);
        if !deletes.is_empty() {
            if let Err(e) = store.del_all(&deletes) {
                error!("retained delete failed. Error = {:?}", e);
            }
        }

        if !upserts.is_empty() {
            if let Err(e) = store.add_all(&upserts) {
                error!("retained upsert failed. Error = {:?}", e);
            }
        }
    }

    if let Some(sink) = history {
        // full history keeps the block order, no coalescing
        if let Err(e) = sink.add_history(block) {
            error!("history append failed. Error = {:?}", e);
        }
    }

    if let Some(sink) = last_value {
        let latest = latest_per_topic(block);
        if let Err(e) = sink.add_all(&latest) {
            error!("last value upsert failed. Error = {:?}", e);
        }
    }

    block.clear();
}

/// Walks the block in reverse arrival order and keeps only the newest
/// write per topic. An empty payload schedules a delete, everything else an
/// upsert, so a burst costs one write per topic per flush
fn coalesce_retained(block: &[BrokerMessage]) -> (Vec<BrokerMessage>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut upserts = Vec::new();
    let mut deletes = Vec::new();

    for message in block.iter().rev().filter(|message| message.retain) {
        if !seen.insert(message.topic.clone()) {
            continue;
        }

        if message.payload.is_empty() {
            deletes.push(message.topic.clone());
        } else {
            upserts.push(message.clone());
        }
    }

    (upserts, deletes)
}

fn latest_per_topic(block: &[BrokerMessage]) -> Vec<BrokerMessage> {
    let mut seen = HashSet::new();
    let mut latest = Vec::new();
    for message in block.iter().rev() {
        if seen.insert(message.topic.clone()) {
            latest.push(message.clone());
        }
    }

    latest
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::{MemoryArchiveSink, MemoryMessageStore};
    use monster_core::QoS;
    use pretty_assertions::assert_eq;

    fn retain(topic: &str, payload: &str) -> BrokerMessage {
        BrokerMessage::new("pub", topic, QoS::AtMostOnce, payload).retain()
    }

    #[test]
    fn a_burst_of_retains_coalesces_to_the_last_payload() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut block: Vec<_> = (1..=5).map(|i| retain("t", &format!("p{}", i))).collect();

        flush(&mut block, &Some(store.clone() as Arc<dyn MessageStore>), &None, &None);

        let kept = store.get("t").unwrap();
        assert_eq!(kept.payload, &b"p5"[..]);
        assert!(block.is_empty());
    }

    #[test]
    fn a_trailing_empty_payload_deletes_the_topic() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut block = vec![retain("t", "p1"), retain("t", "p2"), retain("t", "")];

        flush(&mut block, &Some(store.clone() as Arc<dyn MessageStore>), &None, &None);

        assert!(store.get("t").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn history_keeps_every_message_in_order() {
        let sink = Arc::new(MemoryArchiveSink::new(None));
        let mut block: Vec<_> = (0..4)
            .map(|i| BrokerMessage::new("pub", "t", QoS::AtMostOnce, format!("m{}", i)))
            .collect();

        flush(&mut block, &None, &Some(sink.clone() as Arc<dyn ArchiveSink>), &None);

        let payloads: Vec<String> = sink
            .history()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn last_value_sink_gets_the_newest_message_per_topic() {
        let sink = Arc::new(MemoryArchiveSink::new(None));
        let mut block = vec![
            BrokerMessage::new("pub", "a", QoS::AtMostOnce, "a1"),
            BrokerMessage::new("pub", "b", QoS::AtMostOnce, "b1"),
            BrokerMessage::new("pub", "a", QoS::AtMostOnce, "a2"),
        ];

        flush(&mut block, &None, &None, &Some(sink.clone() as Arc<dyn ArchiveSink>));

        assert_eq!(sink.last_value("a").unwrap().payload, &b"a2"[..]);
        assert_eq!(sink.last_value("b").unwrap().payload, &b"b1"[..]);
    }

    #[test]
    fn writer_thread_flushes_and_stops_cleanly() {
        let store = Arc::new(MemoryMessageStore::new());
        let writer = ArchiveWriter::spawn(
            "test",
            16,
            Some(store.clone() as Arc<dyn MessageStore>),
            None,
            None,
        )
        .unwrap();

        assert!(writer.enqueue(retain("t", "p1")));
        assert!(writer.enqueue(retain("t", "p2")));
        assert!(writer.stop(Duration::from_secs(5)));

        assert_eq!(store.get("t").unwrap().payload, &b"p2"[..]);
        // enqueue after stop is refused
        assert!(!writer.enqueue(retain("t", "p3")));
    }

    #[test]
    fn retained_coalescing_walks_in_reverse_arrival_order() {
        let block = vec![
            retain("a", "a1"),
            retain("b", "b1"),
            retain("a", "a2"),
            retain("b", ""),
            BrokerMessage::new("pub", "c", QoS::AtMostOnce, "ignored"),
        ];

        let (upserts, deletes) = coalesce_retained(&block);
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].topic, "a");
        assert_eq!(upserts[0].payload, &b"a2"[..]);
        assert_eq!(deletes, vec!["b".to_owned()]);
    }
}
