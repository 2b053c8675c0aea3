//! Archive groups. A group is a named pipeline that records matching
//! traffic to a retained store, a full history sink and/or a last-value
//! sink, each behind its own bounded queue and writer thread.

pub mod controller;
pub mod writer;

use core::fmt;
use monster_core::{matches, BrokerMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::store::{ArchiveSink, MessageStore, StoreKind};
use writer::ArchiveWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Binary,
    Json,
}

impl Default for PayloadFormat {
    fn default() -> PayloadFormat {
        PayloadFormat::Binary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveGroupConfig {
    pub name: String,
    /// Empty means "everything"
    pub topic_filter: Vec<String>,
    /// Only record messages carrying the retain flag
    pub retained_only: bool,
    pub retained_store: StoreKind,
    pub archive_sink: StoreKind,
    pub last_value_sink: StoreKind,
    pub payload_format: PayloadFormat,
    pub retention_ms: Option<u64>,
    pub purge_interval_ms: Option<u64>,
    pub queue_capacity: usize,
}

impl Default for ArchiveGroupConfig {
    fn default() -> ArchiveGroupConfig {
        ArchiveGroupConfig {
            name: String::new(),
            topic_filter: Vec::new(),
            retained_only: false,
            retained_store: StoreKind::None,
            archive_sink: StoreKind::None,
            last_value_sink: StoreKind::None,
            payload_format: PayloadFormat::default(),
            retention_ms: None,
            purge_interval_ms: None,
            queue_capacity: writer::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ArchiveGroupConfig {
    pub fn named<S: Into<String>>(name: S) -> ArchiveGroupConfig {
        ArchiveGroupConfig {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A running archive group: its config plus the writer draining its queue
pub struct ArchiveGroup {
    config: ArchiveGroupConfig,
    writer: ArchiveWriter,
}

impl ArchiveGroup {
    pub fn start(
        config: ArchiveGroupConfig,
        retained: Option<Arc<dyn MessageStore>>,
        history: Option<Arc<dyn ArchiveSink>>,
        last_value: Option<Arc<dyn ArchiveSink>>,
    ) -> Result<ArchiveGroup, std::io::Error> {
        let writer = ArchiveWriter::spawn(
            &config.name,
            config.queue_capacity,
            retained,
            history,
            last_value,
        )?;

        Ok(ArchiveGroup { config, writer })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ArchiveGroupConfig {
        &self.config
    }

    /// A message enters the group iff the group has no filters or any
    /// filter matches, and the retained-only gate passes
    pub fn matches(&self, message: &BrokerMessage) -> bool {
        if self.config.retained_only && !message.retain {
            return false;
        }

        self.config.topic_filter.is_empty()
            || self
                .config
                .topic_filter
                .iter()
                .any(|filter| matches(&message.topic, filter))
    }

    /// Never blocks the publisher. A full queue drops the message
    pub fn enqueue(&self, message: BrokerMessage) -> bool {
        self.writer.enqueue(message)
    }

    /// Stops the writer, waiting at most `timeout` for a clean drain.
    /// Returns false when the deadline expired and bookkeeping was forced
    pub fn stop(&self, timeout: Duration) -> bool {
        self.writer.stop(timeout)
    }
}

impl fmt::Debug for ArchiveGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArchiveGroup = {}, Filters = {:?}, RetainedOnly = {}",
            self.config.name, self.config.topic_filter, self.config.retained_only
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use monster_core::QoS;

    fn group(filters: Vec<&str>, retained_only: bool) -> ArchiveGroup {
        let mut config = ArchiveGroupConfig::named("test");
        config.topic_filter = filters.into_iter().map(|f| f.to_owned()).collect();
        config.retained_only = retained_only;
        ArchiveGroup::start(config, None, None, None).unwrap()
    }

    #[test]
    fn matching_honors_filters_and_the_retained_gate() {
        let all = group(vec![], false);
        let plain = BrokerMessage::new("pub", "a/b", QoS::AtMostOnce, "x");
        let retained = BrokerMessage::new("pub", "a/b", QoS::AtMostOnce, "x").retain();
        assert!(all.matches(&plain));

        let filtered = group(vec!["home/#", "work/+"], false);
        assert!(filtered.matches(&BrokerMessage::new("pub", "home/a/b", QoS::AtMostOnce, "x")));
        assert!(filtered.matches(&BrokerMessage::new("pub", "work/a", QoS::AtMostOnce, "x")));
        assert!(!filtered.matches(&plain));

        let retained_only = group(vec![], true);
        assert!(!retained_only.matches(&plain));
        assert!(retained_only.matches(&retained));
    }
}
