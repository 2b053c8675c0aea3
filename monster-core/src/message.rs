use bytes::Bytes;
use core::fmt;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Effective qos for a delivery. A subscriber never receives a message at
    /// a higher qos than it subscribed with
    pub fn downgrade(self, subscription: QoS) -> QoS {
        if (subscription as u8) < (self as u8) {
            subscription
        } else {
            self
        }
    }
}

/// Current wall clock in milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The unit of traffic inside the broker. Everything that flows between
/// sessions, archive writers and cluster peers is one of these
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub uuid: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub queued: bool,
    /// Publishing client
    pub client_id: String,
    /// Loop prevention tag for internal re-publishes. A subscriber with this
    /// client id never receives the message back
    pub sender_id: Option<String>,
    pub time: u64,
    /// Wire level packet id
    pub pkid: u16,
}

impl BrokerMessage {
    pub fn new<S: Into<String>, T: Into<String>, P: Into<Vec<u8>>>(
        client_id: S,
        topic: T,
        qos: QoS,
        payload: P,
    ) -> BrokerMessage {
        BrokerMessage {
            uuid: nanoid!(),
            topic: topic.into(),
            payload: Bytes::from(payload.into()),
            qos,
            retain: false,
            dup: false,
            queued: false,
            client_id: client_id.into(),
            sender_id: None,
            time: now_millis(),
            pkid: 0,
        }
    }

    pub fn retain(mut self) -> BrokerMessage {
        self.retain = true;
        self
    }

    pub fn sender<S: Into<String>>(mut self, sender_id: S) -> BrokerMessage {
        self.sender_id = Some(sender_id.into());
        self
    }

    /// A message is stored as the retained value of its topic only when the
    /// payload is non empty
    pub fn is_retained_set(&self) -> bool {
        self.retain && !self.payload.is_empty()
    }

    /// A retain with an empty payload deletes the retained value of the topic
    pub fn is_retained_delete(&self) -> bool {
        self.retain && self.payload.is_empty()
    }

    /// Clone carrying a rewritten qos. The stored payload is untouched
    pub fn with_qos(&self, qos: QoS) -> BrokerMessage {
        let mut message = self.clone();
        message.qos = qos;
        message
    }
}

impl fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Topic = {}, Qos = {:?}, Retain = {}, Uuid = {}, Payload Size = {}",
            self.topic,
            self.qos,
            self.retain,
            self.uuid,
            self.payload.len()
        )
    }
}
