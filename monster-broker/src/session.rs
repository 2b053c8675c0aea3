use monster_core::{BrokerMessage, QoS};
use serde::{Deserialize, Serialize};

/// Lifecycle of a client session as seen by every node.
///
/// `Created` is entered when a connect is accepted, `Online` once the
/// in-flight backlog has been drained to the client, `Paused` on disconnect
/// or node loss of a persistent session and `Delete` on expiry or explicit
/// removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Unknown,
    Created,
    Online,
    Paused,
    Delete,
}

impl Default for ClientStatus {
    fn default() -> ClientStatus {
        ClientStatus::Unknown
    }
}

/// Durable per client state kept in the session store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: String,
    /// Node currently owning the connection
    pub node_id: String,
    pub clean_session: bool,
    /// Seconds a persistent session survives after disconnect. `None` keeps
    /// it until explicit removal
    pub session_expiry_interval: Option<u32>,
    pub status: ClientStatus,
    pub last_will: Option<BrokerMessage>,
    pub client_address: Option<String>,
    pub connected: bool,
    /// Last status change, milliseconds since the unix epoch
    pub time: u64,
}

impl ClientSession {
    pub fn new<S: Into<String>, N: Into<String>>(
        client_id: S,
        node_id: N,
        clean_session: bool,
    ) -> ClientSession {
        ClientSession {
            client_id: client_id.into(),
            node_id: node_id.into(),
            clean_session,
            session_expiry_interval: None,
            status: ClientStatus::Unknown,
            last_will: None,
            client_address: None,
            connected: false,
            time: monster_core::now_millis(),
        }
    }

    pub fn with_will(mut self, will: BrokerMessage) -> ClientSession {
        self.last_will = Some(will);
        self
    }

    pub fn with_expiry(mut self, seconds: u32) -> ClientSession {
        self.session_expiry_interval = Some(seconds);
        self
    }

    /// A paused persistent session expires once its expiry interval has
    /// elapsed since the last status change
    pub fn expired(&self, now: u64) -> bool {
        if self.status != ClientStatus::Paused {
            return false;
        }

        match self.session_expiry_interval {
            Some(seconds) => now.saturating_sub(self.time) > u64::from(seconds) * 1000,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new<S: Into<String>, F: Into<String>>(client_id: S, filter: F, qos: QoS) -> Subscription {
        Subscription {
            client_id: client_id.into(),
            filter: filter.into(),
            qos,
        }
    }
}
