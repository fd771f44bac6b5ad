//! Coordination bus messages.
//!
//! Small JSON records delivered at-least-once over LISTEN/NOTIFY.
//! Receivers de-duplicate on `msg_id` and drop anything stale by
//! `(phase, version)`; ordering is never assumed.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Phase;
use crate::util::instance_id;

/// Notify channel shared by every replica of a cluster.
pub const CHANNEL: &str = "switchover_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // Operator commands, shell -> leader.
    Enable,
    Execute,
    Abort,
    Reset,
    Pause,
    Resume,
    SyncCheck,
    // Leader announcements.
    Phase,
    Flip,
    // Node replies, node -> leader.
    Ack,
    Frozen,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use MessageKind::*;
        let name = match self {
            Enable => "enable",
            Execute => "execute",
            Abort => "abort",
            Reset => "reset",
            Pause => "pause",
            Resume => "resume",
            SyncCheck => "sync_check",
            Phase => "phase",
            Flip => "flip",
            Ack => "ack",
            Frozen => "frozen",
        };
        write!(f, "{}", name)
    }
}

impl MessageKind {
    /// Operator commands are acted on by the leader only.
    pub fn operator(&self) -> bool {
        use MessageKind::*;
        matches!(
            self,
            Enable | Execute | Abort | Reset | Pause | Resume | SyncCheck
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub msg_id: Uuid,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub phase: Phase,
    pub version: i64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageKind, phase: Phase, version: i64) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            sender: instance_id().to_string(),
            kind,
            phase,
            version,
            payload: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Parse a notify payload. Non-JSON or unknown types are not an
    /// error to the caller, just noise on the channel.
    pub fn parse(payload: &str) -> Option<Envelope> {
        serde_json::from_str(payload).ok()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Bounded de-duplication window keyed on message id.
#[derive(Debug, Default)]
pub struct Dedup {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

const DEDUP_WINDOW: usize = 1024;

impl Dedup {
    /// Record a message id. Returns false for a replay.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }

        self.order.push_back(id);
        while self.order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let env = Envelope::new(MessageKind::Phase, Phase::Syncing, 3);
        let encoded = env.encode().unwrap();
        let decoded = Envelope::parse(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn test_wire_format() {
        let env = Envelope::new(MessageKind::Flip, Phase::Executing, 7);
        let encoded = env.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "flip");
        assert_eq!(value["phase"], "executing");
        assert_eq!(value["version"], 7);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_garbage_ignored() {
        assert!(Envelope::parse("not json").is_none());
        assert!(Envelope::parse("{}").is_none());
        assert!(Envelope::parse(r#"{"type":"unheard_of"}"#).is_none());
    }

    #[test]
    fn test_dedup() {
        let mut dedup = Dedup::default();
        let id = Uuid::new_v4();

        assert!(dedup.insert(id));
        assert!(!dedup.insert(id));
        assert!(dedup.insert(Uuid::new_v4()));
    }

    #[test]
    fn test_dedup_window_bounded() {
        let mut dedup = Dedup::default();
        let first = Uuid::new_v4();
        dedup.insert(first);

        for _ in 0..DEDUP_WINDOW {
            dedup.insert(Uuid::new_v4());
        }

        // Evicted from the window, so it counts as new again.
        assert!(dedup.insert(first));
    }
}
