//! Queue events carried over the coordination store's pub/sub channels.
//!
//! Every queue has one channel, [`queue_channel`]. The engine publishes a
//! [`QueueEvent`] on it for each transition that someone outside the store may
//! wait for: a job becoming ready (`new`, waking bees), a terminal outcome
//! (`completed`, `failed`, `canceled`), a job turning into a duplicate, and
//! worker progress. Delivery is at-least-once, so consumers treat every event
//! idempotently.

use crate::job::{Jid, JobRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pub/sub channel of a queue.
pub fn queue_channel(queue: &str) -> String {
    format!("bee:ch:q:{}", queue)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job entered the ready set.
    New { queue: String, jid: Jid },
    Progress {
        queue: String,
        jid: Jid,
        progress: Value,
    },
    Completed {
        queue: String,
        jid: Jid,
        job: Box<JobRecord>,
    },
    Failed {
        queue: String,
        jid: Jid,
        job: Box<JobRecord>,
    },
    Canceled { queue: String, jid: Jid },
    /// `jid` was found to duplicate `original` and will mirror its outcome.
    Duplicate {
        queue: String,
        jid: Jid,
        original: Jid,
        job: Box<JobRecord>,
    },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::New { queue, .. }
            | QueueEvent::Progress { queue, .. }
            | QueueEvent::Completed { queue, .. }
            | QueueEvent::Failed { queue, .. }
            | QueueEvent::Canceled { queue, .. }
            | QueueEvent::Duplicate { queue, .. } => queue,
        }
    }

    pub fn jid(&self) -> Jid {
        match self {
            QueueEvent::New { jid, .. }
            | QueueEvent::Progress { jid, .. }
            | QueueEvent::Completed { jid, .. }
            | QueueEvent::Failed { jid, .. }
            | QueueEvent::Canceled { jid, .. }
            | QueueEvent::Duplicate { jid, .. } => *jid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::New { .. } => "new",
            QueueEvent::Progress { .. } => "progress",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::Canceled { .. } => "canceled",
            QueueEvent::Duplicate { .. } => "duplicate",
        }
    }

    /// Terminal events settle job handles.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEvent::Completed { .. } | QueueEvent::Failed { .. } | QueueEvent::Canceled { .. }
        )
    }

    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(message: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_name() {
        assert_eq!(queue_channel("images.resize"), "bee:ch:q:images.resize");
    }

    #[test]
    fn test_event_wire_format() {
        let jid = Jid::new();
        let event = QueueEvent::Progress {
            queue: "sum".into(),
            jid,
            progress: json!({"done": 3, "of": 10}),
        };

        let message = event.encode().unwrap();
        let value: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["jid"], jid.to_string());
        assert_eq!(value["progress"]["done"], 3);

        let back = QueueEvent::decode(&message).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "progress");
        assert!(!back.is_terminal());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(QueueEvent::decode("{\"type\":\"exploded\"}").is_err());
        assert!(QueueEvent::decode("not json").is_err());
    }
}
