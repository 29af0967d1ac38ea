//! Status events published to whatever UI layer sits above the receiver

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Non-blocking publisher; events are dropped once every subscriber is gone
#[derive(Clone)]
pub struct StatusPublisher {
    tx: Sender<StatusEvent>,
}

impl StatusPublisher {
    pub fn channel() -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn publish(&self, kind: StatusKind, message: Option<String>) {
        match (&kind, &message) {
            (StatusKind::Disconnected, Some(reason)) => tracing::warn!("Receiver {:?}: {}", kind, reason),
            (_, Some(detail)) => tracing::info!("Receiver {:?}: {}", kind, detail),
            (_, None) => tracing::info!("Receiver {:?}", kind),
        }
        let _ = self.tx.send(StatusEvent {
            kind,
            message,
            at: Utc::now(),
        });
    }
}
