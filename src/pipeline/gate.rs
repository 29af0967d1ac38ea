//! Single-client admission gate shared by both transports

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Transport a stream was admitted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Pcm,
}

/// At most one holder at a time
#[derive(Debug, Default)]
pub struct ClientGate {
    holder: Mutex<Option<Transport>>,
}

impl ClientGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the gate, or `None` if another stream holds it
    pub fn try_acquire(self: &Arc<Self>, transport: Transport) -> Option<GateGuard> {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return None;
        }
        *holder = Some(transport);
        Some(GateGuard { gate: self.clone() })
    }

    pub fn holder(&self) -> Option<Transport> {
        *self.holder.lock()
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }

    fn release(&self) {
        *self.holder.lock() = None;
    }
}

/// Holds the gate; dropping it releases the gate on every exit path
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<ClientGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}
