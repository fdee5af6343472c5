//! Connectivity signal pushed in by the platform shell.
//!
//! The shell's network callback may fire on any thread, so the sender only
//! ever does a non-blocking `try_send`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityEvent {
    pub is_connected: bool,
}

impl ConnectivityEvent {
    pub fn connected() -> Self {
        Self { is_connected: true }
    }

    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("connectivity buffer is full, event dropped")]
    Full,

    #[error("network observer has stopped")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectivitySender {
    tx: mpsc::Sender<ConnectivityEvent>,
}

impl ConnectivitySender {
    pub fn notify(&self, event: ConnectivityEvent) -> Result<(), ConnectivityError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectivityError::Full,
            mpsc::error::TrySendError::Closed(_) => ConnectivityError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn connectivity_channel(
    capacity: usize,
) -> (ConnectivitySender, mpsc::Receiver<ConnectivityEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ConnectivitySender { tx }, rx)
}

/// Last known Online/Offline state. Starts online until the shell says otherwise;
/// a submission that cannot reach the backend is queued either way.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<AtomicBool>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}
