//! Ephemeral per-project signals (access granted, pending request count).
//!
//! An in-process pub/sub keyed by project id. Lobby connections subscribe
//! here; nothing published is stored except the latest pending count.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// Access to the project was granted to `user_id`.
    AccessGranted { user_id: Uuid },
    /// Number of access requests waiting for the project owner.
    PendingRequests { count: u32 },
}

impl Signal {
    /// Whether `user_id` should receive this signal.
    pub fn is_for(&self, user_id: Uuid) -> bool {
        match self {
            Signal::AccessGranted { user_id: target } => *target == user_id,
            Signal::PendingRequests { .. } => true,
        }
    }
}

pub struct SignalHub {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<Signal>>>,
    pending: Mutex<HashMap<Uuid, u32>>,
    capacity: usize,
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, project_id: Uuid) -> broadcast::Receiver<Signal> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop `receiver` and the project's channel if it was the last one.
    pub fn unsubscribe(&self, project_id: Uuid, receiver: broadcast::Receiver<Signal>) {
        drop(receiver);
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(&project_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&project_id);
        }
    }

    /// Publish to the project's subscribers. Returns how many received it.
    pub fn publish(&self, project_id: Uuid, signal: Signal) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = match channels.get(&project_id) {
            Some(sender) => sender.send(signal).unwrap_or(0),
            None => 0,
        };
        // Nobody listening any more: drop the channel.
        if delivered == 0 {
            channels.remove(&project_id);
        }
        delivered
    }

    /// Store the latest pending count and publish it. Zero is the default
    /// and is not kept.
    pub fn set_pending(&self, project_id: Uuid, count: u32) -> usize {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if count == 0 {
                pending.remove(&project_id);
            } else {
                pending.insert(project_id, count);
            }
        }
        self.publish(project_id, Signal::PendingRequests { count })
    }

    pub fn pending(&self, project_id: Uuid) -> u32 {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&project_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn pending_count_entries(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(64)
    }
}
