// src/cluster/notifications.rs

//! Per-channel notification fan-out.
//!
//! Hooks are invoked synchronously from the connection task that received the
//! push, so delivery order per channel matches server delivery order.

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

/// Callback invoked with (channel name, payload, sender pid).
pub type NotificationHook = Box<dyn Fn(&str, &Bytes, u64) + Send + Sync>;

#[derive(Default)]
pub struct NotificationHub {
    hooks: DashMap<String, Vec<NotificationHook>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a hook for one channel. Multiple hooks per channel are
    /// invoked in registration order.
    pub fn on(&self, channel: impl Into<String>, hook: NotificationHook) {
        self.hooks.entry(channel.into()).or_default().push(hook);
    }

    /// Drops all hooks for a channel.
    pub fn remove(&self, channel: &str) {
        self.hooks.remove(channel);
    }

    /// Delivers one server push to every hook registered for its channel.
    /// Returns the number of hooks invoked.
    pub fn deliver(&self, channel: &str, payload: &Bytes, pid: u64) -> usize {
        match self.hooks.get(channel) {
            Some(hooks) => {
                for hook in hooks.iter() {
                    hook(channel, payload, pid);
                }
                hooks.len()
            }
            None => {
                debug!("Notification on '{}' had no registered hooks.", channel);
                0
            }
        }
    }
}
