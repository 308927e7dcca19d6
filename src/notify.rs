use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, Platform};

const CHANNEL_CAPACITY: usize = 256;

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Slot and booking changes on one platform.
    Platform(Platform),
    /// User and membership changes.
    Ledger,
    /// Every committed event.
    All,
}

impl Channel {
    pub fn of(event: &Event) -> Channel {
        event.platform().map_or(Channel::Ledger, Channel::Platform)
    }
}

/// Broadcast hub for committed events.
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates it if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Deliver to the event's own channel and to `All`. No-op for channels
    /// nobody has subscribed to.
    pub fn send(&self, event: &Event) {
        for channel in [Channel::of(event), Channel::All] {
            if let Some(sender) = self.channels.get(&channel) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop a channel; its receivers see it closed.
    pub fn remove(&self, channel: Channel) {
        self.channels.remove(&channel);
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.channels
            .get(&channel)
            .map_or(0, |s| s.receiver_count())
    }
}
