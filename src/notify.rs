use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-shop broadcast of committed events. Downstream collaborators
/// (notification mailers, planners refreshing a week view) subscribe here.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to committed events of a shop. Creates the channel if needed.
    pub fn subscribe(&self, shop_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(shop_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let shop_id = event.shop_id();
        if let Some(sender) = self.channels.get(&shop_id) {
            let _ = sender.send(event.clone());
        }
        if matches!(event, Event::ShopDeleted { .. }) {
            self.channels.remove(&shop_id);
        }
    }
}
