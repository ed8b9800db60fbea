//! Fan-out of channel events to registered subscribers.
//!
//! Each subscriber gets its own unbounded queue, so a slow subscriber never
//! causes another one to miss events. Dropping a [`ChannelSubscription`]
//! removes its queue from the hub.

use crate::ChannelEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

#[derive(Default)]
struct Registry {
	next_id: u64,
	subscribers: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
	registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of event subscribers shared by a channel implementation.
#[derive(Clone, Default)]
pub struct EventHub {
	registry: Arc<Mutex<Registry>>,
}

impl EventHub {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a subscriber. It receives every event published from now on.
	pub fn subscribe(&self) -> ChannelSubscription {
		let (sender, events) = mpsc::unbounded_channel();
		let mut registry = lock(&self.registry);
		let id = registry.next_id;
		registry.next_id += 1;
		registry.subscribers.insert(id, sender);

		ChannelSubscription {
			id,
			events,
			registry: Arc::downgrade(&self.registry),
		}
	}

	/// Delivers an event to every live subscriber.
	pub fn publish(&self, event: ChannelEvent) {
		let mut registry = lock(&self.registry);
		registry
			.subscribers
			.retain(|_, sender| sender.send(event.clone()).is_ok());
	}

	/// Number of currently registered subscribers.
	pub fn subscriber_count(&self) -> usize {
		lock(&self.registry).subscribers.len()
	}
}

/// Handle to one subscriber's event queue.
///
/// Dropping the handle deregisters the subscriber.
pub struct ChannelSubscription {
	id: u64,
	events: mpsc::UnboundedReceiver<ChannelEvent>,
	registry: Weak<Mutex<Registry>>,
}

impl ChannelSubscription {
	/// Waits for the next event. Returns `None` once the channel is gone.
	pub async fn recv(&mut self) -> Option<ChannelEvent> {
		self.events.recv().await
	}

	/// Returns the next queued event without waiting.
	#[cfg(test)]
	pub fn try_recv(&mut self) -> Option<ChannelEvent> {
		self.events.try_recv().ok()
	}
}

impl Drop for ChannelSubscription {
	fn drop(&mut self) {
		if let Some(registry) = self.registry.upgrade() {
			lock(&registry).subscribers.remove(&self.id);
		}
	}
}
