//! Fan-out of decoded chain events to websocket subscribers.

use anyhow::Result;
use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
	constants::OUTBOUND_QUEUE_CAPACITY,
	eth::rpc::EthRpcApi,
	events::{filters::FilterSpec, manager::FilterManager, messages::EventMessage, metadata::MetadataResolver},
};

/// A registered subscriber's end of the hub: drain `receiver` and write
/// the frames to the socket. The channel closing without an unregister
/// means the hub dropped this subscriber for falling behind.
pub struct SubscriberHandle {
	pub id: Uuid,
	pub receiver: mpsc::Receiver<Arc<String>>,
}

struct Shared {
	// Plain mutex: everything done under it is enqueueing, never I/O.
	subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Arc<String>>>>,
	// The manager's start/stop transitions serialise on this lock,
	// separate from the subscriber set so that broadcasts keep flowing
	// while a stop drains the workers.
	manager: tokio::sync::Mutex<FilterManager>,
}

/// One per chain. Tracks live websocket subscribers and lazily runs the
/// chain's filter manager while at least one subscriber is connected.
#[derive(Clone)]
pub struct EventHub {
	shared: Arc<Shared>,
}

impl EventHub {
	pub fn new(
		rpc: Arc<dyn EthRpcApi>,
		resolver: MetadataResolver,
		specs: Vec<FilterSpec>,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				subscribers: Mutex::new(HashMap::new()),
				manager: tokio::sync::Mutex::new(FilterManager::new(rpc, resolver, specs)),
			}),
		}
	}

	/// Add a subscriber. The first subscriber brings the filter manager
	/// up and starts the broadcast pump.
	pub async fn register(&self) -> Result<SubscriberHandle> {
		let id = Uuid::new_v4();
		let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

		let first = {
			let mut subscribers =
				self.shared.subscribers.lock().expect("subscriber lock poisoned");
			subscribers.insert(id, sender);
			subscribers.len() == 1
		};
		tracing::debug!("registered websocket subscriber {id}");

		if first {
			let mut manager = self.shared.manager.lock().await;
			let still_subscribed = !self
				.shared
				.subscribers
				.lock()
				.expect("subscriber lock poisoned")
				.is_empty();
			if still_subscribed && !manager.is_running() {
				let (sink, output) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
				if let Err(e) = manager.start(sink).await {
					self.remove_subscriber(id);
					return Err(e)
				}
				tokio::spawn(Self::pump(output, self.clone()));
			}
		}

		Ok(SubscriberHandle { id, receiver })
	}

	/// Remove a subscriber. The last one out stops the filter manager so
	/// an idle chain keeps no filters installed on the node.
	pub async fn unregister(&self, id: Uuid) {
		tracing::debug!("unregistering websocket subscriber {id}");
		let drained = {
			let mut subscribers =
				self.shared.subscribers.lock().expect("subscriber lock poisoned");
			subscribers.remove(&id);
			subscribers.is_empty()
		};

		if drained {
			let mut manager = self.shared.manager.lock().await;
			// A new subscriber may have raced in while we waited.
			let still_empty = self
				.shared
				.subscribers
				.lock()
				.expect("subscriber lock poisoned")
				.is_empty();
			if still_empty {
				manager.stop().await;
			}
		}
	}

	/// Enqueue a frame to every subscriber. A subscriber whose queue is
	/// full is dropped; the rest are unaffected.
	pub fn broadcast(&self, message: &EventMessage) {
		let frame = match serde_json::to_string(message) {
			Ok(frame) => Arc::new(frame),
			Err(e) => {
				tracing::error!("unserialisable event message: {e}");
				return
			},
		};

		let dropped: Vec<Uuid> = {
			let mut subscribers =
				self.shared.subscribers.lock().expect("subscriber lock poisoned");
			let dropped: Vec<Uuid> = subscribers
				.iter()
				.filter(|(_, sender)| sender.try_send(frame.clone()).is_err())
				.map(|(id, _)| *id)
				.collect();
			for id in &dropped {
				subscribers.remove(id);
			}
			dropped
		};

		for id in dropped {
			tracing::warn!("dropping subscriber {id}: outbound queue full");
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.shared.subscribers.lock().expect("subscriber lock poisoned").len()
	}

	pub async fn is_streaming(&self) -> bool {
		self.shared.manager.lock().await.is_running()
	}

	async fn pump(mut output: mpsc::Receiver<EventMessage>, hub: EventHub) {
		while let Some(message) = output.recv().await {
			hub.broadcast(&message);
		}
	}

	fn remove_subscriber(&self, id: Uuid) {
		self.shared.subscribers.lock().expect("subscriber lock poisoned").remove(&id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{artifacts::ArtifactClient, eth::rpc::MockEthRpcApi};
	use ethers::types::U256;
	use serde_json::json;

	fn resolver() -> MetadataResolver {
		MetadataResolver::new(ArtifactClient::new("http://127.0.0.1:1"))
	}

	fn hub_with_latest_filter() -> EventHub {
		let mut rpc = MockEthRpcApi::new();
		rpc.expect_new_block_filter().returning(|| Ok(U256::from(1)));
		rpc.expect_block_filter_changes().returning(|_| Ok(vec![]));
		rpc.expect_uninstall_filter().returning(|_| Ok(true));
		EventHub::new(Arc::new(rpc), resolver(), vec![FilterSpec::latest()])
	}

	/// A hub whose manager has nothing to install, for broadcast tests.
	fn bare_hub() -> EventHub {
		EventHub::new(Arc::new(MockEthRpcApi::new()), resolver(), vec![])
	}

	#[tokio::test(start_paused = true)]
	async fn first_subscriber_starts_last_stops() {
		let hub = hub_with_latest_filter();
		assert!(!hub.is_streaming().await);

		let a = hub.register().await.unwrap();
		let b = hub.register().await.unwrap();
		assert!(hub.is_streaming().await);
		assert_eq!(hub.subscriber_count(), 2);

		hub.unregister(a.id).await;
		assert!(hub.is_streaming().await);

		hub.unregister(b.id).await;
		assert!(!hub.is_streaming().await);
		assert_eq!(hub.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn broadcast_reaches_every_subscriber() {
		let hub = bare_hub();
		let mut a = hub.register().await.unwrap();
		let mut b = hub.register().await.unwrap();

		hub.broadcast(&EventMessage::block(117));

		let frame_a = a.receiver.try_recv().unwrap();
		let frame_b = b.receiver.try_recv().unwrap();
		assert_eq!(frame_a, frame_b);
		assert_eq!(
			serde_json::from_str::<serde_json::Value>(&frame_a).unwrap(),
			json!({ "event": "block", "data": { "number": 117 } })
		);
	}

	#[tokio::test]
	async fn slow_subscriber_is_dropped_without_affecting_others() {
		let hub = bare_hub();
		let mut slow = hub.register().await.unwrap();
		let mut fast = hub.register().await.unwrap();

		// Fill both queues to the brim, draining only the fast one.
		for n in 0..OUTBOUND_QUEUE_CAPACITY {
			hub.broadcast(&EventMessage::block(n as u64));
		}
		while fast.receiver.try_recv().is_ok() {}

		// The next frame overflows the slow subscriber's queue.
		hub.broadcast(&EventMessage::block(9999));

		assert_eq!(hub.subscriber_count(), 1);
		let frame = fast.receiver.try_recv().unwrap();
		assert!(frame.contains("9999"));

		// The slow subscriber's channel drains what it had, then closes
		// without an unregister: the slow-consumer signal.
		for _ in 0..OUTBOUND_QUEUE_CAPACITY {
			assert!(slow.receiver.try_recv().is_ok());
		}
		assert!(slow.receiver.try_recv().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn reregistration_restarts_the_manager() {
		let hub = hub_with_latest_filter();

		let a = hub.register().await.unwrap();
		hub.unregister(a.id).await;
		assert!(!hub.is_streaming().await);

		let b = hub.register().await.unwrap();
		assert!(hub.is_streaming().await);
		hub.unregister(b.id).await;
	}
}
