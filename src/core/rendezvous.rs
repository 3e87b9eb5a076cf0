//! Hand-off between a blocked synchronous request and the completion callback.
//!
//! Every synchronous invocation registers a slot under its function uid and a fresh
//! correlation id. The id travels to the backend in [`CORRELATION_HEADER`]; when the
//! backend echoes it on the callback the payload reaches exactly that request.
//! Callbacks without the header fall back to the oldest pending slot of the function.
//!
//! Slots are released when the waiting side drops them, so a client that goes away
//! frees its slot immediately.
//!
//! Independently of the slots, every correlation id handed to a backend (sync or
//! async) is remembered with its function uid for a bounded time. Callbacks on
//! weighted triggers are attributed through that ledger, so a result arriving
//! after its waiter left, or for an asynchronous run, still finds its function.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{core::ttl_map::TtlMap, metrics};

pub const CORRELATION_HEADER: &str = "x-fnagent-correlation-id";

/// How long an issued correlation id stays attributable by default.
pub const DEFAULT_CORRELATION_TTL: Duration = Duration::from_secs(3600);

struct PendingSlot {
    correlation_id: Uuid,
    sender: oneshot::Sender<Bytes>,
}

type SlotQueues = HashMap<String, VecDeque<PendingSlot>>;

/// Outcome of [`RendezvousRegistry::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody was waiting (timed out, disconnected, or never registered)
    NoListener,
}

/// Registry of pending synchronous invocations and issued correlation ids.
#[derive(Clone)]
pub struct RendezvousRegistry {
    slots: Arc<Mutex<SlotQueues>>,
    issued: Arc<TtlMap<Uuid, String>>,
}

impl Default for RendezvousRegistry {
    fn default() -> Self {
        Self::with_correlation_ttl(DEFAULT_CORRELATION_TTL)
    }
}

impl RendezvousRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_ttl(ttl: Duration) -> Self {
        Self {
            slots: Arc::default(),
            issued: Arc::new(TtlMap::new(ttl)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotQueues> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a slot for one synchronous invocation of `function_uid`.
    pub fn register(&self, function_uid: &str) -> RendezvousSlot {
        let correlation_id = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        self.lock()
            .entry(function_uid.to_string())
            .or_default()
            .push_back(PendingSlot {
                correlation_id,
                sender,
            });

        RendezvousSlot {
            correlation_id,
            function_uid: function_uid.to_string(),
            receiver,
            registry: self.clone(),
        }
    }

    /// Hands `payload` to a waiting invocation without blocking.
    pub fn publish(&self, function_uid: &str, correlation_id: Option<Uuid>, payload: Bytes) -> Delivery {
        let mut payload = payload;
        loop {
            let Some(slot) = self.take(function_uid, correlation_id) else {
                metrics::record_rendezvous_delivery("no_listener");
                return Delivery::NoListener;
            };
            match slot.sender.send(payload) {
                Ok(()) => {
                    metrics::record_rendezvous_delivery("delivered");
                    return Delivery::Delivered;
                }
                // The waiter vanished between lookup and send; try the next one
                // unless the callback named a specific request.
                Err(returned) if correlation_id.is_none() => payload = returned,
                Err(_) => {
                    metrics::record_rendezvous_delivery("no_listener");
                    return Delivery::NoListener;
                }
            }
        }
    }

    fn take(&self, function_uid: &str, correlation_id: Option<Uuid>) -> Option<PendingSlot> {
        let mut slots = self.lock();
        let queue = slots.get_mut(function_uid)?;
        let slot = match correlation_id {
            Some(id) => {
                let position = queue.iter().position(|s| s.correlation_id == id)?;
                queue.remove(position)
            }
            None => queue.pop_front(),
        };
        if queue.is_empty() {
            slots.remove(function_uid);
        }
        slot
    }

    /// Records that `correlation_id` was sent to a backend of `function_uid`.
    pub async fn remember(&self, correlation_id: Uuid, function_uid: &str) {
        self.issued
            .insert(correlation_id, function_uid.to_string())
            .await;
    }

    /// Function uid an issued correlation id belongs to. The id is forgotten,
    /// so each id attributes one callback.
    pub async fn claim(&self, correlation_id: Uuid) -> Option<String> {
        self.issued.take(&correlation_id).await
    }

    pub fn issued(&self) -> usize {
        self.issued.len()
    }

    /// Drops correlation ids whose callback never came.
    pub async fn purge_expired(&self) -> usize {
        self.issued.purge_expired().await
    }

    pub fn pending(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    fn release(&self, function_uid: &str, correlation_id: Uuid) {
        let mut slots = self.lock();
        if let Some(queue) = slots.get_mut(function_uid) {
            queue.retain(|s| s.correlation_id != correlation_id);
            if queue.is_empty() {
                slots.remove(function_uid);
            }
        }
    }
}

/// The waiting side of one synchronous invocation.
pub struct RendezvousSlot {
    correlation_id: Uuid,
    function_uid: String,
    receiver: oneshot::Receiver<Bytes>,
    registry: RendezvousRegistry,
}

impl RendezvousSlot {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Resolves with the delivered payload, or `None` if the registry dropped the slot.
    pub async fn wait(&mut self) -> Option<Bytes> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for RendezvousSlot {
    fn drop(&mut self) {
        self.registry
            .release(&self.function_uid, self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn correlation_id_targets_its_own_request() {
        let registry = RendezvousRegistry::new();
        let mut first = registry.register("uid-a");
        let mut second = registry.register("uid-a");
        assert_eq!(registry.pending(), 2);

        assert_eq!(
            registry.publish("uid-a", Some(second.correlation_id()), Bytes::from("two")),
            Delivery::Delivered
        );
        assert_eq!(second.wait().await, Some(Bytes::from("two")));

        assert_eq!(
            registry.publish("uid-a", Some(first.correlation_id()), Bytes::from("one")),
            Delivery::Delivered
        );
        assert_eq!(first.wait().await, Some(Bytes::from("one")));
    }

    #[tokio::test]
    async fn uncorrelated_callback_reaches_oldest_waiter() {
        let registry = RendezvousRegistry::new();
        let mut oldest = registry.register("uid-a");
        let _newer = registry.register("uid-a");

        registry.publish("uid-a", None, Bytes::from("payload"));
        assert_eq!(oldest.wait().await, Some(Bytes::from("payload")));
        assert_eq!(registry.pending(), 1);
    }

    #[test]
    fn publish_without_listener_does_not_block() {
        let registry = RendezvousRegistry::new();
        assert_eq!(
            registry.publish("uid-a", None, Bytes::from("lost")),
            Delivery::NoListener
        );
        assert_eq!(
            registry.publish("uid-a", Some(Uuid::new_v4()), Bytes::from("lost")),
            Delivery::NoListener
        );
    }

    #[tokio::test]
    async fn dropped_slot_is_released() {
        let registry = RendezvousRegistry::new();
        let slot = registry.register("uid-a");
        let id = slot.correlation_id();

        drop(slot);
        assert_eq!(registry.pending(), 0);
        assert_eq!(
            registry.publish("uid-a", Some(id), Bytes::from("late")),
            Delivery::NoListener
        );
    }

    #[tokio::test(start_paused = true)]
    async fn issued_ids_outlive_their_slot() {
        let registry = RendezvousRegistry::with_correlation_ttl(Duration::from_secs(60));
        let slot = registry.register("uid-a");
        let id = slot.correlation_id();
        registry.remember(id, "uid-a").await;
        drop(slot);

        assert_eq!(registry.claim(id).await.as_deref(), Some("uid-a"));
        assert_eq!(registry.claim(id).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_ids_expire() {
        let registry = RendezvousRegistry::with_correlation_ttl(Duration::from_secs(60));
        let late = Uuid::new_v4();
        let stale = Uuid::new_v4();
        registry.remember(late, "uid-a").await;
        registry.remember(stale, "uid-b").await;
        assert_eq!(registry.issued(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.claim(late).await, None);
        assert_eq!(registry.purge_expired().await, 1);
        assert_eq!(registry.issued(), 0);
    }

    #[tokio::test]
    async fn abandoned_wait_frees_slot() {
        let registry = RendezvousRegistry::new();
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut slot = registry.register("uid-a");
                slot.wait().await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.pending(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(registry.pending(), 0);
    }
}
