//! Event bus: subscription registry and fan-out.

use crate::types::{TagEvent, Topic};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{
    CloseReason, FilterPredicate, OverflowPolicy, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId, SubscriptionState, SubscriptionStats,
};

/// Registry entry for a subscription.
struct Subscription {
    id: SubscriptionId,
    predicate: FilterPredicate,
    overflow: OverflowPolicy,
    sender: Sender<TagEvent>,
    /// Bus-side receiver used to evict the oldest event and to flush on close.
    drain: Receiver<TagEvent>,
    /// Serializes publishers on a drop-oldest queue so an eviction always
    /// frees the slot its own send takes.
    send_lock: Mutex<()>,
    state: Arc<SubscriptionState>,
}

/// Outcome of offering an event to one subscription.
enum Offer {
    Enqueued,
    Discarded,
    Evict(CloseReason),
}

impl Subscription {
    /// Evaluate the predicate, treating a panic as "no match".
    fn matches(&self, event: &TagEvent) -> bool {
        if !self.state.is_live() {
            return false;
        }

        match catch_unwind(AssertUnwindSafe(|| self.predicate.matches(event.tag_type()))) {
            Ok(matched) => matched,
            Err(_) => {
                self.state.record_filter_failure();
                tracing::warn!(
                    subscription_id = %self.id,
                    filter = self.predicate.description(),
                    tag_type = event.tag_type(),
                    "subscription filter panicked, treating as no match"
                );
                false
            }
        }
    }

    /// Whether the consumer handle is gone (registry holds the only reference).
    fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.state) == 1
    }

    /// Enqueue without blocking, applying the overflow policy on a full queue.
    fn offer(&self, event: TagEvent) -> Offer {
        if self.overflow == OverflowPolicy::DropOldest {
            return self.offer_displacing(event);
        }

        match self.sender.try_send(event) {
            Ok(()) => {
                self.state.record_enqueued();
                return Offer::Enqueued;
            }
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => return Offer::Evict(CloseReason::Disconnected),
        }

        self.state.record_dropped(1);
        if self.overflow == OverflowPolicy::Disconnect {
            Offer::Evict(CloseReason::BufferOverflow)
        } else {
            Offer::Discarded
        }
    }

    /// Drop-oldest enqueue. Always enqueues `event` on a live queue.
    ///
    /// With the send lock held nobody else adds to the queue and the
    /// consumer only removes, so one eviction leaves room for the send.
    fn offer_displacing(&self, event: TagEvent) -> Offer {
        let _guard = self.send_lock.lock();
        let mut event = event;
        loop {
            match self.sender.try_send(event) {
                Ok(()) => {
                    self.state.record_enqueued();
                    return Offer::Enqueued;
                }
                Err(TrySendError::Full(rejected)) => {
                    if self.drain.try_recv().is_ok() {
                        self.state.record_dropped(1);
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Offer::Evict(CloseReason::Disconnected)
                }
            }
        }
    }

    /// Close and flush so no queued event is delivered after this point.
    /// Dropping `self` afterwards releases the sender and wakes a blocked consumer.
    fn retire(self, reason: CloseReason) {
        let stats = self.state.stats();
        if self.state.close(reason.clone()) {
            tracing::debug!(
                subscription_id = %self.id,
                reason = ?reason,
                enqueued = stats.enqueued,
                dropped = stats.dropped,
                "subscription closed"
            );
        }
        while self.drain.try_recv().is_ok() {}
    }
}

/// In-process publish/subscribe hub.
///
/// Safe to share across threads: `publish` takes the registry read lock and
/// only performs non-blocking queue operations inside it, so concurrent
/// publishers never wait on consumers. Publishers racing on one drop-oldest
/// queue take turns on its send lock. Registry changes take the write lock.
pub struct EventBus {
    /// Live subscriptions, keyed by topic then ID.
    topics: RwLock<HashMap<Topic, HashMap<SubscriptionId, Subscription>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Topics closed for good, with the reason new subscribers receive.
    /// Only touched while holding the `topics` write lock.
    sealed: Mutex<HashMap<Topic, CloseReason>>,
    /// Config applied by `subscribe`.
    default_config: SubscriptionConfig,
    shut_down: AtomicBool,
}

impl EventBus {
    /// Create a new bus with default subscription settings.
    pub fn new() -> Self {
        Self::with_config(SubscriptionConfig::default())
    }

    /// Create a new bus with custom default subscription settings.
    pub fn with_config(default_config: SubscriptionConfig) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sealed: Mutex::new(HashMap::new()),
            default_config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to `topic` with the bus's default config.
    pub fn subscribe(&self, topic: &Topic, predicate: FilterPredicate) -> SubscriptionHandle {
        self.subscribe_with(topic, predicate, self.default_config.clone())
    }

    /// Create a new subscription.
    ///
    /// Never blocks on publishers beyond the registry write lock. The
    /// subscription sees every matching event published after this returns
    /// and none published before. On a shut-down bus, or on a topic closed
    /// by [`EventBus::close_topic`], the returned handle is already closed.
    pub fn subscribe_with(
        &self,
        topic: &Topic,
        predicate: FilterPredicate,
        config: SubscriptionConfig,
    ) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));
        let state = Arc::new(SubscriptionState::new());
        let handle = SubscriptionHandle::new(id, topic.clone(), receiver.clone(), state.clone());

        let subscription = Subscription {
            id,
            predicate,
            overflow: config.overflow,
            sender,
            drain: receiver,
            send_lock: Mutex::new(()),
            state,
        };

        {
            let mut topics = self.topics.write();
            // Checked under the lock so shutdown and close_topic cannot miss this entry.
            let refused = if self.shut_down.load(Ordering::SeqCst) {
                Some(CloseReason::Shutdown)
            } else {
                self.sealed.lock().get(topic).cloned()
            };
            if let Some(reason) = refused {
                drop(topics);
                subscription.retire(reason);
                return handle;
            }
            topics
                .entry(topic.clone())
                .or_default()
                .insert(id, subscription);
        }

        tracing::debug!(
            subscription_id = %id,
            topic = %topic,
            buffer_size = config.buffer_size,
            overflow = ?config.overflow,
            "subscription created"
        );

        handle
    }

    /// Unsubscribe and release the queue. Idempotent; returns whether the
    /// subscription was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove(id, CloseReason::Unsubscribed)
    }

    /// Remove one subscription with an explicit reason.
    pub(crate) fn remove(&self, id: SubscriptionId, reason: CloseReason) -> bool {
        let removed = {
            let mut topics = self.topics.write();
            let mut removed = None;
            for subs in topics.values_mut() {
                if let Some(sub) = subs.remove(&id) {
                    removed = Some(sub);
                    break;
                }
            }
            topics.retain(|_, subs| !subs.is_empty());
            removed
        };

        match removed {
            Some(sub) => {
                sub.retire(reason);
                true
            }
            None => false,
        }
    }

    /// Publish an event to every matching subscription on `topic`.
    ///
    /// Returns the number of subscriptions the event was queued for. Never
    /// fails: overflow, predicate panics and abandoned consumers are all
    /// handled per subscription.
    pub fn publish(&self, topic: &Topic, event: TagEvent) -> usize {
        let mut delivered = 0;
        let mut to_remove = Vec::new();

        {
            let topics = self.topics.read();
            let subs = match topics.get(topic) {
                Some(subs) => subs,
                None => return 0,
            };

            for (id, sub) in subs.iter() {
                if sub.is_abandoned() {
                    to_remove.push((*id, CloseReason::Disconnected));
                    continue;
                }
                if !sub.matches(&event) {
                    continue;
                }
                match sub.offer(event.clone()) {
                    Offer::Enqueued => delivered += 1,
                    Offer::Discarded => {
                        tracing::warn!(
                            subscription_id = %id,
                            dropped = sub.state.stats().dropped,
                            "subscriber queue full, event dropped"
                        );
                    }
                    Offer::Evict(reason) => to_remove.push((*id, reason)),
                }
            }
        }

        tracing::trace!(
            topic = %topic,
            tag_type = event.tag_type(),
            delivered,
            "published event"
        );

        for (id, reason) in to_remove {
            if matches!(reason, CloseReason::BufferOverflow) {
                tracing::warn!(subscription_id = %id, "dropping slow subscriber");
            }
            self.remove(id, reason);
        }

        delivered
    }

    /// Close every subscription on a topic and seal it. Returns how many
    /// were closed.
    ///
    /// Later subscriptions to the topic come back already closed with the
    /// same reason. Publishing to it delivers nothing.
    pub fn close_topic(&self, topic: &Topic, reason: CloseReason) -> usize {
        let removed = {
            let mut topics = self.topics.write();
            self.sealed
                .lock()
                .entry(topic.clone())
                .or_insert_with(|| reason.clone());
            topics.remove(topic)
        };

        match removed {
            Some(subs) => {
                let count = subs.len();
                for (_, sub) in subs {
                    sub.retire(reason.clone());
                }
                count
            }
            None => 0,
        }
    }

    /// Close every subscription and refuse new ones.
    pub fn shutdown(&self) {
        let drained = {
            let mut topics = self.topics.write();
            self.shut_down.store(true, Ordering::SeqCst);
            std::mem::take(&mut *topics)
        };

        let mut closed = 0;
        for (_, subs) in drained {
            for (_, sub) in subs {
                sub.retire(CloseReason::Shutdown);
                closed += 1;
            }
        }

        tracing::info!(closed, "event bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Why a topic was sealed by [`EventBus::close_topic`], if it was.
    pub fn topic_close_reason(&self, topic: &Topic) -> Option<CloseReason> {
        self.sealed.lock().get(topic).cloned()
    }

    /// Get subscription count across all topics.
    pub fn subscription_count(&self) -> usize {
        self.topics.read().values().map(HashMap::len).sum()
    }

    /// Get subscription count for one topic.
    pub fn topic_subscription_count(&self, topic: &Topic) -> usize {
        self.topics.read().get(topic).map_or(0, HashMap::len)
    }

    /// Counters for a live subscription.
    pub fn stats(&self, id: SubscriptionId) -> Option<SubscriptionStats> {
        self.topics
            .read()
            .values()
            .find_map(|subs| subs.get(&id))
            .map(|sub| sub.state.stats())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
