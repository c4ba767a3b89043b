//! Subscription types for the event bus.

use crate::types::{TagEvent, Topic};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What to do when a subscription's queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room for the new one. The
    /// incoming event is always enqueued, even with concurrent publishers.
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
    /// Close the subscription.
    Disconnect,
}

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max queued events before the overflow policy applies.
    /// Default: 256
    pub buffer_size: usize,

    /// Overflow handling.
    /// Default: drop oldest
    pub overflow: OverflowPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Boolean filter over an event's tag type.
#[derive(Clone)]
pub struct FilterPredicate {
    matcher: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    description: String,
}

impl FilterPredicate {
    /// Match events whose tag type equals `tag_type`.
    pub fn type_equals(tag_type: impl Into<String>) -> Self {
        let wanted: String = tag_type.into();
        let description = format!("type == {:?}", wanted);
        Self {
            matcher: Arc::new(move |t| t == wanted),
            description,
        }
    }

    /// Match any of the given tag types.
    pub fn type_in(types: Vec<String>) -> Self {
        let description = format!("type in {:?}", types);
        Self {
            matcher: Arc::new(move |t| types.iter().any(|wanted| wanted == t)),
            description,
        }
    }

    /// Match every event.
    pub fn any() -> Self {
        Self {
            matcher: Arc::new(|_| true),
            description: "any".to_string(),
        }
    }

    /// Wrap an arbitrary function of the tag type.
    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            matcher: Arc::new(f),
            description: description.into(),
        }
    }

    /// Evaluate the predicate. Panics from custom predicates propagate;
    /// the bus isolates them.
    pub fn matches(&self, tag_type: &str) -> bool {
        (self.matcher)(tag_type)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterPredicate({})", self.description)
    }
}

/// Why a subscription was closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicitly unsubscribed (client disconnect or cancellation).
    Unsubscribed,
    /// Queue overflowed under the disconnect policy.
    BufferOverflow,
    /// Consumer handle was dropped without unsubscribing.
    Disconnected,
    /// The upstream change source failed.
    SourceFailed(String),
    /// Delivering to the client transport failed.
    TransportError(String),
    /// The bus was shut down.
    Shutdown,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time counters for one subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Events placed on the queue.
    pub enqueued: u64,
    /// Events discarded by the overflow policy. Never decreases.
    pub dropped: u64,
    /// Predicate evaluations that panicked (counted as no match).
    pub filter_failures: u64,
}

/// State shared between the bus registry and the consumer handle.
pub(super) struct SubscriptionState {
    live: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    filter_failures: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,
}

impl SubscriptionState {
    pub(super) fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            filter_failures: AtomicU64::new(0),
            close_reason: Mutex::new(None),
        }
    }

    pub(super) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark closed. Returns false if already closed; the first reason wins.
    pub(super) fn close(&self, reason: CloseReason) -> bool {
        let mut slot = self.close_reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        self.live.store(false, Ordering::Release);
        true
    }

    pub(super) fn close_reason(&self) -> CloseReason {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or(CloseReason::Unsubscribed)
    }

    pub(super) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(super) fn record_filter_failure(&self) {
        self.filter_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filter_failures: self.filter_failures.load(Ordering::Relaxed),
        }
    }
}

/// Consumer side of a subscription.
///
/// Dropping the handle without unsubscribing is detected on the next
/// publish and the registry entry is reclaimed.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub topic: Topic,
    receiver: Receiver<TagEvent>,
    state: Arc<SubscriptionState>,
}

impl SubscriptionHandle {
    pub(super) fn new(
        id: SubscriptionId,
        topic: Topic,
        receiver: Receiver<TagEvent>,
        state: Arc<SubscriptionState>,
    ) -> Self {
        Self {
            id,
            topic,
            receiver,
            state,
        }
    }

    /// Receive the next event (blocking). Errors once the subscription is closed.
    pub fn recv(&self) -> Result<TagEvent, CloseReason> {
        match self.receiver.recv() {
            Ok(event) if self.state.is_live() => Ok(event),
            _ => Err(self.state.close_reason()),
        }
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Option<TagEvent>, CloseReason> {
        match self.receiver.try_recv() {
            Ok(event) if self.state.is_live() => Ok(Some(event)),
            Err(TryRecvError::Empty) if self.state.is_live() => Ok(None),
            _ => Err(self.state.close_reason()),
        }
    }

    /// Receive with timeout. `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<TagEvent>, CloseReason> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) if self.state.is_live() => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) if self.state.is_live() => Ok(None),
            _ => Err(self.state.close_reason()),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Close reason, if closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        if self.state.is_live() {
            None
        } else {
            Some(self.state.close_reason())
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.state.stats()
    }

    /// Events dropped on overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.state.stats().dropped
    }

    /// Number of events currently queued.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("live", &self.state.is_live())
            .finish()
    }
}
