//! In-process publish/subscribe hub for tag events.
//!
//! The bus keeps a registry of live subscriptions keyed by topic. Each
//! subscription owns:
//! - A filter predicate over the event's tag type
//! - A bounded delivery queue
//! - Counters for enqueued, dropped and filter-failed events
//!
//! Publishing never blocks on a consumer: a full queue is resolved by the
//! subscription's [`OverflowPolicy`], so one slow subscriber cannot stall the
//! publisher or its siblings.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let topic = Topic::tags_changed();
//!
//! let handle = bus.subscribe(&topic, FilterPredicate::type_equals("blue"));
//! bus.publish(&topic, TagEvent::written(tag));
//!
//! while let Ok(event) = handle.recv() {
//!     println!("tag added: {}", event.tag.label);
//! }
//! ```

mod event_bus;
mod types;

pub use event_bus::EventBus;
pub use types::{
    CloseReason, FilterPredicate, OverflowPolicy, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId, SubscriptionStats,
};
