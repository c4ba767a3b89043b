//! # Tag Feed
//!
//! Real-time fan-out of newly added tags to many concurrent subscribers,
//! each filtered by tag type.
//!
//! ## Core Concepts
//!
//! - **Change source**: The store's ordered, non-restartable insert feed
//! - **Event bus**: Topic-keyed registry of subscriptions with bounded queues
//! - **Feed pump**: One thread draining the change source onto the bus
//! - **Sessions**: Per-client pull streams with cancellation
//! - **Gateway**: The write path, echoing each persisted tag onto the bus
//!
//! ## Example
//!
//! ```ignore
//! use tagfeed::{HubConfig, TagFeed};
//!
//! let (feed, _store) = TagFeed::in_memory(HubConfig::default())?;
//!
//! let mut blue = feed.tag_added("blue")?;
//! feed.add_tag("blue", "A")?;
//! feed.add_tag("red", "B")?;
//!
//! let event = blue.next_event()?;
//! assert_eq!(event.tag.label, "A");
//!
//! feed.shutdown()?;
//! ```

pub mod bus;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod memory;
pub mod pump;
pub mod session;
pub mod source;
pub mod types;

// Re-exports
pub use bus::{
    CloseReason, EventBus, FilterPredicate, OverflowPolicy, SubscriptionConfig,
    SubscriptionHandle, SubscriptionId, SubscriptionStats,
};
pub use error::{FeedError, Result};
pub use gateway::{EchoPolicy, MutationGateway, TagWriter};
pub use hub::{HubConfig, TagFeed};
pub use memory::MemoryTagStore;
pub use pump::{FeedPump, PumpState};
pub use session::{
    ChannelSink, EventSink, FramedSink, SessionCanceller, SessionState, SubscriptionSession,
    WireFormat,
};
pub use source::{ChangeSource, ChannelChangeSource, IterChangeSource};
pub use types::*;
