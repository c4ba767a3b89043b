//! The assembled change feed: one bus, one pump, one write path.

use crate::bus::{CloseReason, EventBus, FilterPredicate, OverflowPolicy, SubscriptionConfig};
use crate::error::{FeedError, Result};
use crate::gateway::{EchoPolicy, MutationGateway, TagWriter};
use crate::memory::MemoryTagStore;
use crate::pump::{FeedPump, PumpState};
use crate::session::SubscriptionSession;
use crate::source::ChangeSource;
use crate::types::{Tag, Topic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Feed configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Topic the pump and the write path publish under.
    pub topic: Topic,

    /// Per-subscription queue capacity.
    /// Default: 256
    pub buffer_size: usize,

    /// Overflow handling for every subscription.
    pub overflow: OverflowPolicy,

    /// Whether writes are echoed onto the bus.
    pub echo: EchoPolicy,

    /// Upper bound on how long a pump stop request goes unnoticed.
    /// Default: 100ms
    pub poll_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            topic: Topic::tags_changed(),
            buffer_size: 256,
            overflow: OverflowPolicy::DropOldest,
            echo: EchoPolicy::Publish,
            poll_interval_ms: 100,
        }
    }
}

impl HubConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: HubConfig = serde_json::from_str(text)
            .map_err(|e| FeedError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.as_str().is_empty() {
            return Err(FeedError::InvalidConfig("topic must not be empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(FeedError::InvalidConfig("buffer_size must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(FeedError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            buffer_size: self.buffer_size,
            overflow: self.overflow,
        }
    }
}

/// Explicitly owned feed instance.
///
/// Owns the event bus, the running feed pump and the mutation gateway.
/// Hand it (or an `Arc` of it) to whatever serves subscription requests.
/// Dropping it stops the pump and closes every session.
pub struct TagFeed {
    config: HubConfig,
    bus: Arc<EventBus>,
    pump: Mutex<Option<FeedPump>>,
    gateway: MutationGateway,
}

impl TagFeed {
    /// Start the pump over `source` and wire the write path to `writer`.
    pub fn start<S>(config: HubConfig, source: S, writer: Arc<dyn TagWriter>) -> Result<Self>
    where
        S: ChangeSource + 'static,
    {
        config.validate()?;

        let bus = Arc::new(EventBus::with_config(config.subscription_config()));
        let pump = FeedPump::start(
            source,
            Arc::clone(&bus),
            config.topic.clone(),
            config.poll_interval(),
        )?;
        let gateway =
            MutationGateway::new(Arc::clone(&bus), config.topic.clone(), writer, config.echo);

        tracing::info!(
            topic = %config.topic,
            buffer_size = config.buffer_size,
            overflow = ?config.overflow,
            echo = ?config.echo,
            "tag feed started"
        );

        Ok(Self {
            config,
            bus,
            pump: Mutex::new(Some(pump)),
            gateway,
        })
    }

    /// Start over a fresh in-memory store, watching its change feed.
    pub fn in_memory(config: HubConfig) -> Result<(Self, Arc<MemoryTagStore>)> {
        let store = Arc::new(MemoryTagStore::new());
        let source = store.watch();
        let writer: Arc<dyn TagWriter> = store.clone();
        let feed = Self::start(config, source, writer)?;
        Ok((feed, store))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    /// Subscription request: a live stream of tags added with `tag_type`.
    pub fn tag_added(&self, tag_type: &str) -> Result<SubscriptionSession> {
        self.subscribe(FilterPredicate::type_equals(tag_type))
    }

    /// Subscribe with an arbitrary predicate.
    ///
    /// Fails once the feed is shut down or its change source has died.
    pub fn subscribe(&self, predicate: FilterPredicate) -> Result<SubscriptionSession> {
        let session = SubscriptionSession::open(Arc::clone(&self.bus), &self.config.topic, predicate);

        // The bus decides atomically with registration, so a failure racing
        // this call still refuses the session.
        match session.close_reason() {
            None => Ok(session),
            Some(CloseReason::SourceFailed(failure)) => Err(FeedError::SourceInvalidated(failure)),
            Some(_) => Err(FeedError::ShutDown),
        }
    }

    /// Mutation: persist a tag and echo it to subscribers.
    pub fn add_tag(&self, tag_type: &str, label: &str) -> Result<Tag> {
        if self.bus.is_shut_down() {
            return Err(FeedError::ShutDown);
        }
        self.gateway.add_tag(tag_type, label)
    }

    pub fn pump_state(&self) -> PumpState {
        self.pump
            .lock()
            .as_ref()
            .map_or(PumpState::Stopped, FeedPump::state)
    }

    /// Change records republished by the pump so far.
    pub fn pumped(&self) -> u64 {
        self.pump.lock().as_ref().map_or(0, FeedPump::pumped)
    }

    /// Fatal change-source error, if the pump died from one.
    pub fn source_failure(&self) -> Option<String> {
        self.pump.lock().as_ref().and_then(FeedPump::failure)
    }

    pub fn subscription_count(&self) -> usize {
        self.bus.topic_subscription_count(&self.config.topic)
    }

    /// Stop the pump, then close every session. Idempotent.
    ///
    /// Returns the change-source error if the pump had died from one.
    pub fn shutdown(&self) -> Result<()> {
        let pump = self.pump.lock().take();
        let outcome = match pump {
            Some(mut pump) => pump.stop(),
            None => Ok(()),
        };

        if !self.bus.is_shut_down() {
            self.bus.shutdown();
            tracing::info!(topic = %self.config.topic, "tag feed shut down");
        }

        outcome
    }
}

impl Drop for TagFeed {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::debug!(error = %e, "tag feed dropped after source failure");
        }
    }
}
