//! Write path: persists tags and echoes them onto the bus.

use crate::bus::EventBus;
use crate::error::Result;
use crate::types::{Tag, TagEvent, Topic};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persistence boundary for new tags.
pub trait TagWriter: Send + Sync {
    /// Durably insert a tag and return the stored document.
    fn insert_tag(&self, tag_type: &str, label: &str) -> Result<Tag>;
}

/// Whether successful writes are echoed onto the bus.
///
/// With `Publish` a subscriber can see the same tag twice, once from the
/// echo and once from the change feed, in either order. `Suppress` leaves
/// the change feed as the only source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicy {
    #[default]
    Publish,
    Suppress,
}

/// Mutation entry point consumed by the request layer.
pub struct MutationGateway {
    bus: Arc<EventBus>,
    topic: Topic,
    writer: Arc<dyn TagWriter>,
    echo: EchoPolicy,
}

impl MutationGateway {
    pub fn new(
        bus: Arc<EventBus>,
        topic: Topic,
        writer: Arc<dyn TagWriter>,
        echo: EchoPolicy,
    ) -> Self {
        Self {
            bus,
            topic,
            writer,
            echo,
        }
    }

    pub fn echo_policy(&self) -> EchoPolicy {
        self.echo
    }

    /// Persist a new tag, then echo it before returning.
    pub fn add_tag(&self, tag_type: &str, label: &str) -> Result<Tag> {
        tracing::debug!(tag_type, label, "adding tag");
        let tag = self.writer.insert_tag(tag_type, label)?;
        self.on_record_written(&tag);
        Ok(tag)
    }

    /// Called after a write is persisted. Publishes synchronously, so the
    /// event is queued for every matching subscriber by the time the writer
    /// sees success. Returns how many subscriptions received it.
    pub fn on_record_written(&self, tag: &Tag) -> usize {
        match self.echo {
            EchoPolicy::Publish => self.bus.publish(&self.topic, TagEvent::written(tag.clone())),
            EchoPolicy::Suppress => {
                tracing::trace!(tag_id = %tag.id, "write echo suppressed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FilterPredicate;
    use crate::error::FeedError;
    use crate::types::{EventOrigin, TagId};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingWriter {
        next_id: AtomicU64,
    }

    impl TagWriter for CountingWriter {
        fn insert_tag(&self, tag_type: &str, label: &str) -> Result<Tag> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Tag::new(TagId(id), tag_type, label))
        }
    }

    struct FailingWriter;

    impl TagWriter for FailingWriter {
        fn insert_tag(&self, _tag_type: &str, _label: &str) -> Result<Tag> {
            Err(FeedError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    fn counting() -> Arc<dyn TagWriter> {
        Arc::new(CountingWriter {
            next_id: AtomicU64::new(1),
        })
    }

    #[test]
    fn test_add_tag_echoes_before_returning() {
        let bus = Arc::new(EventBus::new());
        let topic = Topic::tags_changed();
        let handle = bus.subscribe(&topic, FilterPredicate::type_equals("x"));
        let gateway = MutationGateway::new(Arc::clone(&bus), topic, counting(), EchoPolicy::Publish);

        let tag = gateway.add_tag("x", "Z").unwrap();

        // Already queued when add_tag returned
        let event = handle.try_recv().unwrap().unwrap();
        assert_eq!(event.tag, tag);
        assert_eq!(event.origin, EventOrigin::Mutation);
    }

    #[test]
    fn test_suppressed_echo_publishes_nothing() {
        let bus = Arc::new(EventBus::new());
        let topic = Topic::tags_changed();
        let handle = bus.subscribe(&topic, FilterPredicate::any());
        let gateway =
            MutationGateway::new(Arc::clone(&bus), topic, counting(), EchoPolicy::Suppress);

        gateway.add_tag("x", "Z").unwrap();
        assert_eq!(handle.try_recv().unwrap(), None);
    }

    #[test]
    fn test_failed_write_publishes_nothing() {
        let bus = Arc::new(EventBus::new());
        let topic = Topic::tags_changed();
        let handle = bus.subscribe(&topic, FilterPredicate::any());
        let gateway = MutationGateway::new(
            Arc::clone(&bus),
            topic,
            Arc::new(FailingWriter),
            EchoPolicy::Publish,
        );

        assert!(gateway.add_tag("x", "Z").is_err());
        assert_eq!(handle.try_recv().unwrap(), None);
    }
}
