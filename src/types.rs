//! Core types for the tag change feed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the topic all tag-change events are published under.
pub const TAGS_CHANGED: &str = "TAGS_CHANGED";

/// Unique identifier for a tag.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(pub u64);

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagId({})", self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tag document as stored in the collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,

    /// Filter key subscribers select on.
    #[serde(rename = "type")]
    pub tag_type: String,

    pub label: String,
}

impl Tag {
    pub fn new(id: TagId, tag_type: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id,
            tag_type: tag_type.into(),
            label: label.into(),
        }
    }
}

/// Store-defined position of a change notification.
///
/// Opaque to the feed: it is recorded for diagnostics but never parsed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({})", self.0)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One notification from the store's change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub token: ResumeToken,

    /// Full snapshot of the inserted document.
    pub document: Tag,
}

/// Logical channel events are published under.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(pub String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    /// The topic carrying newly added tags.
    pub fn tags_changed() -> Self {
        Topic(TAGS_CHANGED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Topic {
    fn default() -> Self {
        Topic::tags_changed()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which write path produced an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventOrigin {
    /// Echoed by the mutation path right after the write succeeded.
    Mutation,
    /// Read back from the store's change feed.
    ChangeFeed { token: ResumeToken },
}

/// Event carried by the bus and delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEvent {
    #[serde(rename = "tagAdded")]
    pub tag: Tag,
    pub origin: EventOrigin,
}

impl TagEvent {
    /// Event for a record the mutation path has just persisted.
    pub fn written(tag: Tag) -> Self {
        Self {
            tag,
            origin: EventOrigin::Mutation,
        }
    }

    /// Event for a record read from the change feed.
    pub fn from_change(record: ChangeRecord) -> Self {
        Self {
            tag: record.document,
            origin: EventOrigin::ChangeFeed {
                token: record.token,
            },
        }
    }

    /// Filter key for this event.
    pub fn tag_type(&self) -> &str {
        &self.tag.tag_type
    }
}

/// One page of tags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsPage {
    pub tags: Vec<Tag>,
    pub has_more: bool,
}
