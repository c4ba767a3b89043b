//! In-memory tag collection with a native change feed.
//!
//! Stands in for the persistent store: it accepts writes, serves the read
//! side (by type, paged, random, last) and notifies every open watch feed
//! of each insert, in insert order.

use crate::error::{FeedError, Result};
use crate::gateway::TagWriter;
use crate::source::ChannelChangeSource;
use crate::types::{ChangeRecord, ResumeToken, Tag, TagId, TagsPage};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::RwLock;
use rand::seq::SliceRandom;

struct Collection {
    tags: Vec<Tag>,
    watchers: Vec<Sender<Result<ChangeRecord>>>,
    next_id: u64,
    next_seq: u64,
}

/// In-memory tag store.
pub struct MemoryTagStore {
    inner: RwLock<Collection>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Collection {
                tags: Vec::new(),
                watchers: Vec::new(),
                next_id: 1,
                next_seq: 1,
            }),
        }
    }

    /// Insert a tag and notify watchers.
    pub fn add_tag(&self, tag_type: &str, label: &str) -> Tag {
        let mut inner = self.inner.write();

        let tag = Tag::new(TagId(inner.next_id), tag_type, label);
        inner.next_id += 1;
        inner.tags.push(tag.clone());

        let record = ChangeRecord {
            token: ResumeToken(inner.next_seq.to_string()),
            document: tag.clone(),
        };
        inner.next_seq += 1;

        // Closed feeds are pruned here.
        inner
            .watchers
            .retain(|watcher| watcher.send(Ok(record.clone())).is_ok());

        tag
    }

    /// Open a change feed. It sees only inserts made after this call.
    pub fn watch(&self) -> ChannelChangeSource {
        let (sender, receiver) = unbounded();
        self.inner.write().watchers.push(sender);
        ChannelChangeSource::new(receiver)
    }

    /// Fail every open feed, as when the store invalidates its cursors.
    pub fn invalidate_watchers(&self, reason: &str) {
        let watchers = std::mem::take(&mut self.inner.write().watchers);
        for watcher in watchers {
            let _ = watcher.send(Err(FeedError::SourceInvalidated(reason.to_string())));
        }
    }

    /// End every open feed.
    pub fn close_watchers(&self) {
        self.inner.write().watchers.clear();
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.read().watchers.len()
    }

    /// All tags of one type, oldest first.
    pub fn tags(&self, tag_type: &str) -> Vec<Tag> {
        self.inner
            .read()
            .tags
            .iter()
            .filter(|tag| tag.tag_type == tag_type)
            .cloned()
            .collect()
    }

    /// Zero-based page of all tags in insert order.
    pub fn tags_page(&self, page: usize, size: usize) -> TagsPage {
        let inner = self.inner.read();
        let len = inner.tags.len();
        let start = page.saturating_mul(size).min(len);
        let end = start.saturating_add(size).min(len);

        TagsPage {
            tags: inner.tags[start..end].to_vec(),
            has_more: end < len,
        }
    }

    pub fn random_tag(&self) -> Option<Tag> {
        self.inner.read().tags.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn last_tag(&self) -> Option<Tag> {
        self.inner.read().tags.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TagWriter for MemoryTagStore {
    fn insert_tag(&self, tag_type: &str, label: &str) -> Result<Tag> {
        Ok(self.add_tag(tag_type, label))
    }
}
