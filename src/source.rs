//! Boundary to the store's native change feed.
//!
//! A change source is a lazy, non-restartable sequence of [`ChangeRecord`]s
//! in the store's order. The feed pump pulls from it with a bounded wait so
//! it can observe a stop request between records.

use crate::error::{FeedError, Result};
use crate::types::ChangeRecord;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// Pull-based change feed.
pub trait ChangeSource: Send {
    /// Wait up to `timeout` for the next change.
    ///
    /// `Ok(None)` means nothing arrived in time. Any error is final: the
    /// source cannot be resumed or rewound afterwards.
    fn next_change(&mut self, timeout: Duration) -> Result<Option<ChangeRecord>>;
}

impl<S: ChangeSource + ?Sized> ChangeSource for Box<S> {
    fn next_change(&mut self, timeout: Duration) -> Result<Option<ChangeRecord>> {
        (**self).next_change(timeout)
    }
}

/// Change source fed through a channel by the store.
///
/// The store reports cursor failures by sending an `Err`; dropping every
/// sender ends the feed with [`FeedError::SourceExhausted`].
pub struct ChannelChangeSource {
    receiver: Receiver<Result<ChangeRecord>>,
    failed: bool,
}

impl ChannelChangeSource {
    pub fn new(receiver: Receiver<Result<ChangeRecord>>) -> Self {
        Self {
            receiver,
            failed: false,
        }
    }
}

impl ChangeSource for ChannelChangeSource {
    fn next_change(&mut self, timeout: Duration) -> Result<Option<ChangeRecord>> {
        if self.failed {
            return Err(FeedError::SourceExhausted);
        }

        let outcome = match self.receiver.recv_timeout(timeout) {
            Ok(Ok(record)) => return Ok(Some(record)),
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Disconnected) => Err(FeedError::SourceExhausted),
        };

        self.failed = true;
        outcome
    }
}

/// Change source backed by an iterator, e.g. a recorded feed.
///
/// The end of the iterator is reported as [`FeedError::SourceExhausted`].
pub struct IterChangeSource<I> {
    inner: I,
    done: bool,
}

impl<I> IterChangeSource<I>
where
    I: Iterator<Item = Result<ChangeRecord>>,
{
    pub fn new(inner: I) -> Self {
        Self { inner, done: false }
    }
}

impl<I> ChangeSource for IterChangeSource<I>
where
    I: Iterator<Item = Result<ChangeRecord>> + Send,
{
    fn next_change(&mut self, _timeout: Duration) -> Result<Option<ChangeRecord>> {
        if self.done {
            return Err(FeedError::SourceExhausted);
        }

        match self.inner.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Err(FeedError::SourceExhausted)
            }
        }
    }
}
