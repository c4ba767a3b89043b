//! Per-client subscription sessions and the transport boundary.

use crate::bus::{
    CloseReason, EventBus, FilterPredicate, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId, SubscriptionStats,
};
use crate::error::{FeedError, Result};
use crate::types::{TagEvent, Topic};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Subscribed and waiting for the next event.
    Open,
    /// Handing an event to the transport.
    Delivering,
    /// Terminal.
    Closed,
}

/// Client-facing transport.
pub trait EventSink {
    /// Deliver one event. An error ends the session that owns the sink.
    fn send(&mut self, event: &TagEvent) -> Result<()>;
}

impl<F> EventSink for F
where
    F: FnMut(&TagEvent) -> Result<()>,
{
    fn send(&mut self, event: &TagEvent) -> Result<()> {
        self(event)
    }
}

/// In-process transport handing events to another thread.
pub struct ChannelSink(pub Sender<TagEvent>);

impl EventSink for ChannelSink {
    fn send(&mut self, event: &TagEvent) -> Result<()> {
        self.0
            .send(event.clone())
            .map_err(|_| FeedError::Delivery("receiver disconnected".to_string()))
    }
}

/// Framing used by [`FramedSink`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// One JSON object per line.
    #[default]
    JsonLines,
    /// MessagePack map prefixed by its length as a big-endian u32.
    MessagePack,
}

/// Sink writing each event to a byte stream, flushed per event.
pub struct FramedSink<W> {
    writer: W,
    format: WireFormat,
}

impl<W: Write> FramedSink<W> {
    pub fn new(writer: W, format: WireFormat) -> Self {
        Self { writer, format }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for FramedSink<W> {
    fn send(&mut self, event: &TagEvent) -> Result<()> {
        match self.format {
            WireFormat::JsonLines => {
                serde_json::to_writer(&mut self.writer, event)?;
                self.writer.write_all(b"\n")?;
            }
            WireFormat::MessagePack => {
                let body = rmp_serde::to_vec_named(event)?;
                let len = u32::try_from(body.len()).map_err(|_| {
                    FeedError::Serialization(format!("frame too large: {} bytes", body.len()))
                })?;
                self.writer.write_all(&len.to_be_bytes())?;
                self.writer.write_all(&body)?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Cancels a session from another thread.
///
/// Cancelling wakes a consumer blocked in [`SubscriptionSession::next_event`].
#[derive(Clone)]
pub struct SessionCanceller {
    bus: Arc<EventBus>,
    id: SubscriptionId,
}

impl SessionCanceller {
    /// Returns false if the session was already closed.
    pub fn cancel(&self) -> bool {
        self.bus.unsubscribe(self.id)
    }
}

/// One live client subscription.
///
/// Yields matching events in publish order. Closing (explicitly, by
/// dropping, via a [`SessionCanceller`], or on a transport error)
/// unsubscribes from the bus and discards anything still queued.
pub struct SubscriptionSession {
    bus: Arc<EventBus>,
    handle: SubscriptionHandle,
    state: SessionState,
    delivered: u64,
}

impl SubscriptionSession {
    /// Subscribe with the bus's default config.
    pub fn open(bus: Arc<EventBus>, topic: &Topic, predicate: FilterPredicate) -> Self {
        let handle = bus.subscribe(topic, predicate);
        Self::from_handle(bus, handle)
    }

    pub fn open_with(
        bus: Arc<EventBus>,
        topic: &Topic,
        predicate: FilterPredicate,
        config: SubscriptionConfig,
    ) -> Self {
        let handle = bus.subscribe_with(topic, predicate, config);
        Self::from_handle(bus, handle)
    }

    fn from_handle(bus: Arc<EventBus>, handle: SubscriptionHandle) -> Self {
        let state = if handle.is_live() {
            SessionState::Open
        } else {
            SessionState::Closed
        };
        Self {
            bus,
            handle,
            state,
            delivered: 0,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Events handed out by this session.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Events lost to overflow.
    pub fn dropped_events(&self) -> u64 {
        self.handle.dropped_count()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.handle.stats()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.handle.close_reason()
    }

    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            bus: Arc::clone(&self.bus),
            id: self.handle.id,
        }
    }

    /// Block until the next matching event.
    pub fn next_event(&mut self) -> Result<TagEvent> {
        if self.state == SessionState::Closed {
            return Err(FeedError::SessionClosed(self.reason_or_unsubscribed()));
        }

        match self.handle.recv() {
            Ok(event) => {
                self.delivered += 1;
                Ok(event)
            }
            Err(reason) => {
                self.finish(reason.clone());
                Err(FeedError::SessionClosed(reason))
            }
        }
    }

    /// Like [`next_event`](Self::next_event), giving up after `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<TagEvent>> {
        if self.state == SessionState::Closed {
            return Err(FeedError::SessionClosed(self.reason_or_unsubscribed()));
        }

        match self.handle.recv_timeout(timeout) {
            Ok(Some(event)) => {
                self.delivered += 1;
                Ok(Some(event))
            }
            Ok(None) => Ok(None),
            Err(reason) => {
                self.finish(reason.clone());
                Err(FeedError::SessionClosed(reason))
            }
        }
    }

    /// Forward events to `sink` until the session closes.
    ///
    /// Returns the close reason when the subscription ends normally. A sink
    /// error closes this session only and is returned as
    /// [`FeedError::Delivery`].
    pub fn pump_into<K: EventSink + ?Sized>(&mut self, sink: &mut K) -> Result<CloseReason> {
        loop {
            let event = match self.next_event() {
                Ok(event) => event,
                Err(FeedError::SessionClosed(reason)) => return Ok(reason),
                Err(e) => return Err(e),
            };

            self.state = SessionState::Delivering;
            if let Err(e) = sink.send(&event) {
                let message = e.to_string();
                tracing::error!(
                    subscription_id = %self.handle.id,
                    error = %message,
                    "delivery to transport failed, closing session"
                );
                self.bus
                    .remove(self.handle.id, CloseReason::TransportError(message.clone()));
                self.finish(CloseReason::TransportError(message.clone()));
                return Err(FeedError::Delivery(message));
            }
            self.state = SessionState::Open;
        }
    }

    /// Unsubscribe. Idempotent.
    pub fn close(&mut self) {
        self.finish(CloseReason::Unsubscribed);
    }

    fn finish(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        // Covers closes initiated by the bus side (overflow, source failure).
        self.bus.unsubscribe(self.handle.id);
        self.state = SessionState::Closed;
        tracing::info!(
            subscription_id = %self.handle.id,
            reason = ?self.handle.close_reason().unwrap_or(reason),
            delivered = self.delivered,
            dropped = self.handle.dropped_count(),
            "subscription session closed"
        );
    }

    fn reason_or_unsubscribed(&self) -> CloseReason {
        self.handle
            .close_reason()
            .unwrap_or(CloseReason::Unsubscribed)
    }
}

impl Iterator for SubscriptionSession {
    type Item = TagEvent;

    fn next(&mut self) -> Option<TagEvent> {
        self.next_event().ok()
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        self.close();
    }
}
