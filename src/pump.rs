//! Feed pump: drains the change source onto the event bus.

use crate::bus::{CloseReason, EventBus};
use crate::error::{FeedError, Result};
use crate::source::ChangeSource;
use crate::types::{ResumeToken, TagEvent, Topic};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Lifecycle of the pump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpState {
    Starting,
    Running,
    /// Terminal: stop was requested or the source failed.
    Stopped,
}

struct PumpShared {
    state: Mutex<PumpState>,
    stop: AtomicBool,
    pumped: AtomicU64,
    last_token: Mutex<Option<ResumeToken>>,
    failure: Mutex<Option<String>>,
}

impl PumpShared {
    fn set_state(&self, state: PumpState) {
        *self.state.lock() = state;
    }
}

/// The single long-lived task republishing change records under one topic.
///
/// The pump holds no buffer of its own; bus publishing never blocks on a
/// subscriber, so the pump keeps draining the source regardless of how
/// slow any consumer is.
pub struct FeedPump {
    topic: Topic,
    shared: Arc<PumpShared>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl FeedPump {
    /// Spawn the pump thread.
    ///
    /// `poll_interval` bounds how long a stop request can go unnoticed
    /// while the source is idle.
    pub fn start<S>(
        source: S,
        bus: Arc<EventBus>,
        topic: Topic,
        poll_interval: Duration,
    ) -> Result<Self>
    where
        S: ChangeSource + 'static,
    {
        let shared = Arc::new(PumpShared {
            state: Mutex::new(PumpState::Starting),
            stop: AtomicBool::new(false),
            pumped: AtomicU64::new(0),
            last_token: Mutex::new(None),
            failure: Mutex::new(None),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            let topic = topic.clone();
            thread::Builder::new()
                .name(format!("tagfeed-pump-{}", topic))
                .spawn(move || run(source, bus, topic, shared, poll_interval))?
        };

        Ok(Self {
            topic,
            shared,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> PumpState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() != PumpState::Stopped
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Number of change records republished so far.
    pub fn pumped(&self) -> u64 {
        self.shared.pumped.load(Ordering::Relaxed)
    }

    /// Token of the last record republished.
    pub fn last_token(&self) -> Option<ResumeToken> {
        self.shared.last_token.lock().clone()
    }

    /// Description of the fatal source error, if the pump died from one.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// Request a stop and wait for the pump thread.
    ///
    /// Returns the source error if the pump had already died from one.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.wait()
    }

    /// Wait for the pump to stop on its own. Only returns once the source
    /// fails or another thread calls [`FeedPump::stop`].
    pub fn wait(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                self.shared.set_state(PumpState::Stopped);
                FeedError::PumpPanicked
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for FeedPump {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                tracing::debug!(topic = %self.topic, error = %e, "feed pump ended with error");
            }
        }
    }
}

fn run<S: ChangeSource>(
    mut source: S,
    bus: Arc<EventBus>,
    topic: Topic,
    shared: Arc<PumpShared>,
    poll_interval: Duration,
) -> Result<()> {
    shared.set_state(PumpState::Running);
    tracing::info!(topic = %topic, "feed pump running");

    let outcome = loop {
        if shared.stop.load(Ordering::SeqCst) {
            break Ok(());
        }

        let next = catch_unwind(AssertUnwindSafe(|| source.next_change(poll_interval)))
            .unwrap_or_else(|_| {
                Err(FeedError::SourceInvalidated(
                    "change source panicked".to_string(),
                ))
            });

        match next {
            Ok(Some(record)) => {
                *shared.last_token.lock() = Some(record.token.clone());
                shared.pumped.fetch_add(1, Ordering::Relaxed);
                bus.publish(&topic, TagEvent::from_change(record));
            }
            Ok(None) => continue,
            Err(e) => break Err(e),
        }
    };

    match &outcome {
        Ok(()) => {
            tracing::info!(
                topic = %topic,
                pumped = shared.pumped.load(Ordering::Relaxed),
                "feed pump stopped"
            );
        }
        Err(e) => {
            tracing::error!(
                topic = %topic,
                error = %e,
                last_token = ?shared.last_token.lock().clone(),
                "change source failed, feed pump stopped"
            );
            *shared.failure.lock() = Some(e.to_string());
            shared.set_state(PumpState::Stopped);
            // Every subscriber on the topic sees the outage.
            bus.close_topic(&topic, CloseReason::SourceFailed(e.to_string()));
        }
    }

    shared.set_state(PumpState::Stopped);
    outcome
}
