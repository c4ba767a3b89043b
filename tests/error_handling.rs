//! Failure isolation and edge case tests.

use std::sync::Arc;
use std::time::Duration;
use tagfeed::{
    ChangeRecord, ChangeSource, CloseReason, EventBus, FeedError, FeedPump, FilterPredicate,
    HubConfig, IterChangeSource, MemoryTagStore, OverflowPolicy, PumpState, ResumeToken,
    SessionState, SubscriptionConfig, SubscriptionSession, Tag, TagEvent, TagFeed, TagId, Topic,
};

fn blue(id: u64) -> TagEvent {
    TagEvent::written(Tag::new(TagId(id), "blue", id.to_string()))
}

fn fast_config() -> HubConfig {
    HubConfig {
        poll_interval_ms: 10,
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// --- Subscriber Errors ---

#[test]
fn test_transport_failure_leaves_siblings_alone() {
    init_tracing();
    let bus = Arc::new(EventBus::new());
    let topic = Topic::tags_changed();
    let mut failing = SubscriptionSession::open(Arc::clone(&bus), &topic, FilterPredicate::any());
    let mut sibling = SubscriptionSession::open(Arc::clone(&bus), &topic, FilterPredicate::any());

    bus.publish(&topic, blue(1));

    let mut calls = 0;
    let mut sink = |_: &TagEvent| -> tagfeed::Result<()> {
        calls += 1;
        Err(FeedError::Delivery("socket reset".into()))
    };
    let result = failing.pump_into(&mut sink);

    assert!(matches!(result, Err(FeedError::Delivery(_))));
    assert_eq!(calls, 1);
    assert_eq!(failing.state(), SessionState::Closed);

    // Bus and sibling unaffected
    bus.publish(&topic, blue(2));
    assert_eq!(sibling.next_event().unwrap().tag.id, TagId(1));
    assert_eq!(sibling.next_event().unwrap().tag.id, TagId(2));
    assert_eq!(bus.subscription_count(), 1);
}

#[test]
fn test_panicking_predicate_through_feed() {
    init_tracing();
    let (feed, _store) = TagFeed::in_memory(fast_config()).unwrap();
    let mut broken = feed
        .subscribe(FilterPredicate::from_fn("rejects red", |t| {
            if t == "red" {
                panic!("cannot evaluate red");
            }
            true
        }))
        .unwrap();
    let mut healthy = feed.tag_added("red").unwrap();

    feed.add_tag("red", "R").unwrap();
    feed.add_tag("blue", "B").unwrap();

    let event = broken.next_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(event.tag.label, "B");
    assert!(broken.stats().filter_failures >= 1);

    let event = healthy.next_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(event.tag.label, "R");
}

#[test]
fn test_disconnect_policy_closes_session() {
    let bus = Arc::new(EventBus::new());
    let topic = Topic::tags_changed();
    let mut session = SubscriptionSession::open_with(
        Arc::clone(&bus),
        &topic,
        FilterPredicate::any(),
        SubscriptionConfig {
            buffer_size: 4,
            overflow: OverflowPolicy::Disconnect,
        },
    );

    for i in 0..5 {
        bus.publish(&topic, blue(i));
    }

    assert!(matches!(
        session.next_event(),
        Err(FeedError::SessionClosed(CloseReason::BufferOverflow))
    ));
    assert_eq!(session.dropped_events(), 1);
}

#[test]
fn test_next_after_close_keeps_failing() {
    let bus = Arc::new(EventBus::new());
    let topic = Topic::tags_changed();
    let mut session = SubscriptionSession::open(Arc::clone(&bus), &topic, FilterPredicate::any());

    session.close();
    session.close();

    for _ in 0..2 {
        assert!(matches!(
            session.next_event(),
            Err(FeedError::SessionClosed(CloseReason::Unsubscribed))
        ));
    }
    assert_eq!(session.next(), None);
}

#[test]
fn test_session_on_shut_down_bus_starts_closed() {
    let bus = Arc::new(EventBus::new());
    bus.shutdown();

    let mut session =
        SubscriptionSession::open(Arc::clone(&bus), &Topic::tags_changed(), FilterPredicate::any());

    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.next_event(),
        Err(FeedError::SessionClosed(CloseReason::Shutdown))
    ));
}

// --- Source Errors ---

#[test]
fn test_exhausted_source_stops_pump() {
    let bus = Arc::new(EventBus::new());
    let topic = Topic::tags_changed();
    let records = (1..=3).map(|i| {
        Ok(ChangeRecord {
            token: ResumeToken(i.to_string()),
            document: Tag::new(TagId(i), "blue", "x"),
        })
    });

    let mut pump = FeedPump::start(
        IterChangeSource::new(records),
        Arc::clone(&bus),
        topic,
        Duration::from_millis(10),
    )
    .unwrap();

    assert!(matches!(pump.wait(), Err(FeedError::SourceExhausted)));
    assert_eq!(pump.state(), PumpState::Stopped);
    assert_eq!(pump.pumped(), 3);
    assert_eq!(pump.last_token(), Some(ResumeToken("3".into())));
}

#[test]
fn test_closed_store_feed_is_fatal() {
    let (feed, store) = TagFeed::in_memory(fast_config()).unwrap();
    let mut session = feed.tag_added("blue").unwrap();

    store.close_watchers();

    let result = session.next_timeout(Duration::from_secs(5));
    assert!(matches!(
        result,
        Err(FeedError::SessionClosed(CloseReason::SourceFailed(_)))
    ));
    assert!(feed.source_failure().unwrap().contains("exhausted"));
}

/// Source whose driver panics on the first pull.
struct PanickingSource;

impl ChangeSource for PanickingSource {
    fn next_change(&mut self, _timeout: Duration) -> tagfeed::Result<Option<ChangeRecord>> {
        panic!("driver bug");
    }
}

#[test]
fn test_panicking_source_is_an_outage() {
    init_tracing();
    let store = Arc::new(MemoryTagStore::new());
    let feed = TagFeed::start(fast_config(), PanickingSource, store).unwrap();

    // Either the session registered before the failure and is closed by it,
    // or it is refused outright.
    match feed.tag_added("blue") {
        Ok(mut session) => assert!(matches!(
            session.next_timeout(Duration::from_secs(5)),
            Err(FeedError::SessionClosed(CloseReason::SourceFailed(_)))
        )),
        Err(e) => assert!(matches!(e, FeedError::SourceInvalidated(_))),
    }

    assert_eq!(feed.pump_state(), PumpState::Stopped);
    assert!(feed.source_failure().unwrap().contains("panicked"));
    assert!(matches!(
        feed.tag_added("blue"),
        Err(FeedError::SourceInvalidated(_))
    ));
}

#[test]
fn test_write_path_survives_source_failure() {
    let (feed, store) = TagFeed::in_memory(fast_config()).unwrap();
    let mut watcher = feed.tag_added("blue").unwrap();

    store.invalidate_watchers("cursor killed");
    // Wait until the outage has been surfaced.
    assert!(watcher.next_timeout(Duration::from_secs(5)).is_err());

    // Writes still persist; there is just nobody left to tell.
    let tag = feed.add_tag("blue", "after").unwrap();
    assert_eq!(store.last_tag(), Some(tag));
    assert_eq!(feed.subscription_count(), 0);
}

// --- Config Errors ---

#[test]
fn test_invalid_config_rejected_at_start() {
    let config = HubConfig {
        poll_interval_ms: 0,
        ..Default::default()
    };
    assert!(matches!(
        TagFeed::in_memory(config),
        Err(FeedError::InvalidConfig(_))
    ));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let result = HubConfig::load(dir.path().join("absent.json"));
    assert!(matches!(result, Err(FeedError::Io(_))));
}
