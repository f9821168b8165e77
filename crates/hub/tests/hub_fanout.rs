//! Fan-out and channel sharing across many listeners.

use livecall_hub::{ChangeEvent, ChangeFeedHub, ChannelStatus, EventFilter, EventType, MemoryTransport};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn event(n: usize) -> ChangeEvent {
    let types = [EventType::Insert, EventType::Update, EventType::Delete];
    ChangeEvent::new(
        types[n % 3],
        "sales_calls",
        json!({ "call_id": format!("c-{}", n) }),
        json!({ "call_id": format!("c-{}", n) }),
    )
}

proptest! {
    /// N listeners on one resource share one channel and each sees every event once.
    #[test]
    fn every_listener_receives_every_event_once(listeners in 1usize..16, events in 0usize..40) {
        let transport = Arc::new(MemoryTransport::new());
        let hub = ChangeFeedHub::new("hub", transport.clone());

        let counters: Vec<Arc<AtomicUsize>> = (0..listeners).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let subs: Vec<_> = counters
            .iter()
            .map(|c| {
                let c = Arc::clone(c);
                hub.subscribe("sales_calls", &[EventFilter::All], move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        prop_assert_eq!(transport.opened_total(), 1);
        prop_assert_eq!(hub.diagnostics().open_channels, 1);

        for n in 0..events {
            prop_assert!(transport.emit("sales_calls", event(n)));
        }
        for c in &counters {
            prop_assert_eq!(c.load(Ordering::SeqCst), events);
        }

        for sub in &subs {
            prop_assert!(sub.unsubscribe());
        }
        prop_assert_eq!(transport.open_channels(), 0);
        prop_assert_eq!(transport.closed_total(), 1);
    }
}

#[test]
fn test_events_are_scoped_to_their_resource() {
    let transport = Arc::new(MemoryTransport::new());
    let hub = ChangeFeedHub::new("hub", transport.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    let _calls = hub.subscribe("sales_calls", &[EventFilter::Insert, EventFilter::Update], move |e| {
        s.lock().push(e.event_type);
        Ok(())
    });
    let _agents = hub.subscribe("agents", &[], |_| Ok(()));

    transport.emit("sales_calls", event(0));
    transport.emit("sales_calls", event(1));
    transport.emit("sales_calls", event(2));
    transport.emit("agents", ChangeEvent::insert("agents", json!({ "id": 1 })));

    assert_eq!(*seen.lock(), vec![EventType::Insert, EventType::Update]);
    assert_eq!(hub.diagnostics().open_channels, 2);
}

#[test]
fn test_concurrent_subscribe_and_dispatch() {
    let transport = Arc::new(MemoryTransport::new());
    let hub = ChangeFeedHub::new("hub", transport.clone());
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let hub = hub.clone();
            let total = Arc::clone(&total);
            thread::spawn(move || {
                let t = Arc::clone(&total);
                hub.subscribe("sales_calls", &[], move |_| {
                    t.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        })
        .collect();
    let subs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(transport.opened_total(), 1);
    assert_eq!(hub.listener_count("sales_calls"), 8);

    let emitters: Vec<_> = (0..4)
        .map(|n| {
            let transport = transport.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    transport.emit("sales_calls", event(n * 10 + i));
                }
            })
        })
        .collect();
    for e in emitters {
        e.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 8 * 40);

    for sub in subs {
        sub.unsubscribe();
    }
    assert!(!transport.is_open("sales_calls"));
}

#[test]
fn test_listener_may_unsubscribe_itself() {
    let transport = Arc::new(MemoryTransport::new());
    let hub = ChangeFeedHub::new("hub", transport.clone());
    let slot: Arc<Mutex<Option<livecall_hub::Subscription>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let s = Arc::clone(&slot);
    let c = Arc::clone(&calls);
    let sub = hub.subscribe("sales_calls", &[], move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        if let Some(sub) = s.lock().take() {
            sub.unsubscribe();
        }
        Ok(())
    });
    *slot.lock() = Some(sub);

    assert!(transport.emit("sales_calls", event(0)));
    // The channel closed with its last listener.
    assert!(!transport.emit("sales_calls", event(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_channel_drop_keeps_listeners() {
    let transport = Arc::new(MemoryTransport::new());
    let hub = ChangeFeedHub::new("hub", transport.clone());
    let _sub = hub.subscribe("sales_calls", &[], |_| Ok(()));

    transport.report("sales_calls", ChannelStatus::Errored("socket reset".into()));

    let diag = hub.diagnostics();
    assert!(!diag.connected("sales_calls"));
    assert_eq!(diag.listener_count, 1);
    assert_eq!(
        diag.resource("sales_calls").and_then(|r| r.last_error.clone()).as_deref(),
        Some("socket reset")
    );

    transport.report("sales_calls", ChannelStatus::Subscribed);
    assert!(hub.is_connected("sales_calls"));
}
