//! Bridging legacy filter subscriptions into the event hub.
//!
//! A handler registered with the large-event flag leaves the wire message
//! unconsumed; this glue decodes it and fans it out through the hub so the
//! payload reaches prefix subscribers as a regular event.

use std::sync::Arc;

use parking_lot::Mutex;

use cirrus::coap::codec::{option, CoapCode, CoapMessageDecoder, CoapMessageEncoder, CoapType};
use cirrus::dev_tracing;
use cirrus::prelude::*;

fn event_message(channel: &mut MemoryChannel, name_segments: &[&str], payload: &[u8]) -> Message {
    let mut msg = channel.create().unwrap();
    let mut enc = CoapMessageEncoder::new(msg.buf_mut());
    enc.typ(CoapType::NonConfirmable).code(CoapCode::Post).id(7);
    enc.option(option::URI_PATH, b"E");
    for segment in name_segments {
        enc.option(option::URI_PATH, segment.as_bytes());
    }
    enc.payload(payload);
    let n = enc.encode();
    assert!(n <= msg.capacity());
    msg.set_length(n);
    msg
}

/// Decode an unconsumed event message into a hub request.
fn to_inbound(msg: &Message) -> InboundRequest {
    let dec = CoapMessageDecoder::decode(msg.bytes()).unwrap();
    let mut path = String::new();
    let mut first = true;
    for opt in dec.options() {
        if opt.number == option::URI_PATH {
            if first {
                first = false;
                continue;
            }
            path.push('/');
            path.push_str(std::str::from_utf8(opt.value).unwrap());
        }
    }
    let content_format = dec
        .options()
        .find(|opt| opt.number == option::CONTENT_FORMAT)
        .map(|opt| opt.to_uint() as u16);
    InboundRequest {
        method: Method::Post,
        uri_path: format!("/E{path}"),
        content_format,
        payload: Payload::from_bytes(dec.payload()).unwrap(),
    }
}

#[test]
fn deferred_large_event_reaches_hub_subscribers() {
    dev_tracing::init_tracing();
    let transport = LoopbackTransport::open("loopback://legacy-bridge").unwrap();
    let app = AppContext::new();
    let hub = EventHub::new(Arc::clone(&transport) as _, app.handle());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    hub.subscribe("firmware", move |event| {
        seen2.lock().push((event.name(), event.data()));
    })
    .unwrap();

    let mut channel = MemoryChannel::new(256, false);
    let mut subs = LegacySubscriptions::new();
    subs.add_handler("firmware", SubscriptionFlags::LARGE_EVENT, Arc::new(|_event| {}))
        .unwrap();

    let mut msg = event_message(&mut channel, &["firmware", "update"], b"blob");
    // The legacy path declines the message; the hub takes over.
    assert!(!subs.handle_event(&mut channel, &mut msg).unwrap());
    hub.dispatch_received(&to_inbound(&msg)).unwrap();
    app.run_pending();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "firmware/update");
    assert_eq!(seen[0].1.as_ref(), b"blob");

    LoopbackTransport::close("loopback://legacy-bridge");
}

#[test]
fn legacy_and_hub_subscriptions_coexist() {
    dev_tracing::init_tracing();
    let transport = LoopbackTransport::open("loopback://legacy-coexist").unwrap();
    let app = AppContext::new();
    let hub = EventHub::new(Arc::clone(&transport) as _, app.handle());

    let hub_seen = Arc::new(Mutex::new(0usize));
    let hub_seen2 = Arc::clone(&hub_seen);
    hub.subscribe("metrics", move |_event| *hub_seen2.lock() += 1).unwrap();

    let legacy_seen = Arc::new(Mutex::new(0usize));
    let legacy_seen2 = Arc::clone(&legacy_seen);
    let mut channel = MemoryChannel::new(256, false);
    let mut subs = LegacySubscriptions::new();
    subs.add_handler(
        "metrics",
        SubscriptionFlags::NONE,
        Arc::new(move |_event| *legacy_seen2.lock() += 1),
    )
    .unwrap();

    // The legacy layer consumes the message, so the hub never sees it.
    let mut msg = event_message(&mut channel, &["metrics", "cpu"], b"42");
    assert!(subs.handle_event(&mut channel, &mut msg).unwrap());
    app.run_pending();
    assert_eq!(*legacy_seen.lock(), 1);
    assert_eq!(*hub_seen.lock(), 0);

    // Events arriving through the transport only reach hub subscribers.
    assert!(transport.deliver(InboundRequest {
        method: Method::Post,
        uri_path: "/E/metrics/cpu".to_owned(),
        content_format: None,
        payload: Payload::from_bytes(b"42").unwrap(),
    }));
    app.run_pending();
    assert_eq!(*legacy_seen.lock(), 1);
    assert_eq!(*hub_seen.lock(), 1);

    LoopbackTransport::close("loopback://legacy-coexist");
}
