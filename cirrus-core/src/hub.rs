//! Event hub: the publish and receive pipelines.
//!
//! The hub does no wire I/O itself. Publishing hands a fully-built request
//! to the transport after passing the rate limiter; receiving matches a
//! decoded request against the subscription table and fans out to handlers.
//! All user-visible callbacks run on the application context; the hub only
//! ever crosses from the system context to the application context through
//! the explicit [`AppHandle::invoke`] hand-off.
//!
//! Concurrency model:
//! - rate limiter and registry behind mutexes, never held across a hand-off
//! - event status races (completion vs cancel) resolved by CAS on the record
//! - the send-completion closure owns one extra reference to the record for
//!   the lifetime of the in-flight request

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

use crate::backpressure::RateLimiter;
use crate::dispatch::AppHandle;
use crate::error::{Error, Result};
use crate::event::{ContentType, Event, EventRecord, Status};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transport::{
    InboundRequest, Method, OutboundRequest, RequestHandler, RequestId, Transport,
    MAX_URI_PATH_LENGTH, NO_RESPONSE_ALL,
};

/// URI path prefix under which events are published and received.
const EVENT_PATH_PREFIX: &str = "/E";

/// Coordinates event publishing and subscription dispatch for one device.
#[derive(Clone)]
pub struct EventHub {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    app: AppHandle,
    subs: Arc<Mutex<SubscriptionRegistry>>,
}

impl EventHub {
    /// Create a hub with the default in-flight byte budget.
    pub fn new(transport: Arc<dyn Transport>, app: AppHandle) -> Self {
        Self::with_limiter(transport, app, RateLimiter::default())
    }

    /// Create a hub with an explicit rate limiter.
    pub fn with_limiter(
        transport: Arc<dyn Transport>,
        app: AppHandle,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            transport,
            limiter: Arc::new(limiter),
            app,
            subs: Arc::new(Mutex::new(SubscriptionRegistry::new())),
        }
    }

    /// Read-only probe: could an event of `size` payload bytes be admitted
    /// right now?
    #[must_use]
    pub fn can_publish(&self, size: usize) -> bool {
        self.limiter.can_take(size)
    }

    /// Total outbound payload bytes currently charged against the budget.
    #[must_use]
    pub fn data_in_flight(&self) -> usize {
        self.limiter.in_flight()
    }

    /// Publish `event`.
    ///
    /// Non-blocking: on success the event transitions NEW→SENDING and the
    /// final SENT/FAILED transition arrives later through the status-change
    /// callback on the application context. Failures are recorded on the
    /// event record and also returned.
    pub fn publish(&self, event: &Event) -> Result<()> {
        match event.status() {
            Status::Invalid => {
                return Err(event.error().unwrap_or(Error::InvalidState));
            }
            Status::Sending => {
                error!("Event is being sent already");
                return Err(Error::Busy);
            }
            _ => {}
        }
        // A SENT or FAILED event is republishable once its status is reset
        event.reset_status();
        let record = event.record();
        // Drop the inner guard before set_failed re-locks it
        let name = record.inner.lock().name.clone();
        let Some(name) = name else {
            error!("Event name is missing");
            return Err(record.set_failed(Error::InvalidArgument));
        };
        let size = event.size();
        if !self.limiter.take(size) {
            error!("Limit for event data in flight is reached");
            return Err(record.set_failed(Error::LimitExceeded));
        }
        match self.send(event, &name, size) {
            Ok(request_id) => {
                {
                    let mut inner = record.inner.lock();
                    inner.request_id = request_id;
                    inner.in_flight_size = size;
                }
                record.set_status(Status::Sending, None);
                debug!(name = %name, size, request_id, "event handed to transport");
                Ok(())
            }
            Err(err) => {
                self.limiter.give(size);
                error!("Failed to send event: {err}");
                if err.is_recoverable() {
                    Err(record.set_failed(err))
                } else {
                    Err(record.set_invalid(err))
                }
            }
        }
    }

    /// Build the wire request and hand it to the transport.
    fn send(&self, event: &Event, name: &str, size: usize) -> Result<RequestId> {
        let uri_path = format!("E/{name}");
        if uri_path.len() > MAX_URI_PATH_LENGTH {
            return Err(Error::Internal);
        }
        let (content_type, payload) = {
            let inner = event.record().inner.lock();
            (inner.content_type, inner.payload.clone())
        };
        let req = OutboundRequest {
            method: Method::Post,
            uri_path,
            content_format: (content_type != ContentType::Text).then(|| content_type.format()),
            no_response: Some(NO_RESPONSE_ALL),
            payload,
        };
        // The completion closure keeps the record alive until either the
        // ack or the error callback fires, or a confirmed cancel drops it
        let record = Arc::clone(event.record());
        let limiter = Arc::clone(&self.limiter);
        let app = self.app.clone();
        self.transport.send(
            req,
            Box::new(move |result| {
                Self::send_complete(record, limiter, app, size, result);
            }),
        )
    }

    /// Called from the system context when the in-flight request finishes.
    fn send_complete(
        record: Arc<EventRecord>,
        limiter: Arc<RateLimiter>,
        app: AppHandle,
        size: usize,
        result: Result<()>,
    ) {
        record.inner.lock().send_result = Some(result);
        // Update the status of the event on the application context; the
        // scheduled closure is now the sole owner of the extra reference
        let invoked = app.invoke(move || {
            let result = record.inner.lock().send_result.take().unwrap_or(Ok(()));
            let (status, err) = match result {
                Ok(()) => (Status::Sent, None),
                Err(err) => {
                    error!("Failed to send event: {err}");
                    (Status::Failed, Some(err))
                }
            };
            if !record.cas_status(Status::Sending, status, err) {
                return; // The event was cancelled
            }
            limiter.give(size);
        });
        if let Err(err) = invoked {
            error!("Failed to dispatch send completion: {err}");
        }
    }

    /// Best-effort cancel of an in-flight event.
    ///
    /// Only effective while the event is SENDING. The record always ends up
    /// INVALID: a cancelled-but-not-found race is resolved conservatively,
    /// trading reusability for safety against a double limiter release.
    pub fn cancel(&self, event: &Event) {
        if event.status() != Status::Sending {
            return;
        }
        let record = event.record();
        let (request_id, size) = {
            let inner = record.inner.lock();
            (inner.request_id, inner.in_flight_size)
        };
        // On a confirmed cancel the transport drops the stored completion,
        // releasing the extra record reference taken at send time
        let _ = self.transport.cancel(request_id);
        if record.cas_status(Status::Sending, Status::Invalid, Some(Error::Cancelled)) {
            // The completion has either not been scheduled or lost the CAS;
            // the charge is ours to release
            self.limiter.give(size);
        }
    }

    /// Register a subscription for every event whose name starts with
    /// `prefix`. The first subscription registers the single wire-level
    /// request handler; on registration failure the append is rolled back.
    pub fn subscribe(
        &self,
        prefix: &str,
        callback: impl Fn(Event) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut subs = self.subs.lock();
        subs.add(Subscription::new(prefix, Arc::new(callback)));
        if subs.len() == 1 {
            if let Err(err) =
                self.transport
                    .add_request_handler(EVENT_PATH_PREFIX, Method::Post, self.request_handler())
            {
                error!("Failed to register event request handler: {err}");
                subs.remove_last();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove the wire-level request handler and every subscription.
    pub fn unsubscribe_all(&self) {
        let mut subs = self.subs.lock();
        if subs.is_empty() {
            return;
        }
        self.transport
            .remove_request_handler(EVENT_PATH_PREFIX, Method::Post);
        subs.clear();
    }

    /// The wire-level handler for event requests; runs on the system
    /// context and forwards to the application context.
    fn request_handler(&self) -> RequestHandler {
        let subs = Arc::clone(&self.subs);
        let app = self.app.clone();
        Arc::new(move |req: InboundRequest| {
            let subs = Arc::clone(&subs);
            let invoked = app.invoke(move || {
                if let Err(err) = Self::receive_on_app(&subs, &req) {
                    error!("Failed to handle received event: {err}");
                }
            });
            if let Err(err) = invoked {
                error!("Failed to dispatch received event: {err}");
            }
        })
    }

    /// Match an inbound event request against the subscription table and
    /// fan out to every matching handler, in registration order.
    fn receive_on_app(subs: &Mutex<SubscriptionRegistry>, req: &InboundRequest) -> Result<()> {
        if req.uri_path.len() > MAX_URI_PATH_LENGTH {
            return Err(Error::BadData);
        }
        // Inbound names are bounded by the URI path limit alone; peers may
        // use longer names than this device can publish
        let name = req
            .uri_path
            .strip_prefix("/E/")
            .filter(|name| !name.is_empty())
            .ok_or(Error::BadData)?;
        let content_type = ContentType::from_format(req.content_format.unwrap_or(0));

        // Snapshot the matches so no lock is held across user callbacks
        let matched = subs.lock().matches(name);
        for sub in matched {
            // A separate event record per matching handler; every record
            // references the same decoded payload object
            let event = Event::new();
            {
                let mut inner = event.record().inner.lock();
                inner.name = Some(name.to_owned());
                inner.content_type = content_type;
                inner.payload = Some(req.payload.clone());
            }
            (sub.callback())(event);
        }
        Ok(())
    }

    /// Fan a received event out directly, bypassing the transport.
    ///
    /// Entry point for protocol glue that has already decoded a request in
    /// the application context (the legacy large-event deferral path).
    pub fn dispatch_received(&self, req: &InboundRequest) -> Result<()> {
        Self::receive_on_app(&self.subs, req)
    }

    #[cfg(test)]
    pub(crate) fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BLOCK_SIZE;
    use crate::dispatch::AppContext;
    use crate::event::MAX_EVENT_NAME_LENGTH;
    use crate::loopback::LoopbackTransport;
    use crate::payload::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        transport: Arc<LoopbackTransport>,
        app: AppContext,
        hub: EventHub,
    }

    fn fixture() -> Fixture {
        fixture_with_budget(crate::backpressure::MAX_DATA_IN_FLIGHT)
    }

    fn fixture_with_budget(budget: usize) -> Fixture {
        let transport = Arc::new(LoopbackTransport::new());
        let app = AppContext::new();
        let hub = EventHub::with_limiter(
            Arc::clone(&transport) as Arc<dyn Transport>,
            app.handle(),
            RateLimiter::new(budget),
        );
        Fixture {
            transport,
            app,
            hub,
        }
    }

    #[test]
    fn publish_success_reaches_sent_and_releases_charge() {
        let fx = fixture();
        let event = Event::new().with_name("temp").with_data(b"0123456789");

        fx.hub.publish(&event).unwrap();
        assert_eq!(event.status(), Status::Sending);
        assert_eq!(fx.hub.data_in_flight(), BLOCK_SIZE);

        let id = fx.transport.pending_ids()[0];
        let req = fx.transport.request(id).unwrap();
        assert_eq!(req.uri_path, "E/temp");
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.content_format, None); // TEXT omits the option
        assert_eq!(req.no_response, Some(NO_RESPONSE_ALL));

        assert!(fx.transport.complete(id, Ok(())));
        // Still SENDING until the application context runs
        assert_eq!(event.status(), Status::Sending);
        fx.app.run_pending();
        assert_eq!(event.status(), Status::Sent);
        assert_eq!(fx.hub.data_in_flight(), 0);
    }

    #[test]
    fn publish_failure_reaches_failed_with_error() {
        let fx = fixture();
        let event = Event::new().with_name("temp").with_data(b"x");
        fx.hub.publish(&event).unwrap();

        let id = fx.transport.pending_ids()[0];
        fx.transport
            .complete(id, Err(Error::transport("link down")));
        fx.app.run_pending();

        assert_eq!(event.status(), Status::Failed);
        assert!(matches!(event.error(), Some(Error::Transport(_))));
        assert_eq!(fx.hub.data_in_flight(), 0);

        // FAILED is recoverable
        event.reset_status();
        fx.hub.publish(&event).unwrap();
        assert_eq!(event.status(), Status::Sending);
    }

    #[test]
    fn publish_requires_a_name() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let event = Event::new().with_data(b"x").on_status_change(move |event| {
            // Inspecting the record from inside the callback must not hang
            assert_eq!(event.status(), Status::Failed);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fx.hub.publish(&event), Err(Error::InvalidArgument));
        assert_eq!(event.status(), Status::Failed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fx.hub.data_in_flight(), 0);
    }

    #[test]
    fn publish_while_sending_is_busy() {
        let fx = fixture();
        let event = Event::new().with_name("temp");
        fx.hub.publish(&event).unwrap();
        assert_eq!(fx.hub.publish(&event), Err(Error::Busy));
    }

    #[test]
    fn publish_rejected_when_limiter_saturated() {
        let fx = fixture_with_budget(4 * BLOCK_SIZE);
        assert!(fx.hub.limiter().take(3 * BLOCK_SIZE + BLOCK_SIZE / 2));
        let before = fx.hub.data_in_flight();

        let event = Event::new()
            .with_name("big")
            .with_data(&vec![0u8; BLOCK_SIZE + 1]);
        assert_eq!(fx.hub.publish(&event), Err(Error::LimitExceeded));
        assert_eq!(event.status(), Status::Failed);
        assert_eq!(fx.hub.data_in_flight(), before);
        assert!(fx.transport.pending_ids().is_empty());
    }

    #[test]
    fn content_format_option_carried_for_non_text() {
        let fx = fixture();
        let event = Event::new()
            .with_name("bin")
            .with_content_type(ContentType::Binary)
            .with_data(b"\x00\x01");
        fx.hub.publish(&event).unwrap();
        let req = fx.transport.request(fx.transport.pending_ids()[0]).unwrap();
        assert_eq!(req.content_format, Some(42));
    }

    #[test]
    fn max_length_name_is_publishable() {
        let fx = fixture();
        let name = "n".repeat(MAX_EVENT_NAME_LENGTH);
        let event = Event::new().with_name(&name);
        fx.hub.publish(&event).unwrap();
        assert_eq!(event.status(), Status::Sending);
        let req = fx.transport.request(fx.transport.pending_ids()[0]).unwrap();
        assert_eq!(req.uri_path, format!("E/{name}"));
    }

    #[test]
    fn cancel_invalidates_and_releases_exactly_once() {
        let fx = fixture();
        let event = Event::new().with_name("temp").with_data(b"payload");
        fx.hub.publish(&event).unwrap();
        assert_eq!(fx.hub.data_in_flight(), BLOCK_SIZE);

        fx.hub.cancel(&event);
        assert_eq!(event.status(), Status::Invalid);
        assert_eq!(event.error(), Some(Error::Cancelled));
        assert_eq!(fx.hub.data_in_flight(), 0);
        assert!(fx.transport.pending_ids().is_empty());

        // Cancelling again is a no-op
        fx.hub.cancel(&event);
        assert_eq!(fx.hub.data_in_flight(), 0);
    }

    #[test]
    fn cancel_races_completion_without_double_release() {
        let fx = fixture();
        let event = Event::new().with_name("temp").with_data(b"payload");
        fx.hub.publish(&event).unwrap();

        // Completion fires first (system context), then the user cancels
        // before the application context has run the completion task
        let id = fx.transport.pending_ids()[0];
        fx.transport.complete(id, Ok(()));
        fx.hub.cancel(&event);
        assert_eq!(event.status(), Status::Invalid);
        assert_eq!(fx.hub.data_in_flight(), 0);

        // The queued completion loses the CAS and must not release again
        fx.app.run_pending();
        assert_eq!(event.status(), Status::Invalid);
        assert_eq!(fx.hub.data_in_flight(), 0);
    }

    #[test]
    fn subscribe_registers_wire_handler_once() {
        let fx = fixture();
        assert!(!fx.transport.has_handler("/E", Method::Post));
        fx.hub.subscribe("a", |_| {}).unwrap();
        assert!(fx.transport.has_handler("/E", Method::Post));
        fx.hub.subscribe("b", |_| {}).unwrap();

        fx.hub.unsubscribe_all();
        assert!(!fx.transport.has_handler("/E", Method::Post));
    }

    #[test]
    fn receive_fans_out_in_registration_order() {
        let fx = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));

        for prefix in ["a", "a/b"] {
            let log = Arc::clone(&log);
            let tag = prefix.to_owned();
            fx.hub
                .subscribe(prefix, move |event| {
                    log.lock().push((tag.clone(), event.name()));
                })
                .unwrap();
        }

        let payload = Payload::from_bytes(b"21.5").unwrap();
        fx.transport.deliver(InboundRequest {
            method: Method::Post,
            uri_path: "/E/a/b/c".to_owned(),
            content_format: None,
            payload,
        });
        fx.app.run_pending();

        let log = log.lock();
        assert_eq!(
            log.as_slice(),
            &[
                ("a".to_owned(), "a/b/c".to_owned()),
                ("a/b".to_owned(), "a/b/c".to_owned()),
            ]
        );
    }

    #[test]
    fn received_siblings_share_one_payload() {
        let fx = fixture();
        let events = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let events = Arc::clone(&events);
            fx.hub
                .subscribe("t", move |event| events.lock().push(event))
                .unwrap();
        }

        fx.transport.deliver(InboundRequest {
            method: Method::Post,
            uri_path: "/E/t".to_owned(),
            content_format: Some(42),
            payload: Payload::from_bytes(b"\x01\x02").unwrap(),
        });
        fx.app.run_pending();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        for event in events.iter() {
            assert_eq!(event.content_type(), ContentType::Binary);
            assert_eq!(event.data().as_ref(), b"\x01\x02");
        }
    }

    #[test]
    fn inbound_names_longer_than_the_publish_limit_still_dispatch() {
        let fx = fixture();
        let names = Arc::new(Mutex::new(Vec::new()));
        let n = Arc::clone(&names);
        fx.hub.subscribe("long", move |event| n.lock().push(event.name())).unwrap();

        let name = format!("long/{}", "x".repeat(MAX_EVENT_NAME_LENGTH + 31));
        fx.transport.deliver(InboundRequest {
            method: Method::Post,
            uri_path: format!("/E/{name}"),
            content_format: None,
            payload: Payload::new(0),
        });
        fx.app.run_pending();
        assert_eq!(names.lock().as_slice(), &[name]);
    }

    #[test]
    fn malformed_inbound_paths_are_dropped() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        fx.hub
            .subscribe("", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        for path in ["/E", "/E/", "/X/name"] {
            fx.transport.deliver(InboundRequest {
                method: Method::Post,
                uri_path: (*path).to_owned(),
                content_format: None,
                payload: Payload::new(0),
            });
        }
        fx.app.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
