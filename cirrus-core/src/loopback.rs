//! In-process loopback transport.
//!
//! The loopback transport keeps every handed-off request in memory and lets
//! the process itself play the remote endpoint: complete or fail outbound
//! requests, and deliver inbound ones to the registered handlers. Tests use
//! it to script completion and cancellation interleavings; same-process
//! wiring can use the `loopback://` registry to share one instance.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transport::{
    CancelOutcome, Completion, InboundRequest, Method, OutboundRequest, RequestHandler, RequestId,
    Transport,
};

/// Global registry of named loopback endpoints.
static LOOPBACK_REGISTRY: Lazy<DashMap<String, Arc<LoopbackTransport>>> = Lazy::new(DashMap::new);

struct Pending {
    request: OutboundRequest,
    completion: Completion,
}

/// A transport whose remote side is driven by the caller.
#[derive(Default)]
pub struct LoopbackTransport {
    next_id: AtomicU32,
    pending: DashMap<RequestId, Pending>,
    handlers: DashMap<(String, Method), RequestHandler>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the shared transport bound to a `loopback://` endpoint.
    pub fn open(endpoint: &str) -> Result<Arc<Self>> {
        let name = endpoint
            .strip_prefix("loopback://")
            .filter(|n| !n.is_empty())
            .ok_or(Error::InvalidArgument)?;
        Ok(LOOPBACK_REGISTRY
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Self::new()))
            .clone())
    }

    /// Drop a named endpoint from the registry.
    pub fn close(endpoint: &str) {
        if let Some(name) = endpoint.strip_prefix("loopback://") {
            LOOPBACK_REGISTRY.remove(name);
        }
    }

    /// IDs of requests currently awaiting completion, in id order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of a pending request.
    #[must_use]
    pub fn request(&self, id: RequestId) -> Option<OutboundRequest> {
        self.pending.get(&id).map(|e| e.request.clone())
    }

    /// Complete a pending request, invoking its completion callback the way
    /// the system context would. Returns `false` if the id is unknown.
    pub fn complete(&self, id: RequestId, result: Result<()>) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            return false;
        };
        (pending.completion)(result);
        true
    }

    /// Deliver an inbound request to the matching registered handler.
    ///
    /// A handler registered for path `p` receives every request whose URI
    /// path starts with `p`. Returns whether a handler was found.
    pub fn deliver(&self, req: InboundRequest) -> bool {
        for entry in self.handlers.iter() {
            let (path, method) = entry.key();
            if *method == req.method && req.uri_path.starts_with(path.as_str()) {
                (entry.value())(req);
                return true;
            }
        }
        false
    }

    /// Whether a handler is registered for `path`/`method`.
    #[must_use]
    pub fn has_handler(&self, path: &str, method: Method) -> bool {
        self.handlers.contains_key(&(path.to_owned(), method))
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, req: OutboundRequest, on_complete: Completion) -> Result<RequestId> {
        // Ids start at 1; 0 is the invalid-request sentinel
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.insert(
            id,
            Pending {
                request: req,
                completion: on_complete,
            },
        );
        Ok(id)
    }

    fn cancel(&self, id: RequestId) -> CancelOutcome {
        // Dropping the pending entry drops the stored completion, which is
        // the guarantee that it will never fire
        if self.pending.remove(&id).is_some() {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::NotFound
        }
    }

    fn add_request_handler(
        &self,
        path: &str,
        method: Method,
        handler: RequestHandler,
    ) -> Result<()> {
        self.handlers.insert((path.to_owned(), method), handler);
        Ok(())
    }

    fn remove_request_handler(&self, path: &str, method: Method) {
        self.handlers.remove(&(path.to_owned(), method));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use parking_lot::Mutex;

    #[test]
    fn transport_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoopbackTransport>();
        assert_send_sync::<Arc<dyn Transport>>();
    }

    fn post(path: &str) -> OutboundRequest {
        OutboundRequest {
            method: Method::Post,
            uri_path: path.to_owned(),
            content_format: None,
            no_response: None,
            payload: None,
        }
    }

    #[test]
    fn send_complete_fires_exactly_once() {
        let transport = LoopbackTransport::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let id = transport
            .send(post("E/a"), Box::new(move |r| f.lock().push(r)))
            .unwrap();

        assert_eq!(transport.pending_ids(), vec![id]);
        assert!(transport.complete(id, Ok(())));
        assert!(!transport.complete(id, Ok(())));
        assert_eq!(fired.lock().as_slice(), &[Ok(())]);
    }

    #[test]
    fn cancel_drops_the_completion() {
        let transport = LoopbackTransport::new();
        let fired = Arc::new(Mutex::new(0));
        let f = Arc::clone(&fired);
        let id = transport
            .send(post("E/a"), Box::new(move |_| *f.lock() += 1))
            .unwrap();

        assert_eq!(transport.cancel(id), CancelOutcome::Cancelled);
        assert_eq!(transport.cancel(id), CancelOutcome::NotFound);
        assert!(!transport.complete(id, Ok(())));
        assert_eq!(*fired.lock(), 0);
    }

    #[test]
    fn deliver_matches_handler_by_path_prefix() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        transport
            .add_request_handler(
                "/E",
                Method::Post,
                Arc::new(move |req| s.lock().push(req.uri_path)),
            )
            .unwrap();

        let delivered = transport.deliver(InboundRequest {
            method: Method::Post,
            uri_path: "/E/temp".to_owned(),
            content_format: None,
            payload: Payload::new(0),
        });
        assert!(delivered);
        assert_eq!(seen.lock().as_slice(), &["/E/temp".to_owned()]);

        transport.remove_request_handler("/E", Method::Post);
        let delivered = transport.deliver(InboundRequest {
            method: Method::Post,
            uri_path: "/E/temp".to_owned(),
            content_format: None,
            payload: Payload::new(0),
        });
        assert!(!delivered);
    }

    #[test]
    fn open_returns_the_same_endpoint_instance() {
        let a = LoopbackTransport::open("loopback://dev0").unwrap();
        let b = LoopbackTransport::open("loopback://dev0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        LoopbackTransport::close("loopback://dev0");

        assert!(LoopbackTransport::open("loopback://").is_err());
        assert!(LoopbackTransport::open("tcp://x").is_err());
    }
}
