//! Consumed transport contract.
//!
//! The engine does no wire I/O itself; it hands fully-described requests to
//! a [`Transport`] and learns about completion through a one-shot callback
//! fired from the system context. Message timeouts, retransmission and the
//! exact option layout are the transport's business, not ours.

use std::sync::Arc;

use crate::error::Result;
use crate::payload::Payload;

/// Maximum length of a request URI path handed to the transport.
pub const MAX_URI_PATH_LENGTH: usize = 127;

/// Fixed "no immediate response expected" option value (RFC 7967, 2.1).
pub const NO_RESPONSE_ALL: u32 = 26;

/// Correlates an in-flight request with its later completion.
pub type RequestId = u32;

/// Sentinel for "no request in flight".
pub const INVALID_REQUEST_ID: RequestId = 0;

/// Request method understood by the event layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// An outbound request, fully described.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri_path: String,
    /// Content-format option; `None` omits the option (textual default).
    pub content_format: Option<u16>,
    /// Suppress response classes per RFC 7967 (`NO_RESPONSE_ALL`).
    pub no_response: Option<u32>,
    pub payload: Option<Payload>,
}

/// An inbound request as decoded by the transport.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri_path: String,
    pub content_format: Option<u16>,
    /// Decoded payload; shared by reference with every consumer.
    pub payload: Payload,
}

/// One-shot completion callback, invoked from the system context on either
/// acknowledgement or error. The transport must call it exactly once, or
/// drop it without calling when the request is cancelled.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + Sync + 'static>;

/// Handler for inbound requests, invoked from the system context.
pub type RequestHandler = Arc<dyn Fn(InboundRequest) + Send + Sync + 'static>;

/// Outcome of a best-effort cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was found and cancelled; its completion will not fire.
    Cancelled,
    /// The request was not found (already completed or never existed).
    NotFound,
}

/// The wire transport consumed by the event engine.
pub trait Transport: Send + Sync {
    /// Hand off `req`. On success the transport owns `on_complete` and will
    /// invoke it exactly once from the system context.
    fn send(&self, req: OutboundRequest, on_complete: Completion) -> Result<RequestId>;

    /// Best-effort cancel of an in-flight request.
    fn cancel(&self, id: RequestId) -> CancelOutcome;

    /// Register the handler for inbound requests matching `path`/`method`.
    fn add_request_handler(&self, path: &str, method: Method, handler: RequestHandler)
        -> Result<()>;

    /// Remove a previously registered handler.
    fn remove_request_handler(&self, path: &str, method: Method);
}
