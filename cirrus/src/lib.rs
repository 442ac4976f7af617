//! # Cirrus
//!
//! A cloud event publish/subscribe engine for constrained devices.
//!
//! ## Architecture
//!
//! Cirrus is structured as an **event kernel** with clean layering:
//!
//! - **`cirrus-core`**: Event records, admission control, prefix
//!   subscriptions, the transport contract and the publish/receive hub
//! - **`cirrus-coap`**: Wire codec and the legacy filter-subscription
//!   protocol (sans-IO)
//! - **`cirrus`**: Public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cirrus::prelude::*;
//!
//! # fn example() -> cirrus::Result<()> {
//! let transport = LoopbackTransport::open("loopback://demo")?;
//! let app = AppContext::new();
//! let hub = EventHub::new(transport, app.handle());
//!
//! // Publish an event with a textual payload
//! let event = Event::new().with_name("sensor/temp").with_data(b"21.5");
//! hub.publish(&event)?;
//!
//! // Deliver matching events to the application context
//! hub.subscribe("sensor", |event| {
//!     println!("{}: {}", event.name(), event.data_string());
//! })?;
//! app.run_pending();
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - **Shared payloads**: `bytes`-backed buffers are reference-counted, so
//!   fan-out to multiple subscriptions never copies event data
//! - **Bounded in-flight data**: outbound payloads are admitted against a
//!   byte budget in whole blocks
//! - **Two contexts**: transport callbacks run in the system context and
//!   hop to the application context through a channel
//! - **Sans-IO protocol**: the wire codec writes into caller-owned buffers
//!   and never touches a socket

#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;

pub use cirrus_core::backpressure::{RateLimiter, BLOCK_SIZE, MAX_DATA_IN_FLIGHT};
pub use cirrus_core::dispatch::{AppContext, AppHandle};
pub use cirrus_core::error::{Error, Result};
pub use cirrus_core::event::{ContentType, Event, Status, MAX_EVENT_NAME_LENGTH};
pub use cirrus_core::hub::EventHub;
pub use cirrus_core::loopback::LoopbackTransport;
pub use cirrus_core::payload::{Payload, MAX_PAYLOAD_SIZE};
pub use cirrus_core::transport::{
    CancelOutcome, InboundRequest, Method, OutboundRequest, RequestId, Transport,
};

/// Wire protocol support (opt-in via the `coap` feature).
#[cfg(feature = "coap")]
pub use cirrus_coap as coap;

pub mod dev_tracing;

pub mod prelude {
    pub use cirrus_core::prelude::*;

    #[cfg(feature = "coap")]
    pub use cirrus_coap::{
        LegacySubscriptions, MemoryChannel, Message, MessageChannel, SubscriptionFlags,
    };
}
