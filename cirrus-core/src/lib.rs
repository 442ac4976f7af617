//! Cirrus Core
//!
//! This crate contains the runtime-agnostic building blocks of the cloud
//! event layer:
//! - Byte-based outbound admission control (`backpressure`)
//! - Shared, reference-counted payload buffer (`payload`)
//! - Event records and their status state machine (`event`)
//! - System → application context hand-off (`dispatch`)
//! - Consumed transport contract + in-process loopback (`transport`, `loopback`)
//! - Prefix subscriptions (`subscription`)
//! - Publish/receive pipelines (`hub`)

#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod backpressure;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod hub;
pub mod loopback;
pub mod payload;
pub mod subscription;
pub mod transport;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::backpressure::{RateLimiter, BLOCK_SIZE, MAX_DATA_IN_FLIGHT};
    pub use crate::dispatch::{AppContext, AppHandle};
    pub use crate::error::{Error, Result};
    pub use crate::event::{ContentType, Event, Status, MAX_EVENT_NAME_LENGTH};
    pub use crate::hub::EventHub;
    pub use crate::loopback::LoopbackTransport;
    pub use crate::payload::{Payload, MAX_PAYLOAD_SIZE};
    pub use crate::subscription::{Subscription, SubscriptionRegistry};
    pub use crate::transport::{
        CancelOutcome, InboundRequest, Method, OutboundRequest, RequestId, Transport,
    };
}
