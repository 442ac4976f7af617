//! Wire protocol support for the cirrus event engine.
//!
//! - [`codec`]: encoder/decoder for the constrained binary framing used
//!   on the device-to-cloud link.
//! - [`channel`]: message buffers and the channel trait the protocol
//!   code sends through.
//! - [`legacy`]: filter-based subscriptions speaking the first-generation
//!   protocol, including large-event deferral to the streaming path.

#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod codec;
pub mod legacy;

pub use channel::{MemoryChannel, Message, MessageChannel};
pub use codec::{
    CoapCode, CoapError, CoapMessageDecoder, CoapMessageEncoder, CoapOpt,
    CoapType,
};
pub use legacy::{
    LegacyEvent, LegacyEventHandler, LegacySubscriptions, SubscriptionFlags,
    MAX_LEGACY_SUBSCRIPTIONS,
};
