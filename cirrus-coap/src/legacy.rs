//! Filter-based event subscriptions for the first-generation wire protocol.
//!
//! Older peers register interest with a GET carrying the event name
//! filter in the URI path and flag letters in the query string. Incoming
//! events arrive as POSTs whose URI path encodes the event name; this
//! module matches them against the registered filters and hands the
//! payload to the matching handlers as a NUL-terminated byte view.
//!
//! Handlers that opt into large events do not consume the message here;
//! [`LegacySubscriptions::handle_event`] reports it unhandled so the
//! event hub can stream it instead.

use std::sync::Arc;

use tracing::{debug, warn};

use cirrus_core::error::{Error, Result};
use cirrus_core::event::MAX_EVENT_NAME_LENGTH;

use crate::channel::{Message, MessageChannel};
use crate::codec::{
    self, content_format, option, CoapCode, CoapMessageDecoder,
    CoapMessageEncoder, CoapType,
};

/// Upper bound on concurrently registered filters.
pub const MAX_LEGACY_SUBSCRIPTIONS: usize = 6;

/// Behavior flags attached to a filter subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionFlags(u8);

impl SubscriptionFlags {
    pub const NONE: Self = Self(0);
    /// Handler expects structured payloads only.
    pub const STRUCTURED_DATA: Self = Self(1);
    /// Handler accepts arbitrary binary payloads.
    pub const BINARY_DATA: Self = Self(1 << 1);
    /// Handler wants oversized events streamed instead of delivered inline.
    pub const LARGE_EVENT: Self = Self(1 << 2);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for SubscriptionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// Query letters carried on the subscription request.
const QUERY_STRUCTURED: &[u8] = b"c";
const QUERY_BINARY: &[u8] = b"b";
const QUERY_LARGE_EVENT: &[u8] = b"l";

/// Event view handed to legacy handlers.
///
/// The payload borrow includes a trailing NUL so handlers that treat
/// the data as a C string keep working; [`data`](Self::data) strips it.
pub struct LegacyEvent<'a> {
    name: &'a str,
    content_format: u16,
    data: &'a [u8],
}

impl<'a> LegacyEvent<'a> {
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    #[must_use]
    pub fn content_format(&self) -> u16 {
        self.content_format
    }

    /// Payload bytes without the trailing NUL.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        match self.data.split_last() {
            Some((0, head)) => head,
            _ => self.data,
        }
    }

    /// Payload bytes including the trailing NUL.
    #[must_use]
    pub fn data_with_nul(&self) -> &'a [u8] {
        self.data
    }
}

pub type LegacyEventHandler = Arc<dyn Fn(&LegacyEvent<'_>) + Send + Sync>;

struct FilterHandler {
    filter: String,
    flags: SubscriptionFlags,
    handler: LegacyEventHandler,
}

/// Registry of filter subscriptions and their server-side handshakes.
#[derive(Default)]
pub struct LegacySubscriptions {
    handlers: Vec<FilterHandler>,
    // Message ids of outstanding subscription requests.
    msg_ids: Vec<u16>,
}

impl LegacySubscriptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for all events whose name starts with `filter`.
    pub fn add_handler(
        &mut self,
        filter: &str,
        flags: SubscriptionFlags,
        handler: LegacyEventHandler,
    ) -> Result<()> {
        if filter.is_empty() || filter.len() > MAX_EVENT_NAME_LENGTH {
            return Err(Error::InvalidArgument);
        }
        if self.handlers.len() >= MAX_LEGACY_SUBSCRIPTIONS {
            return Err(Error::LimitExceeded);
        }
        self.handlers.push(FilterHandler {
            filter: filter.to_owned(),
            flags,
            handler,
        });
        Ok(())
    }

    pub fn remove_handlers(&mut self) {
        self.handlers.clear();
        self.msg_ids.clear();
    }

    #[must_use]
    pub fn has_handlers(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// Message ids of the subscription requests sent so far.
    #[must_use]
    pub fn message_ids(&self) -> &[u16] {
        &self.msg_ids
    }

    /// Sends one subscription request for every registered filter.
    ///
    /// Used after a session (re)start to replay the registrations.
    pub fn send_subscriptions(
        &mut self,
        channel: &mut dyn MessageChannel,
    ) -> Result<()> {
        self.msg_ids.clear();
        for i in 0..self.handlers.len() {
            let filter = self.handlers[i].filter.clone();
            let flags = self.handlers[i].flags;
            self.send_subscription(channel, &filter, flags)?;
        }
        Ok(())
    }

    /// Sends a single subscription request and records its message id.
    pub fn send_subscription(
        &mut self,
        channel: &mut dyn MessageChannel,
        filter: &str,
        flags: SubscriptionFlags,
    ) -> Result<u16> {
        if filter.is_empty() || filter.len() > MAX_EVENT_NAME_LENGTH {
            return Err(Error::InvalidArgument);
        }
        let mut msg = channel.create()?;
        let capacity = msg.capacity();
        // Acknowledged delivery only matters on links without their own.
        let typ = if channel.is_unreliable() {
            CoapType::Confirmable
        } else {
            CoapType::NonConfirmable
        };
        let mut enc = CoapMessageEncoder::new(msg.buf_mut());
        enc.typ(typ).code(CoapCode::Get);
        // The message id is assigned and serialized by the channel.
        enc.option(option::URI_PATH, b"e");
        enc.option(option::URI_PATH, filter.as_bytes());
        if flags.contains(SubscriptionFlags::STRUCTURED_DATA) {
            enc.option(option::URI_QUERY, QUERY_STRUCTURED);
        } else if flags.contains(SubscriptionFlags::BINARY_DATA) {
            enc.option(option::URI_QUERY, QUERY_BINARY);
        }
        if flags.contains(SubscriptionFlags::LARGE_EVENT) {
            enc.option(option::URI_QUERY, QUERY_LARGE_EVENT);
        }
        let size = enc.encode();
        if size > capacity {
            return Err(Error::InsufficientStorage);
        }
        msg.set_length(size);
        let id = channel.send(msg)?;
        debug!(filter = %filter, id, "subscription request sent");
        self.msg_ids.push(id);
        Ok(id)
    }

    /// Matches an incoming event message against the registered filters.
    ///
    /// Returns `Ok(false)` when no handler consumes the message, which
    /// includes the case where a matching handler asked for large-event
    /// streaming; the caller then routes the message elsewhere.
    pub fn handle_event(
        &self,
        channel: &mut dyn MessageChannel,
        msg: &mut Message,
    ) -> Result<bool> {
        let (typ, id, payload_offset, payload_len, name, format) = {
            let dec = CoapMessageDecoder::decode(msg.bytes()).map_err(|err| {
                warn!(%err, "dropping malformed event message");
                Error::MalformedMessage
            })?;
            let (name, format) = Self::parse_event(&dec)?;
            (
                dec.typ(),
                dec.id(),
                dec.payload_offset(),
                dec.payload_size(),
                name,
                format,
            )
        };

        let mut matched: Vec<LegacyEventHandler> = Vec::new();
        for entry in &self.handlers {
            if !name.as_bytes().starts_with(entry.filter.as_bytes()) {
                continue;
            }
            if entry.flags.contains(SubscriptionFlags::LARGE_EVENT) {
                // Streamed delivery happens elsewhere; leave the message
                // unconsumed and unacknowledged.
                debug!(name = %name, "deferring event to large-event handler");
                return Ok(false);
            }
            if entry.flags.contains(SubscriptionFlags::STRUCTURED_DATA) {
                if format != content_format::STRUCTURED {
                    continue;
                }
            } else if !entry.flags.contains(SubscriptionFlags::BINARY_DATA)
                && !codec::is_text_content_format(format)
            {
                continue;
            }
            matched.push(Arc::clone(&entry.handler));
        }
        // Acknowledged even when nothing matched: the sender must not
        // retransmit. Only the large-event deferral above skips this, since
        // the streaming path owns that exchange.
        if typ == CoapType::Confirmable && channel.is_unreliable() {
            Self::send_empty_ack(channel, id)?;
        }
        if matched.is_empty() {
            return Ok(false);
        }

        // Give handlers a NUL-terminated payload view. When the message
        // fills its buffer exactly there is no room for the terminator,
        // so the payload shifts left one byte over the 0xFF marker.
        let data = if payload_len > 0 {
            let full = msg.len() >= msg.capacity();
            let buf = msg.buf_mut();
            let start = if full {
                buf.copy_within(payload_offset..payload_offset + payload_len, payload_offset - 1);
                payload_offset - 1
            } else {
                payload_offset
            };
            buf[start + payload_len] = 0;
            &msg.buf()[start..=start + payload_len]
        } else {
            &[]
        };

        let event = LegacyEvent { name: &name, content_format: format, data };
        for handler in &matched {
            handler(&event);
        }
        Ok(true)
    }

    // Extracts the event name and content format from a decoded message.
    // The first URI path segment addresses the event endpoint itself and
    // is not part of the name.
    fn parse_event(dec: &CoapMessageDecoder<'_>) -> Result<(String, u16)> {
        let mut name = String::new();
        let mut format = content_format::TEXT_PLAIN;
        let mut first_segment = true;
        for opt in dec.options() {
            match opt.number {
                option::URI_PATH => {
                    if first_segment {
                        first_segment = false;
                        continue;
                    }
                    if !name.is_empty() {
                        name.push('/');
                    }
                    let segment = std::str::from_utf8(opt.value)
                        .map_err(|_| Error::MalformedMessage)?;
                    name.push_str(segment);
                }
                option::CONTENT_FORMAT => {
                    format = opt.to_uint() as u16;
                }
                _ => {}
            }
        }
        if name.len() > MAX_EVENT_NAME_LENGTH {
            let mut end = MAX_EVENT_NAME_LENGTH;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name.truncate(end);
        }
        Ok((name, format))
    }

    fn send_empty_ack(channel: &mut dyn MessageChannel, id: u16) -> Result<()> {
        let mut ack = channel.create()?;
        let capacity = ack.capacity();
        let mut enc = CoapMessageEncoder::new(ack.buf_mut());
        enc.typ(CoapType::Acknowledgment).code(CoapCode::Empty).id(id);
        let size = enc.encode();
        if size > capacity {
            return Err(Error::InsufficientStorage);
        }
        ack.set_length(size);
        channel.send(ack)?;
        Ok(())
    }
}
