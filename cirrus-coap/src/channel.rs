//! Message buffers and the channel they are sent over.
//!
//! A [`Message`] is a fixed-capacity buffer the codec writes into; the
//! channel owns buffer allocation and assigns message ids on send, so
//! callers encode with a placeholder id and read the real one back from
//! the return value of [`MessageChannel::send`].

use cirrus_core::error::{Error, Result};

/// One outgoing or incoming message buffer.
pub struct Message {
    buf: Vec<u8>,
    len: usize,
    id: u16,
}

impl Message {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], len: 0, id: 0 }
    }

    /// The full writable buffer, regardless of the current length.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The encoded bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The full buffer, including any slack past the encoded length.
    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_length(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len.min(self.buf.len());
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn set_id(&mut self, id: u16) {
        self.id = id;
        // Keep the serialized header in sync with the assigned id.
        if self.len >= 4 {
            self.buf[2..4].copy_from_slice(&id.to_be_bytes());
        }
    }
}

/// Transport-facing side of the legacy subscription machinery.
pub trait MessageChannel {
    /// Allocates an empty message buffer.
    fn create(&mut self) -> Result<Message>;

    /// Sends the message, returning its message id.
    ///
    /// A message encoded with the 0 placeholder id gets a fresh id
    /// assigned and serialized; a message carrying a real id (an ACK
    /// echoing its request) is sent as-is.
    fn send(&mut self, msg: Message) -> Result<u16>;

    /// Whether the underlying link needs application-level acknowledgments.
    fn is_unreliable(&self) -> bool;
}

/// In-memory channel that records every sent message.
///
/// Serves tests and local wiring the same way the loopback transport
/// does for the event hub.
pub struct MemoryChannel {
    capacity: usize,
    unreliable: bool,
    next_id: u16,
    sent: Vec<Message>,
}

impl MemoryChannel {
    #[must_use]
    pub fn new(capacity: usize, unreliable: bool) -> Self {
        Self { capacity, unreliable, next_id: 1, sent: Vec::new() }
    }

    /// Messages sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }
}

impl MessageChannel for MemoryChannel {
    fn create(&mut self) -> Result<Message> {
        Ok(Message::with_capacity(self.capacity))
    }

    fn send(&mut self, mut msg: Message) -> Result<u16> {
        if msg.len() < 4 {
            return Err(Error::InvalidArgument);
        }
        let serialized = u16::from_be_bytes([msg.bytes()[2], msg.bytes()[3]]);
        let id = if serialized != 0 {
            serialized
        } else {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            id
        };
        msg.set_id(id);
        self.sent.push(msg);
        Ok(id)
    }

    fn is_unreliable(&self) -> bool {
        self.unreliable
    }
}
