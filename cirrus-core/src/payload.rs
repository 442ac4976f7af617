//! Shared event payload buffer.
//!
//! A payload is a reference-counted byte buffer with a narrow
//! read/write/size contract. It is created lazily by the owning event record
//! on the first write or size change and, once created, is never replaced
//! for the life of the record; sibling events produced by the receive
//! pipeline's fan-out all reference the same payload object.
//!
//! Reads take an explicit offset and writes may extend the buffer up to the
//! hard cap ([`MAX_PAYLOAD_SIZE`]); an interior lock makes concurrent
//! read-while-write safe across the two execution contexts.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Hard cap for a single event payload.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Default in-memory staging hint for a new payload.
pub const DEFAULT_MAX_PAYLOAD_IN_RAM: usize = crate::backpressure::BLOCK_SIZE;

#[derive(Debug)]
struct Shared {
    buf: Mutex<BytesMut>,
}

/// Reference-counted payload handle; `Clone` shares the same bytes.
#[derive(Debug, Clone)]
pub struct Payload {
    shared: Arc<Shared>,
}

impl Payload {
    /// Create an empty payload with an initial capacity hint.
    ///
    /// The hint bounds how much is preallocated, not how much the payload
    /// can hold; the hard cap is [`MAX_PAYLOAD_SIZE`].
    #[must_use]
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buf: Mutex::new(BytesMut::with_capacity(capacity_hint.min(MAX_PAYLOAD_SIZE))),
            }),
        }
    }

    /// Create a payload holding `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let payload = Self::new(data.len());
        payload.write(0, data)?;
        Ok(payload)
    }

    /// Write `data` at `pos`, extending the payload as needed.
    ///
    /// Returns the number of bytes written. Writes that would grow the
    /// payload past [`MAX_PAYLOAD_SIZE`] fail with `PayloadTooLarge` and
    /// leave the payload unchanged.
    pub fn write(&self, pos: usize, data: &[u8]) -> Result<usize> {
        let end = pos
            .checked_add(data.len())
            .ok_or(Error::InvalidArgument)?;
        if end > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: end,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut buf = self.shared.buf.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[pos..end].copy_from_slice(data);
        Ok(data.len())
    }

    /// Read up to `out.len()` bytes starting at `pos`.
    ///
    /// Returns the number of bytes read, or `EndOfStream` when `pos` is at
    /// or past the end and at least one byte was requested.
    pub fn read(&self, pos: usize, out: &mut [u8]) -> Result<usize> {
        let buf = self.shared.buf.lock();
        if pos >= buf.len() {
            if out.is_empty() {
                return Ok(0);
            }
            return Err(Error::EndOfStream);
        }
        let n = out.len().min(buf.len() - pos);
        out[..n].copy_from_slice(&buf[pos..pos + n]);
        Ok(n)
    }

    /// Truncate or zero-extend the payload to `size` bytes.
    pub fn set_size(&self, size: usize) -> Result<()> {
        if size > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut buf = self.shared.buf.lock();
        buf.resize(size, 0);
        Ok(())
    }

    /// Current payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.buf.lock().len()
    }

    /// Snapshot of the whole payload.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let buf = self.shared.buf.lock();
        Bytes::copy_from_slice(&buf)
    }
}
