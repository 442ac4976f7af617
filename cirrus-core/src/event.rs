//! Cloud events.
//!
//! An [`Event`] is a cheap, cloneable handle to a shared, reference-counted
//! record: name, content type, lazily created payload, cursor, status and
//! completion callback. Many handles may reference one record; the receive
//! pipeline also creates sibling records that share a single payload.
//!
//! Status state machine:
//!
//! ```text
//! NEW -> SENDING -> {SENT, FAILED} -> (reset) -> NEW
//! NEW -> FAILED
//! any writable state -> INVALID   (terminal)
//! ```
//!
//! The status field is a single atomically-updated byte; the publish
//! completion and user cancellation race through compare-and-swap on it.
//! FAILED records may be corrected and republished; INVALID records must be
//! discarded or `clear()`ed.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::error::{Error, Result};
use crate::payload::{Payload, DEFAULT_MAX_PAYLOAD_IN_RAM, MAX_PAYLOAD_SIZE};
use crate::transport::{RequestId, INVALID_REQUEST_ID};

/// Maximum event name length in bytes.
pub const MAX_EVENT_NAME_LENGTH: usize = 64;

/// Chunk size for streaming file load/save.
const FILE_CHUNK_SIZE: usize = 128;

/// Event lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    New = 0,
    Sending = 1,
    Sent = 2,
    Failed = 3,
    Invalid = 4,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Sending,
            2 => Self::Sent,
            3 => Self::Failed,
            _ => Self::Invalid,
        }
    }
}

/// Event content type; values are the wire content-format IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum ContentType {
    /// Plain text
    #[default]
    Text = 0,
    /// Opaque binary data
    Binary = 42,
    /// Self-describing structured encoding of typed event data
    Structured = 50,
}

impl ContentType {
    /// Map a wire content-format ID onto a content type.
    ///
    /// Unknown formats fall back to `Text`, matching the wire default.
    #[must_use]
    pub fn from_format(fmt: u16) -> Self {
        match fmt {
            42 => Self::Binary,
            50 => Self::Structured,
            _ => Self::Text,
        }
    }

    /// The wire content-format ID for this content type.
    #[must_use]
    pub const fn format(self) -> u16 {
        self as u16
    }
}

/// Status-change callback; runs on the application context.
pub type StatusCallback = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

pub(crate) struct Inner {
    pub(crate) name: Option<String>,
    pub(crate) content_type: ContentType,
    pub(crate) payload: Option<Payload>,
    pub(crate) pos: usize,
    pub(crate) max_in_ram: usize,
    pub(crate) error: Option<Error>,
    pub(crate) request_id: RequestId,
    /// Completion result stashed on the system context, consumed on the
    /// application context.
    pub(crate) send_result: Option<Result<()>>,
    /// Payload size captured when the rate limiter charge was taken.
    pub(crate) in_flight_size: usize,
    pub(crate) on_status_change: Option<StatusCallback>,
}

/// The shared record behind one or more `Event` handles.
pub(crate) struct EventRecord {
    status: AtomicU8,
    pub(crate) inner: Mutex<Inner>,
}

impl EventRecord {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(Status::New as u8),
            inner: Mutex::new(Inner {
                name: None,
                content_type: ContentType::Text,
                payload: None,
                pos: 0,
                max_in_ram: DEFAULT_MAX_PAYLOAD_IN_RAM,
                error: None,
                request_id: INVALID_REQUEST_ID,
                send_result: None,
                in_flight_size: 0,
                on_status_change: None,
            }),
        })
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Transition from whatever the current status is to `new`, recording
    /// `err` and firing the status-change callback.
    pub(crate) fn set_status(self: &Arc<Self>, new: Status, err: Option<Error>) {
        loop {
            let cur = self.status.load(Ordering::Acquire);
            // INVALID is terminal
            if cur == new as u8 || cur == Status::Invalid as u8 {
                return;
            }
            if self
                .status
                .compare_exchange(cur, new as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.after_transition(new, err);
    }

    /// Compare-and-swap transition; returns whether the swap happened.
    ///
    /// This guards the race between user-initiated cancellation and the
    /// naturally-arriving send completion: only the side whose swap wins
    /// releases the rate-limiter charge.
    pub(crate) fn cas_status(
        self: &Arc<Self>,
        expected: Status,
        new: Status,
        err: Option<Error>,
    ) -> bool {
        if expected == new {
            return false;
        }
        if self
            .status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.after_transition(new, err);
        true
    }

    fn after_transition(self: &Arc<Self>, new: Status, err: Option<Error>) {
        // Record the error and grab the callback without holding the lock
        // across user code.
        let callback = {
            let mut inner = self.inner.lock();
            inner.error = err;
            if new == Status::Invalid {
                // Terminal: no further transitions, no further callbacks
                inner.on_status_change.take()
            } else {
                inner.on_status_change.clone()
            }
        };
        if let Some(cb) = callback {
            let event = Event::from_record(Arc::clone(self));
            cb(&event);
        }
    }

    /// Record a recoverable failure and hand the error back to the caller.
    pub(crate) fn set_failed(self: &Arc<Self>, err: Error) -> Error {
        self.set_status(Status::Failed, Some(err.clone()));
        err
    }

    /// Record a terminal failure; the record must be discarded.
    pub(crate) fn set_invalid(self: &Arc<Self>, err: Error) -> Error {
        self.set_status(Status::Invalid, Some(err.clone()));
        err
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.inner.lock().error.clone()
    }
}

/// A named, typed unit of pub/sub data with its own lifecycle.
///
/// `Clone` shares the underlying record; use [`Event::clear`] to detach a
/// handle onto a fresh one.
#[derive(Clone)]
pub struct Event {
    record: Arc<EventRecord>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("size", &self.size())
            .finish()
    }
}

impl Event {
    /// Create an empty event in the NEW state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            record: EventRecord::new(),
        }
    }

    pub(crate) fn from_record(record: Arc<EventRecord>) -> Self {
        Self { record }
    }

    pub(crate) fn record(&self) -> &Arc<EventRecord> {
        &self.record
    }

    /// A record is writable only while it is NEW.
    fn is_writable(&self) -> bool {
        self.status() == Status::New
    }

    /// Readable is broader than writable: a SENDING or SENT payload can
    /// still be inspected. Only INVALID records are unreadable.
    fn is_readable(&self) -> bool {
        self.status() != Status::Invalid
    }

    /// The error to report for an operation on a non-writable record.
    fn not_writable_error(&self) -> Error {
        if let Some(err) = self.record.last_error() {
            return err;
        }
        if self.status() == Status::Sending {
            return Error::Busy;
        }
        Error::InvalidState
    }

    fn not_readable_error(&self) -> Error {
        self.record.last_error().unwrap_or(Error::InvalidState)
    }

    /// Set the event name. No-op unless the record is writable.
    ///
    /// The name is required before publishing; 1..=[`MAX_EVENT_NAME_LENGTH`]
    /// bytes.
    #[must_use]
    pub fn with_name(self, name: &str) -> Self {
        if !self.is_writable() {
            return self;
        }
        if name.is_empty() || name.len() > MAX_EVENT_NAME_LENGTH {
            error!("Invalid event name length");
            let _ = self.record.set_failed(Error::InvalidArgument);
            return self;
        }
        self.record.inner.lock().name = Some(name.to_owned());
        self
    }

    /// The event name, empty when unset.
    #[must_use]
    pub fn name(&self) -> String {
        self.record.inner.lock().name.clone().unwrap_or_default()
    }

    /// Set the content type. No-op unless the record is writable.
    #[must_use]
    pub fn with_content_type(self, content_type: ContentType) -> Self {
        if !self.is_writable() {
            return self;
        }
        self.record.inner.lock().content_type = content_type;
        self
    }

    #[must_use]
    pub fn content_type(&self) -> ContentType {
        self.record.inner.lock().content_type
    }

    /// Replace the payload with `data`; the cursor ends at the full length.
    ///
    /// No-op unless the record is writable.
    #[must_use]
    pub fn with_data(self, data: &[u8]) -> Self {
        if !self.is_writable() {
            return self;
        }
        if let Err(err) = self.overwrite_payload(data) {
            error!("Failed to set event data: {err}");
        }
        self
    }

    fn overwrite_payload(&self, data: &[u8]) -> Result<()> {
        let payload = self.get_or_create_payload()?;
        if let Err(err) = payload.write(0, data) {
            return Err(self.classify_payload_error(err));
        }
        if let Err(err) = payload.set_size(data.len()) {
            return Err(self.classify_payload_error(err));
        }
        self.record.inner.lock().pos = data.len();
        Ok(())
    }

    /// Encode `value` through the structured encoder, replacing the payload
    /// and setting the content type to [`ContentType::Structured`].
    ///
    /// No-op unless the record is writable. Encode failures are terminal.
    #[must_use]
    pub fn with_data_structured<T: Serialize>(self, value: &T) -> Self {
        if !self.is_writable() {
            return self;
        }
        self.record.inner.lock().pos = 0;
        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("Failed to encode event data: {err}");
                let _ = self.record.set_invalid(Error::Encoding(err.to_string()));
                return self;
            }
        };
        if let Err(err) = self.overwrite_payload(&encoded) {
            error!("Failed to set event data: {err}");
            return self;
        }
        self.record.inner.lock().content_type = ContentType::Structured;
        self
    }

    /// Snapshot of the payload bytes; empty if there is nothing to read.
    #[must_use]
    pub fn data(&self) -> Bytes {
        if !self.is_readable() {
            return Bytes::new();
        }
        let payload = self.record.inner.lock().payload.clone();
        payload.map(|p| p.to_bytes()).unwrap_or_default()
    }

    /// The payload interpreted as text.
    #[must_use]
    pub fn data_string(&self) -> String {
        String::from_utf8_lossy(&self.data()).into_owned()
    }

    /// Decode the payload through the structured decoder.
    pub fn data_structured<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_readable() {
            return Err(self.not_readable_error());
        }
        serde_json::from_slice(&self.data()).map_err(|err| {
            error!("Failed to decode event data: {err}");
            Error::Encoding(err.to_string())
        })
    }

    /// Stream the contents of the file at `path` into the payload.
    ///
    /// No-op unless the record is writable. The file handle is closed on
    /// every exit path.
    #[must_use]
    pub fn load_data(self, path: impl AsRef<Path>) -> Self {
        if !self.is_writable() {
            return self;
        }
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                error!("open() failed: {err}");
                let _ = self.record.set_failed(Error::io(&err));
                return self;
            }
        };
        let payload = match self.get_or_create_payload() {
            Ok(payload) => payload,
            Err(_) => return self,
        };
        let mut buf = [0u8; FILE_CHUNK_SIZE];
        let mut offs = 0;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break, // EOF
                Ok(n) => n,
                Err(err) => {
                    error!("read() failed: {err}");
                    let _ = self.record.set_failed(Error::io(&err));
                    return self;
                }
            };
            if let Err(err) = payload.write(offs, &buf[..n]) {
                let err = self.classify_payload_error(err);
                error!("Failed to write event data: {err}");
                return self;
            }
            offs += n;
        }
        if let Err(err) = payload.set_size(offs) {
            let err = self.classify_payload_error(err);
            error!("Failed to set event data size: {err}");
            return self;
        }
        self.record.inner.lock().pos = offs;
        self
    }

    /// Stream the payload into the file at `path`, truncating it.
    pub fn save_data(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.is_readable() {
            return Err(self.not_readable_error());
        }
        let mut file = File::create(path).map_err(|err| {
            error!("open() failed: {err}");
            Error::io(&err)
        })?;
        let payload = self.record.inner.lock().payload.clone();
        if let Some(payload) = payload {
            let mut buf = [0u8; FILE_CHUNK_SIZE];
            let mut offs = 0;
            loop {
                let n = match payload.read(offs, &mut buf) {
                    Ok(n) => n,
                    Err(Error::EndOfStream) => break,
                    Err(err) => return Err(err),
                };
                file.write_all(&buf[..n]).map_err(|err| {
                    error!("write() failed: {err}");
                    Error::io(&err)
                })?;
                offs += n;
            }
        }
        file.sync_all().map_err(|err| {
            error!("close() failed: {err}");
            Error::io(&err)
        })?;
        Ok(())
    }

    /// Resize the payload; the cursor is clamped to the new size.
    pub fn set_size(&self, size: usize) -> Result<()> {
        if !self.is_writable() {
            return Err(self.not_writable_error());
        }
        let payload = self.get_or_create_payload()?;
        if let Err(err) = payload.set_size(size) {
            return Err(self.classify_payload_error(err));
        }
        let mut inner = self.record.inner.lock();
        if inner.pos > size {
            inner.pos = size;
        }
        Ok(())
    }

    /// Payload size in bytes, 0 when there is no payload.
    #[must_use]
    pub fn size(&self) -> usize {
        if !self.is_readable() {
            return 0;
        }
        let inner = self.record.inner.lock();
        inner.payload.as_ref().map_or(0, Payload::size)
    }

    /// Move the cursor, clamped to the payload size; returns the new
    /// position. The cursor is shared between reads and writes, so this
    /// uses the least restrictive status check.
    pub fn seek(&self, pos: usize) -> Result<usize> {
        if !self.is_readable() {
            return Err(self.not_readable_error());
        }
        let mut inner = self.record.inner.lock();
        let size = inner.payload.as_ref().map_or(0, Payload::size);
        inner.pos = pos.min(size);
        Ok(inner.pos)
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        if !self.is_readable() {
            return 0;
        }
        self.record.inner.lock().pos
    }

    /// Bytes remaining after the cursor.
    #[must_use]
    pub fn available(&self) -> usize {
        if !self.is_readable() {
            return 0;
        }
        let inner = self.record.inner.lock();
        let size = inner.payload.as_ref().map_or(0, Payload::size);
        size.saturating_sub(inner.pos)
    }

    /// Read from the cursor, advancing it.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        let n = self.peek(out)?;
        self.record.inner.lock().pos += n;
        Ok(n)
    }

    /// Read from the cursor without advancing it.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize> {
        if !self.is_readable() {
            return Err(self.not_readable_error());
        }
        let (payload, pos) = {
            let inner = self.record.inner.lock();
            (inner.payload.clone(), inner.pos)
        };
        let Some(payload) = payload else {
            if out.is_empty() {
                return Ok(0);
            }
            return Err(Error::EndOfStream);
        };
        payload.read(pos, out)
    }

    /// Write at the cursor, advancing it.
    ///
    /// Fails with `Busy` while the event is SENDING and `InvalidState` in
    /// any other non-writable state.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.is_writable() {
            return Err(self.not_writable_error());
        }
        let payload = self.get_or_create_payload()?;
        let pos = self.record.inner.lock().pos;
        let n = match payload.write(pos, data) {
            Ok(n) => n,
            Err(err) => return Err(self.classify_payload_error(err)),
        };
        self.record.inner.lock().pos += n;
        Ok(n)
    }

    /// Bound the in-memory staging size of a payload that has not been
    /// created yet. No-op once the payload exists.
    #[must_use]
    pub fn with_max_data_in_ram(self, size: usize) -> Self {
        if !self.is_writable() {
            return self;
        }
        let mut inner = self.record.inner.lock();
        if inner.payload.is_none() {
            inner.max_in_ram = size.min(MAX_PAYLOAD_SIZE);
        }
        drop(inner);
        self
    }

    #[must_use]
    pub fn max_data_in_ram(&self) -> usize {
        self.record.inner.lock().max_in_ram
    }

    /// Install the status-change callback.
    ///
    /// Invoked on every status transition except the explicit
    /// [`Event::reset_status`]. No-op unless the record is writable.
    #[must_use]
    pub fn on_status_change(self, callback: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        if !self.is_writable() {
            return self;
        }
        self.record.inner.lock().on_status_change = Some(Arc::new(callback));
        self
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.record.status()
    }

    /// The last recorded error; meaningful in FAILED and INVALID.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.record.last_error()
    }

    /// Reset a SENT or FAILED record back to NEW so it can be corrected and
    /// republished. Does not invoke the status-change callback.
    pub fn reset_status(&self) {
        let cur = self.status();
        if cur != Status::Sent && cur != Status::Failed {
            return;
        }
        self.record.inner.lock().error = None;
        // Update the status without invoking the status change callback
        let _ = self.record.status.compare_exchange(
            cur as u8,
            Status::New as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Detach this handle onto a fresh, empty record.
    pub fn clear(&mut self) {
        self.record = EventRecord::new();
    }

    /// Lazily create the payload; it is never replaced afterwards.
    fn get_or_create_payload(&self) -> Result<Payload> {
        let mut inner = self.record.inner.lock();
        if let Some(payload) = &inner.payload {
            return Ok(payload.clone());
        }
        let payload = Payload::new(inner.max_in_ram);
        inner.payload = Some(payload.clone());
        Ok(payload)
    }

    /// Capacity errors leave the record recoverable; anything else puts the
    /// payload in an indeterminate state and is terminal.
    fn classify_payload_error(&self, err: Error) -> Error {
        match err {
            Error::PayloadTooLarge { .. } => {
                error!("Event data is too large");
                self.record.set_failed(err)
            }
            err => self.record.set_invalid(err),
        }
    }
}
