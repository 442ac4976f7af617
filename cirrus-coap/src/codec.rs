//! Constrained binary message codec (RFC 7252 framing).
//!
//! Messages are encoded into caller-provided buffers; the encoder keeps
//! counting past the end of a too-small buffer so the caller learns the
//! required size from [`CoapMessageEncoder::encode`] and can retry or bail.
//! The decoder borrows the input and validates the whole option list up
//! front, so iteration never fails afterwards.

use thiserror::Error;

/// Recognized option numbers.
pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const URI_QUERY: u16 = 15;
    pub const NO_RESPONSE: u16 = 258;
}

/// Recognized content format identifiers.
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const OCTET_STREAM: u16 = 42;
    pub const STRUCTURED: u16 = 50;
}

/// Whether a content format identifier names a textual encoding.
///
/// Structured payloads are not textual: handlers opt into them with an
/// explicit flag instead.
#[must_use]
pub fn is_text_content_format(format: u16) -> bool {
    format == content_format::TEXT_PLAIN
}

const VERSION: u8 = 1;
const MAX_TOKEN_LENGTH: usize = 8;
const PAYLOAD_MARKER: u8 = 0xFF;

/// Message type from the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoapType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgment = 2,
    Reset = 3,
}

impl CoapType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgment,
            _ => Self::Reset,
        }
    }
}

/// Request/response code from the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoapCode {
    Empty = 0x00,
    Get = 0x01,
    Post = 0x02,
}

impl CoapCode {
    /// Returns `None` for codes this crate does not handle.
    #[must_use]
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Empty),
            0x01 => Some(Self::Get),
            0x02 => Some(Self::Post),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapError {
    #[error("Truncated message")]
    Incomplete,
    #[error("Unsupported protocol version")]
    Version,
    #[error("Malformed option list")]
    Option,
    #[error("Protocol violation")]
    Protocol,
}

/// Writes one message into a fixed buffer.
///
/// Header fields may be set in any order before the first option or
/// payload call. Options must be added in non-decreasing number order.
pub struct CoapMessageEncoder<'a> {
    buf: &'a mut [u8],
    needed: usize,
    typ: CoapType,
    code: CoapCode,
    id: u16,
    token: [u8; MAX_TOKEN_LENGTH],
    token_len: usize,
    header_written: bool,
    last_option: u16,
}

impl<'a> CoapMessageEncoder<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            needed: 0,
            typ: CoapType::NonConfirmable,
            code: CoapCode::Empty,
            id: 0,
            token: [0; MAX_TOKEN_LENGTH],
            token_len: 0,
            header_written: false,
            last_option: 0,
        }
    }

    pub fn typ(&mut self, typ: CoapType) -> &mut Self {
        debug_assert!(!self.header_written);
        self.typ = typ;
        self
    }

    pub fn code(&mut self, code: CoapCode) -> &mut Self {
        debug_assert!(!self.header_written);
        self.code = code;
        self
    }

    pub fn id(&mut self, id: u16) -> &mut Self {
        debug_assert!(!self.header_written);
        self.id = id;
        self
    }

    pub fn token(&mut self, token: &[u8]) -> &mut Self {
        debug_assert!(!self.header_written);
        debug_assert!(token.len() <= MAX_TOKEN_LENGTH);
        let len = token.len().min(MAX_TOKEN_LENGTH);
        self.token[..len].copy_from_slice(&token[..len]);
        self.token_len = len;
        self
    }

    pub fn option(&mut self, number: u16, value: &[u8]) -> &mut Self {
        self.flush_header();
        debug_assert!(number >= self.last_option);
        let delta = number.saturating_sub(self.last_option);
        self.last_option = number;
        let (delta_nibble, delta_ext) = Self::split_field(delta as usize);
        let (len_nibble, len_ext) = Self::split_field(value.len());
        self.put_byte((delta_nibble << 4) | len_nibble);
        self.put_ext(delta_ext);
        self.put_ext(len_ext);
        self.put_slice(value);
        self
    }

    /// Adds an option with a minimally encoded unsigned value.
    pub fn option_uint(&mut self, number: u16, value: u32) -> &mut Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.option(number, &bytes[skip..])
    }

    pub fn payload(&mut self, data: &[u8]) -> &mut Self {
        self.flush_header();
        if !data.is_empty() {
            self.put_byte(PAYLOAD_MARKER);
            self.put_slice(data);
        }
        self
    }

    /// Finishes the message and returns the total size in bytes.
    ///
    /// The returned size may exceed the buffer length; in that case only
    /// the leading portion was written and the message must not be sent.
    pub fn encode(mut self) -> usize {
        self.flush_header();
        self.needed
    }

    fn flush_header(&mut self) {
        if self.header_written {
            return;
        }
        self.header_written = true;
        let byte0 =
            (VERSION << 6) | ((self.typ as u8) << 4) | (self.token_len as u8);
        self.put_byte(byte0);
        self.put_byte(self.code as u8);
        let id = self.id.to_be_bytes();
        self.put_slice(&id);
        let token = self.token;
        self.put_slice(&token[..self.token_len]);
    }

    // Splits an option delta or length into its nibble and extended bytes.
    fn split_field(value: usize) -> (u8, ExtField) {
        if value < 13 {
            (value as u8, ExtField::None)
        } else if value < 269 {
            (13, ExtField::One((value - 13) as u8))
        } else {
            (14, ExtField::Two((value - 269) as u16))
        }
    }

    fn put_ext(&mut self, ext: ExtField) {
        match ext {
            ExtField::None => {}
            ExtField::One(b) => self.put_byte(b),
            ExtField::Two(v) => {
                let bytes = v.to_be_bytes();
                self.put_slice(&bytes);
            }
        }
    }

    fn put_byte(&mut self, b: u8) {
        if self.needed < self.buf.len() {
            self.buf[self.needed] = b;
        }
        self.needed += 1;
    }

    fn put_slice(&mut self, data: &[u8]) {
        for &b in data {
            self.put_byte(b);
        }
    }
}

#[derive(Clone, Copy)]
enum ExtField {
    None,
    One(u8),
    Two(u16),
}

/// Borrowed view over one decoded message.
#[derive(Debug)]
pub struct CoapMessageDecoder<'a> {
    buf: &'a [u8],
    typ: CoapType,
    code: u8,
    id: u16,
    token: &'a [u8],
    options: &'a [u8],
    payload_offset: usize,
    payload_len: usize,
}

impl<'a> CoapMessageDecoder<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, CoapError> {
        if buf.len() < 4 {
            return Err(CoapError::Incomplete);
        }
        if buf[0] >> 6 != VERSION {
            return Err(CoapError::Version);
        }
        let typ = CoapType::from_bits(buf[0] >> 4);
        let token_len = (buf[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LENGTH {
            return Err(CoapError::Protocol);
        }
        let code = buf[1];
        let id = u16::from_be_bytes([buf[2], buf[3]]);
        let mut pos = 4;
        if buf.len() < pos + token_len {
            return Err(CoapError::Incomplete);
        }
        let token = &buf[pos..pos + token_len];
        pos += token_len;

        let options_start = pos;
        let mut payload_offset = buf.len();
        let mut payload_len = 0;
        while pos < buf.len() {
            if buf[pos] == PAYLOAD_MARKER {
                // A marker with no payload behind it is a protocol error.
                if pos + 1 >= buf.len() {
                    return Err(CoapError::Protocol);
                }
                payload_offset = pos + 1;
                payload_len = buf.len() - payload_offset;
                break;
            }
            pos = Self::skip_option(buf, pos)?;
        }
        let options_end = if payload_len > 0 { payload_offset - 1 } else { buf.len() };
        Ok(Self {
            buf,
            typ,
            code,
            id,
            token,
            options: &buf[options_start..options_end],
            payload_offset,
            payload_len,
        })
    }

    #[must_use]
    pub fn typ(&self) -> CoapType {
        self.typ
    }

    #[must_use]
    pub fn code(&self) -> u8 {
        self.code
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn token(&self) -> &'a [u8] {
        self.token
    }

    /// Iterates the validated option list.
    #[must_use]
    pub fn options(&self) -> OptionIter<'a> {
        OptionIter { buf: self.options, pos: 0, number: 0 }
    }

    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.payload_offset..self.payload_offset + self.payload_len]
    }

    /// Byte offset of the payload within the decoded buffer.
    ///
    /// Together with [`payload_size`](Self::payload_size) this lets a
    /// caller that owns the buffer rewrite the payload in place.
    #[must_use]
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload_len
    }

    // Validates one option and returns the offset past it.
    fn skip_option(buf: &[u8], pos: usize) -> Result<usize, CoapError> {
        let byte = buf[pos];
        let mut pos = pos + 1;
        let (_, adv) = Self::parse_field(buf, pos, byte >> 4)?;
        pos = adv;
        let (len, adv) = Self::parse_field(buf, pos, byte & 0x0F)?;
        pos = adv;
        if buf.len() < pos + len as usize {
            return Err(CoapError::Incomplete);
        }
        Ok(pos + len as usize)
    }

    fn parse_field(
        buf: &[u8],
        pos: usize,
        nibble: u8,
    ) -> Result<(u16, usize), CoapError> {
        match nibble {
            0..=12 => Ok((u16::from(nibble), pos)),
            13 => {
                let b = *buf.get(pos).ok_or(CoapError::Incomplete)?;
                Ok((u16::from(b) + 13, pos + 1))
            }
            14 => {
                if buf.len() < pos + 2 {
                    return Err(CoapError::Incomplete);
                }
                let v = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
                Ok((v.checked_add(269).ok_or(CoapError::Option)?, pos + 2))
            }
            _ => Err(CoapError::Option),
        }
    }
}

/// One decoded option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapOpt<'a> {
    pub number: u16,
    pub value: &'a [u8],
}

impl CoapOpt<'_> {
    /// Interprets the value as a big-endian unsigned integer.
    #[must_use]
    pub fn to_uint(&self) -> u32 {
        self.value
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
    }
}

/// Iterator over the options of a decoded message.
pub struct OptionIter<'a> {
    buf: &'a [u8],
    pos: usize,
    number: u16,
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = CoapOpt<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        // The span was validated during decode, so parsing cannot fail.
        let byte = self.buf[self.pos];
        self.pos += 1;
        let (delta, adv) =
            CoapMessageDecoder::parse_field(self.buf, self.pos, byte >> 4).ok()?;
        self.pos = adv;
        let (len, adv) =
            CoapMessageDecoder::parse_field(self.buf, self.pos, byte & 0x0F).ok()?;
        self.pos = adv;
        self.number += delta;
        let value = &self.buf[self.pos..self.pos + len as usize];
        self.pos += len as usize;
        Some(CoapOpt { number: self.number, value })
    }
}
