//! The byte-stream codec: [`OutputStream`] for marshaling, [`InputStream`]
//! for unmarshaling.
//!
//! Integers are little-endian. Sizes use a compact encoding: one byte for
//! values below 255, otherwise a 255 marker followed by a full `i32`.
//! Encapsulations are the exception: their size slot is a fixed-width `i32`
//! so it can be patched once the body length is known.

use std::collections::BTreeMap;

use crate::{Context, EncodingVersion, Identity};

/// Marker byte for sizes that do not fit in a single byte.
const SIZE_MARKER: u8 = 255;

/// Bytes occupied by an encapsulation header: size `i32`, encoding major and
/// minor, format byte.
pub(crate) const ENCAPS_HEADER_SIZE: usize = 7;

// ============================================================================
// Codec error
// ============================================================================

/// A marshaling or unmarshaling failure.
///
/// Codec errors are fatal to the message (and, for header failures, to the
/// connection); they are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Ran off the end of the buffer.
    Truncated { needed: usize, remaining: usize },
    /// A size field was negative or pointed past the end of the buffer.
    InvalidSize(i64),
    /// A string was not valid UTF-8.
    InvalidUtf8,
    /// Message did not start with the protocol magic.
    BadMagic([u8; 4]),
    /// Protocol version in the header is not supported.
    UnsupportedProtocol { major: u8, minor: u8 },
    /// Unknown message type byte.
    UnknownMessageType(u8),
    /// The legacy facet path had more than one element.
    InvalidFacetPath(usize),
    /// Unknown invocation mode byte.
    UnknownMode(u8),
    /// Unknown reply status byte.
    UnknownReplyStatus(u8),
    /// The declared message size disagrees with the buffer.
    SizeMismatch { declared: usize, actual: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, remaining } => {
                write!(f, "truncated stream: needed {needed} bytes, {remaining} remaining")
            }
            Self::InvalidSize(size) => write!(f, "invalid size: {size}"),
            Self::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            Self::BadMagic(bytes) => write!(f, "bad message magic: {bytes:?}"),
            Self::UnsupportedProtocol { major, minor } => {
                write!(f, "unsupported protocol version {major}.{minor}")
            }
            Self::UnknownMessageType(byte) => write!(f, "unknown message type {byte}"),
            Self::InvalidFacetPath(len) => {
                write!(f, "facet path has {len} elements, at most 1 allowed")
            }
            Self::UnknownMode(byte) => write!(f, "unknown invocation mode {byte}"),
            Self::UnknownReplyStatus(byte) => write!(f, "unknown reply status {byte}"),
            Self::SizeMismatch { declared, actual } => {
                write!(f, "message size {declared} does not match buffer length {actual}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

// ============================================================================
// OutputStream
// ============================================================================

/// An append-only marshaling buffer with support for nested encapsulations
/// and in-place patching.
///
/// Patching exists for two call sites: the message size slot, filled once the
/// whole message has been written, and the reply buffer, which is truncated
/// back to the status slot and rewritten when a dispatch fails after the
/// success path already started writing.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: Vec<u8>,
    encaps: Vec<usize>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything at and after `pos`. Safe only while nothing past `pos`
    /// has been handed to a connection.
    pub fn truncate(&mut self, pos: usize) {
        self.buf.truncate(pos);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.encaps.is_empty(), "unclosed encapsulation");
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a previously written `i32` slot.
    pub fn rewrite_i32(&mut self, pos: usize, value: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_size(&mut self, size: usize) {
        if size < SIZE_MARKER as usize {
            self.buf.push(size as u8);
        } else {
            self.buf.push(SIZE_MARKER);
            self.write_i32(size as i32);
        }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_size(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_string_seq(&mut self, values: &[String]) {
        self.write_size(values.len());
        for value in values {
            self.write_string(value);
        }
    }

    pub fn write_identity(&mut self, identity: &Identity) {
        self.write_string(&identity.name);
        self.write_string(&identity.category);
    }

    /// The facet travels as a legacy string sequence of length zero or one.
    pub fn write_facet(&mut self, facet: Option<&str>) {
        match facet {
            Some(facet) if !facet.is_empty() => {
                self.write_size(1);
                self.write_string(facet);
            }
            _ => self.write_size(0),
        }
    }

    pub fn write_context(&mut self, context: &Context) {
        self.write_size(context.len());
        for (key, value) in context {
            self.write_string(key);
            self.write_string(value);
        }
    }

    /// Open an encapsulation: a fixed-width size slot, the encoding version,
    /// and a format byte. Closed by [`end_encaps`](Self::end_encaps), which
    /// patches the size slot.
    pub fn start_encaps(&mut self, encoding: EncodingVersion) {
        self.encaps.push(self.buf.len());
        self.write_i32(0);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        self.write_u8(0); // format byte
    }

    pub fn end_encaps(&mut self) {
        let start = self.encaps.pop().expect("end_encaps without start_encaps");
        let size = (self.buf.len() - start) as i32;
        self.rewrite_i32(start, size);
    }

    /// An encapsulation with no body, used by void replies and parameterless
    /// requests.
    pub fn write_empty_encaps(&mut self, encoding: EncodingVersion) {
        self.start_encaps(encoding);
        self.end_encaps();
    }

    /// An encapsulation whose body was marshaled elsewhere.
    pub fn write_encaps(&mut self, encoding: EncodingVersion, body: &[u8]) {
        self.start_encaps(encoding);
        self.write_raw(body);
        self.end_encaps();
    }
}

// ============================================================================
// InputStream
// ============================================================================

/// A cursor over a received message.
///
/// The cursor is explicit ([`position`](Self::position) /
/// [`set_position`](Self::set_position)) so a dispatch can be rewound and
/// redone.
#[derive(Debug)]
pub struct InputStream<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> InputStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        debug_assert!(pos <= self.buf.len());
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < count {
            return Err(CodecError::Truncated {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub fn read_size(&mut self) -> Result<usize, CodecError> {
        let first = self.read_u8()?;
        if first < SIZE_MARKER {
            return Ok(first as usize);
        }
        let size = self.read_i32()?;
        if size < 0 {
            return Err(CodecError::InvalidSize(size as i64));
        }
        Ok(size as usize)
    }

    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        self.take(count)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_size()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_identity(&mut self) -> Result<Identity, CodecError> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        Ok(Identity { name, category })
    }

    /// Reads the legacy facet path and normalizes it to `Option<String>`.
    /// Paths longer than one element are a marshaling error.
    pub fn read_facet(&mut self) -> Result<Option<String>, CodecError> {
        let len = self.read_size()?;
        match len {
            0 => Ok(None),
            1 => {
                let facet = self.read_string()?;
                Ok(if facet.is_empty() { None } else { Some(facet) })
            }
            len => Err(CodecError::InvalidFacetPath(len)),
        }
    }

    pub fn read_context(&mut self) -> Result<Context, CodecError> {
        let len = self.read_size()?;
        let mut context = BTreeMap::new();
        for _ in 0..len {
            let key = self.read_string()?;
            let value = self.read_string()?;
            context.insert(key, value);
        }
        Ok(context)
    }

    fn read_encaps_size(&mut self) -> Result<usize, CodecError> {
        let size = self.read_i32()?;
        if size < ENCAPS_HEADER_SIZE as i32 {
            return Err(CodecError::InvalidSize(size as i64));
        }
        let size = size as usize;
        if size - 4 > self.remaining() {
            return Err(CodecError::Truncated {
                needed: size - 4,
                remaining: self.remaining(),
            });
        }
        Ok(size)
    }

    /// Reads an encapsulation header, leaving the cursor at the body start.
    /// Returns the encoding and the position just past the body.
    pub fn start_encaps(&mut self) -> Result<(EncodingVersion, usize), CodecError> {
        let start = self.pos;
        let size = self.read_encaps_size()?;
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        let _format = self.read_u8()?;
        Ok((EncodingVersion::new(major, minor), start + size))
    }

    /// Reads a whole encapsulation, returning its encoding and body bytes.
    pub fn read_encaps(&mut self) -> Result<(EncodingVersion, &'a [u8]), CodecError> {
        let (encoding, end) = self.start_encaps()?;
        let body = self.take(end - self.pos)?;
        Ok((encoding, body))
    }

    /// Skips an encapsulation without decoding its body. Required between
    /// entries of a batch stream when a dispatch fails before consuming its
    /// parameters.
    pub fn skip_encaps(&mut self) -> Result<EncodingVersion, CodecError> {
        let (encoding, end) = self.start_encaps()?;
        self.pos = end;
        Ok(encoding)
    }
}
