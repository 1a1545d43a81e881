#![deny(unsafe_code)]

//! Wire-level types for the errant request/reply protocol.
//!
//! This crate defines the vocabulary shared by both sides of a connection:
//! identities, invocation modes, reply status bytes, the stream codec
//! ([`OutputStream`]/[`InputStream`]), and the request/reply message framing.
//! Everything above the byte level (retries, dispatch, servants) lives in
//! `errant-session`.

use std::collections::BTreeMap;

mod message;
mod stream;

pub use message::{
    BATCH_COUNT_OFFSET, HEADER_SIZE, MAGIC, MessageType, PROTOCOL_MAJOR, PROTOCOL_MINOR,
    REPLY_STATUS_OFFSET, RequestHeader, SIZE_OFFSET, begin_batch, begin_reply, begin_request,
    finish_message, read_message_header,
};
pub use stream::{CodecError, InputStream, OutputStream};

/// Request context: ordered key/value pairs carried with every invocation.
pub type Context = BTreeMap<String, String>;

// ============================================================================
// Identity
// ============================================================================

/// Names a servant within an adapter's registry.
///
/// The `category` groups identities for locator lookup; it is empty for
/// uncategorized objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// An identity with an empty category.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }

    /// True when both fields are empty, the wire encoding of "absent".
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.category.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

// ============================================================================
// Request ID
// ============================================================================

/// Identifies an in-flight request within a connection.
///
/// Request id 0 is reserved: it marks requests that expect no reply
/// (oneway, datagram, and batched invocations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct RequestId(pub i32);

impl RequestId {
    /// The reserved "no reply expected" id.
    pub const NONE: Self = Self(0);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<i32> for RequestId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

// ============================================================================
// Invocation mode
// ============================================================================

/// How a request is delivered, and whether a reply is expected.
///
/// The mode byte travels on the wire inside every request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InvocationMode {
    #[default]
    Twoway = 0,
    Oneway = 1,
    BatchOneway = 2,
    Datagram = 3,
    BatchDatagram = 4,
}

impl InvocationMode {
    /// Only twoway invocations produce a reply.
    pub const fn expects_response(self) -> bool {
        matches!(self, Self::Twoway)
    }

    /// Batch modes accumulate in a queue instead of being sent directly.
    pub const fn is_batch(self) -> bool {
        matches!(self, Self::BatchOneway | Self::BatchDatagram)
    }

    pub const fn is_datagram(self) -> bool {
        matches!(self, Self::Datagram | Self::BatchDatagram)
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(Self::Twoway),
            1 => Ok(Self::Oneway),
            2 => Ok(Self::BatchOneway),
            3 => Ok(Self::Datagram),
            4 => Ok(Self::BatchDatagram),
            other => Err(CodecError::UnknownMode(other)),
        }
    }
}

impl std::fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Twoway => "twoway",
            Self::Oneway => "oneway",
            Self::BatchOneway => "batch-oneway",
            Self::Datagram => "datagram",
            Self::BatchDatagram => "batch-datagram",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Reply status
// ============================================================================

/// The single byte classifying a reply.
///
/// Always written at [`REPLY_STATUS_OFFSET`], on every reply, success or
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(Self::Ok),
            1 => Ok(Self::UserException),
            2 => Ok(Self::ObjectNotExist),
            3 => Ok(Self::FacetNotExist),
            4 => Ok(Self::OperationNotExist),
            5 => Ok(Self::UnknownLocalException),
            6 => Ok(Self::UnknownUserException),
            7 => Ok(Self::UnknownException),
            other => Err(CodecError::UnknownReplyStatus(other)),
        }
    }

    /// The three request-failed statuses carry `{identity, facet, operation}`
    /// instead of an encapsulation.
    pub const fn is_request_failed(self) -> bool {
        matches!(
            self,
            Self::ObjectNotExist | Self::FacetNotExist | Self::OperationNotExist
        )
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::UserException => "user exception",
            Self::ObjectNotExist => "object not exist",
            Self::FacetNotExist => "facet not exist",
            Self::OperationNotExist => "operation not exist",
            Self::UnknownLocalException => "unknown local exception",
            Self::UnknownUserException => "unknown user exception",
            Self::UnknownException => "unknown exception",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Encoding version
// ============================================================================

/// Version of the encapsulation encoding, carried in every encapsulation
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl EncodingVersion {
    pub const V1_0: Self = Self { major: 1, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self::V1_0
    }
}

impl std::fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
