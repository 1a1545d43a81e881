//! Request/reply message framing.
//!
//! Every message starts with a fixed 13-byte header: magic, protocol
//! version, encoding version, message type, and the total message size. The
//! size slot is patched by [`finish_message`] once the body is complete.
//!
//! Reply layout is deliberately rigid: the status byte always sits at
//! [`REPLY_STATUS_OFFSET`], whatever the outcome, so failure paths can
//! truncate back to the slot and rewrite without moving anything upstream.

use crate::{
    CodecError, Context, EncodingVersion, Identity, InputStream, InvocationMode, OutputStream,
    RequestId,
};

pub const MAGIC: [u8; 4] = *b"ERNT";

pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

/// Fixed header: magic (4), protocol version (2), encoding version (2),
/// message type (1), message size (4).
pub const HEADER_SIZE: usize = 13;

/// Offset of the message size `i32` within the header.
pub const SIZE_OFFSET: usize = 9;

/// Offset of the status byte in a reply: right after the header and the
/// request id.
pub const REPLY_STATUS_OFFSET: usize = HEADER_SIZE + 4;

/// Offset of the entry count in a batch request message.
pub const BATCH_COUNT_OFFSET: usize = HEADER_SIZE;

// ============================================================================
// Message type
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    BatchRequest = 1,
    Reply = 2,
}

impl MessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(Self::Request),
            1 => Ok(Self::BatchRequest),
            2 => Ok(Self::Reply),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

// ============================================================================
// Header framing
// ============================================================================

fn write_header(out: &mut OutputStream, message_type: MessageType) {
    out.write_raw(&MAGIC);
    out.write_u8(PROTOCOL_MAJOR);
    out.write_u8(PROTOCOL_MINOR);
    out.write_u8(EncodingVersion::V1_0.major);
    out.write_u8(EncodingVersion::V1_0.minor);
    out.write_u8(message_type.as_u8());
    out.write_i32(0); // size, patched by finish_message
}

/// Start a request message: header plus the request id. The header fields
/// (identity, facet, operation, mode, context, params) follow.
pub fn begin_request(out: &mut OutputStream, request_id: RequestId) {
    write_header(out, MessageType::Request);
    out.write_i32(request_id.raw());
}

/// Start a batch request message: header plus an entry count slot. Entries
/// (request bodies without request ids) follow; the caller patches the count
/// at [`BATCH_COUNT_OFFSET`].
pub fn begin_batch(out: &mut OutputStream) {
    write_header(out, MessageType::BatchRequest);
    out.write_i32(0);
}

/// Start a reply message: header, request id, and a placeholder status byte.
/// Returns the offset of the status slot (always [`REPLY_STATUS_OFFSET`]).
pub fn begin_reply(out: &mut OutputStream, request_id: RequestId) -> usize {
    write_header(out, MessageType::Reply);
    out.write_i32(request_id.raw());
    let status_slot = out.position();
    out.write_u8(0);
    status_slot
}

/// Patch the message size slot with the final length.
pub fn finish_message(out: &mut OutputStream) {
    let size = out.position() as i32;
    out.rewrite_i32(SIZE_OFFSET, size);
}

/// Validate the fixed header and return the message type. The cursor is left
/// just past the header.
pub fn read_message_header(input: &mut InputStream<'_>) -> Result<MessageType, CodecError> {
    let total = input.remaining();
    let magic = input.read_raw(4)?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic.try_into().expect("4-byte slice")));
    }
    let major = input.read_u8()?;
    let minor = input.read_u8()?;
    if major != PROTOCOL_MAJOR {
        return Err(CodecError::UnsupportedProtocol { major, minor });
    }
    let _encoding_major = input.read_u8()?;
    let _encoding_minor = input.read_u8()?;
    let message_type = MessageType::from_u8(input.read_u8()?)?;
    let size = input.read_i32()?;
    if size < HEADER_SIZE as i32 || size as usize != total {
        return Err(CodecError::SizeMismatch {
            declared: size.max(0) as usize,
            actual: total,
        });
    }
    Ok(message_type)
}

// ============================================================================
// Request header
// ============================================================================

/// The decoded front matter of a request: everything before the parameter
/// encapsulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: RequestId,
    pub identity: Identity,
    pub facet: Option<String>,
    pub operation: String,
    pub mode: InvocationMode,
    pub context: Context,
}

impl RequestHeader {
    /// Marshal the header fields that follow the request id. Batch entries
    /// use exactly this encoding, with no request id in front.
    pub fn write_body(
        out: &mut OutputStream,
        identity: &Identity,
        facet: Option<&str>,
        operation: &str,
        mode: InvocationMode,
        context: &Context,
    ) {
        out.write_identity(identity);
        out.write_facet(facet);
        out.write_string(operation);
        out.write_u8(mode.as_u8());
        out.write_context(context);
    }

    /// Decode the header fields that follow the request id, leaving the
    /// cursor at the parameter encapsulation.
    pub fn read_body(
        input: &mut InputStream<'_>,
        request_id: RequestId,
    ) -> Result<Self, CodecError> {
        let identity = input.read_identity()?;
        let facet = input.read_facet()?;
        let operation = input.read_string()?;
        let mode = InvocationMode::from_u8(input.read_u8()?)?;
        let context = input.read_context()?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
        })
    }
}
