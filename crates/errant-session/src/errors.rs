//! The exception taxonomy and its wire-status mapping.
//!
//! Every failure either side of the wire can observe is one variant of
//! [`ErrantError`]. The taxonomy is closed on purpose: the dispatch side maps
//! it to a [`ReplyStatus`] with a single exhaustive match
//! ([`write_reply_error`]), and the client side reconstructs it from a reply
//! with the inverse match ([`decode_reply`]). Nothing downcast-based, nothing
//! open-ended.

use errant_wire::{
    CodecError, EncodingVersion, Identity, InputStream, MessageType, OutputStream, ReplyStatus,
    RequestId, read_message_header,
};

// ============================================================================
// User exceptions
// ============================================================================

/// A declared user exception, carried as an opaque encapsulation body tagged
/// with its type id.
///
/// The body layout is up to the application; the core only needs the type id
/// to validate the exception against an operation's declared set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserError {
    pub type_id: String,
    pub data: Vec<u8>,
}

impl UserError {
    pub fn new(type_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_id: type_id.into(),
            data,
        }
    }
}

/// `{identity, facet, operation}` carried by the three request-failed kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestFailedInfo {
    pub identity: Identity,
    pub facet: Option<String>,
    pub operation: String,
}

impl RequestFailedInfo {
    pub fn new(identity: Identity, facet: Option<String>, operation: impl Into<String>) -> Self {
        Self {
            identity,
            facet,
            operation: operation.into(),
        }
    }

    /// Fill empty fields from `fallback`. Senders historically omitted these
    /// when they matched the request, so both sides backfill from their own
    /// call context.
    fn backfilled(mut self, fallback: &RequestFailedInfo) -> Self {
        if self.identity.is_empty() {
            self.identity = fallback.identity.clone();
        }
        if self.facet.is_none() {
            self.facet = fallback.facet.clone();
        }
        if self.operation.is_empty() {
            self.operation = fallback.operation.clone();
        }
        self
    }
}

impl std::fmt::Display for RequestFailedInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "identity `{}`", self.identity)?;
        if let Some(facet) = &self.facet {
            write!(f, ", facet `{facet}`")?;
        }
        write!(f, ", operation `{}`", self.operation)
    }
}

// ============================================================================
// The taxonomy
// ============================================================================

/// Every classified failure in the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrantError {
    /// A declared user exception raised by the servant (or a locator).
    User(UserError),

    /// No servant is registered under the request's identity.
    ObjectNotExist(RequestFailedInfo),
    /// The identity exists, but not under the requested facet.
    FacetNotExist(RequestFailedInfo),
    /// Servant and facet matched, but the operation is unknown to it.
    OperationNotExist(RequestFailedInfo),

    /// A result-bearing operation was invoked through a reference that
    /// cannot carry a reply. Raised before anything touches the network.
    TwowayOnly { operation: String },

    /// Connection establishment failed. Retryable.
    ConnectFailed(String),
    /// An established connection dropped. Retryable.
    ConnectionLost(String),
    /// A transport-level syscall failed. Retryable.
    Syscall(String),

    /// The invocation deadline elapsed.
    InvocationTimedOut,
    /// The connection-level timeout elapsed.
    ConnectionTimedOut,

    /// The peer violated the protocol. Fatal to the connection.
    Protocol(String),
    /// A message failed to marshal or unmarshal. Fatal to the connection.
    Marshal(String),

    /// The peer reported a local exception we have no closer kind for.
    UnknownLocal(String),
    /// The peer reported a user exception outside the declared set.
    UnknownUser(String),
    /// The peer reported something it could not classify at all.
    Unknown(String),
}

impl ErrantError {
    pub fn object_not_exist(info: RequestFailedInfo) -> Self {
        Self::ObjectNotExist(info)
    }

    pub fn facet_not_exist(info: RequestFailedInfo) -> Self {
        Self::FacetNotExist(info)
    }

    pub fn operation_not_exist(info: RequestFailedInfo) -> Self {
        Self::OperationNotExist(info)
    }

    /// Whether the retry machinery may re-run the invocation after this
    /// failure. Only transient connection-level failures qualify; everything
    /// identity-scoped, timeout-scoped, or protocol-fatal does not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::ConnectionLost(_) | Self::Syscall(_)
        )
    }

    /// Protocol and marshaling failures poison the connection they occurred
    /// on; the handler must not be reused for another attempt.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Marshal(_))
    }

    /// The wire status a dispatch-side classification of this error maps to.
    /// Total: every kind has exactly one status.
    pub fn reply_status(&self) -> ReplyStatus {
        match self {
            Self::User(_) => ReplyStatus::UserException,
            Self::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
            Self::FacetNotExist(_) => ReplyStatus::FacetNotExist,
            Self::OperationNotExist(_) => ReplyStatus::OperationNotExist,
            Self::UnknownUser(_) => ReplyStatus::UnknownUserException,
            Self::Unknown(_) => ReplyStatus::UnknownException,
            // Everything else is a local exception the peer cannot see into.
            Self::TwowayOnly { .. }
            | Self::ConnectFailed(_)
            | Self::ConnectionLost(_)
            | Self::Syscall(_)
            | Self::InvocationTimedOut
            | Self::ConnectionTimedOut
            | Self::Protocol(_)
            | Self::Marshal(_)
            | Self::UnknownLocal(_) => ReplyStatus::UnknownLocalException,
        }
    }
}

impl std::fmt::Display for ErrantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(e) => write!(f, "user exception `{}`", e.type_id),
            Self::ObjectNotExist(info) => write!(f, "object not exist: {info}"),
            Self::FacetNotExist(info) => write!(f, "facet not exist: {info}"),
            Self::OperationNotExist(info) => write!(f, "operation not exist: {info}"),
            Self::TwowayOnly { operation } => {
                write!(f, "operation `{operation}` returns data and requires a twoway reference")
            }
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::Syscall(msg) => write!(f, "syscall error: {msg}"),
            Self::InvocationTimedOut => write!(f, "invocation timed out"),
            Self::ConnectionTimedOut => write!(f, "connection timed out"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Marshal(msg) => write!(f, "marshal error: {msg}"),
            Self::UnknownLocal(msg) => write!(f, "unknown local exception: {msg}"),
            Self::UnknownUser(msg) => write!(f, "unknown user exception: {msg}"),
            Self::Unknown(msg) => write!(f, "unknown exception: {msg}"),
        }
    }
}

impl std::error::Error for ErrantError {}

impl From<CodecError> for ErrantError {
    fn from(e: CodecError) -> Self {
        Self::Marshal(e.to_string())
    }
}

// ============================================================================
// Dispatch-side marshaling
// ============================================================================

/// Rewrite the reply from the status slot with a success payload.
pub(crate) fn write_reply_ok(
    out: &mut OutputStream,
    status_slot: usize,
    encoding: EncodingVersion,
    body: &[u8],
) {
    out.truncate(status_slot);
    out.write_u8(ReplyStatus::Ok.as_u8());
    out.write_encaps(encoding, body);
}

/// Rewrite the reply from the status slot with a classified failure.
///
/// This is the single exhaustive match from error kind to wire status.
/// Truncate-then-rewrite is safe here: nothing past the status slot has been
/// handed to the connection yet.
pub(crate) fn write_reply_error(
    out: &mut OutputStream,
    status_slot: usize,
    encoding: EncodingVersion,
    error: &ErrantError,
    fallback: &RequestFailedInfo,
) {
    out.truncate(status_slot);
    let status = error.reply_status();
    out.write_u8(status.as_u8());
    match error {
        ErrantError::User(user) => {
            out.start_encaps(encoding);
            out.write_string(&user.type_id);
            out.write_raw(&user.data);
            out.end_encaps();
        }
        ErrantError::ObjectNotExist(info)
        | ErrantError::FacetNotExist(info)
        | ErrantError::OperationNotExist(info) => {
            let info = info.clone().backfilled(fallback);
            out.write_identity(&info.identity);
            out.write_facet(info.facet.as_deref());
            out.write_string(&info.operation);
        }
        // The diagnostic text identifies the original kind via Display.
        other => out.write_string(&other.to_string()),
    }
}

// ============================================================================
// Client-side reply classification
// ============================================================================

/// Decode a complete reply message into the invocation's outcome.
///
/// `local` is the caller's own `{identity, facet, operation}`, used to
/// backfill request-failed replies whose sender left the fields empty.
/// `declared` is the operation's declared user exception set: anything
/// outside it is re-wrapped as [`ErrantError::UnknownUser`] carrying the
/// original type id.
pub(crate) fn decode_reply(
    message: &[u8],
    expected_id: RequestId,
    local: &RequestFailedInfo,
    declared: &[String],
) -> Result<Vec<u8>, ErrantError> {
    let mut input = InputStream::new(message);
    let message_type = read_message_header(&mut input)?;
    if message_type != MessageType::Reply {
        return Err(ErrantError::Protocol(format!(
            "expected a reply message, got {message_type:?}"
        )));
    }
    let request_id = RequestId::new(input.read_i32()?);
    if request_id != expected_id {
        return Err(ErrantError::Protocol(format!(
            "reply for {request_id}, expected {expected_id}"
        )));
    }
    let status = ReplyStatus::from_u8(input.read_u8()?)?;
    match status {
        ReplyStatus::Ok => {
            let (_, body) = input.read_encaps()?;
            Ok(body.to_vec())
        }
        ReplyStatus::UserException => {
            let (_, body) = input.read_encaps()?;
            let mut body_input = InputStream::new(body);
            let type_id = body_input.read_string()?;
            let data = body_input.read_raw(body_input.remaining())?.to_vec();
            if declared.iter().any(|declared| *declared == type_id) {
                Err(ErrantError::User(UserError { type_id, data }))
            } else {
                Err(ErrantError::UnknownUser(format!(
                    "undeclared user exception `{type_id}`"
                )))
            }
        }
        ReplyStatus::ObjectNotExist
        | ReplyStatus::FacetNotExist
        | ReplyStatus::OperationNotExist => {
            let identity = input.read_identity()?;
            let facet = input.read_facet()?;
            let operation = input.read_string()?;
            let info = RequestFailedInfo {
                identity,
                facet,
                operation,
            }
            .backfilled(local);
            Err(match status {
                ReplyStatus::ObjectNotExist => ErrantError::ObjectNotExist(info),
                ReplyStatus::FacetNotExist => ErrantError::FacetNotExist(info),
                _ => ErrantError::OperationNotExist(info),
            })
        }
        ReplyStatus::UnknownLocalException => Err(ErrantError::UnknownLocal(input.read_string()?)),
        ReplyStatus::UnknownUserException => Err(ErrantError::UnknownUser(input.read_string()?)),
        ReplyStatus::UnknownException => Err(ErrantError::Unknown(input.read_string()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errant_wire::{REPLY_STATUS_OFFSET, begin_reply, finish_message};

    fn reply_with(error: &ErrantError, fallback: &RequestFailedInfo) -> Vec<u8> {
        let mut out = OutputStream::new();
        let slot = begin_reply(&mut out, RequestId::new(1));
        write_reply_error(&mut out, slot, EncodingVersion::V1_0, error, fallback);
        finish_message(&mut out);
        out.into_bytes()
    }

    fn local_info() -> RequestFailedInfo {
        RequestFailedInfo::new(Identity::named("thing"), None, "poke")
    }

    #[test]
    fn only_connection_failures_are_retryable() {
        assert!(ErrantError::ConnectFailed("refused".into()).is_retryable());
        assert!(ErrantError::ConnectionLost("reset".into()).is_retryable());
        assert!(ErrantError::Syscall("EPIPE".into()).is_retryable());

        assert!(!ErrantError::InvocationTimedOut.is_retryable());
        assert!(!ErrantError::ConnectionTimedOut.is_retryable());
        assert!(!ErrantError::Protocol("bad".into()).is_retryable());
        assert!(!ErrantError::Marshal("bad".into()).is_retryable());
        assert!(!ErrantError::ObjectNotExist(local_info()).is_retryable());
        assert!(!ErrantError::User(UserError::new("::demo::Oops", vec![])).is_retryable());
    }

    #[test]
    fn status_byte_sits_at_the_fixed_offset_on_every_path() {
        let fallback = local_info();
        let cases = [
            ErrantError::User(UserError::new("::demo::Oops", b"xx".to_vec())),
            ErrantError::ObjectNotExist(fallback.clone()),
            ErrantError::Marshal("boom".into()),
            ErrantError::Unknown("???".into()),
        ];
        for error in &cases {
            let bytes = reply_with(error, &fallback);
            assert_eq!(
                bytes[REPLY_STATUS_OFFSET],
                error.reply_status().as_u8(),
                "status byte misplaced for {error}"
            );
        }

        let mut out = OutputStream::new();
        let slot = begin_reply(&mut out, RequestId::new(1));
        write_reply_ok(&mut out, slot, EncodingVersion::V1_0, b"");
        finish_message(&mut out);
        assert_eq!(out.as_slice()[REPLY_STATUS_OFFSET], ReplyStatus::Ok.as_u8());
    }

    #[test]
    fn declared_user_exception_roundtrips() {
        let fallback = local_info();
        let original = UserError::new("::demo::Oops", b"member data".to_vec());
        let bytes = reply_with(&ErrantError::User(original.clone()), &fallback);

        let declared = vec!["::demo::Oops".to_string()];
        let err = decode_reply(&bytes, RequestId::new(1), &fallback, &declared).unwrap_err();
        assert_eq!(err, ErrantError::User(original));
    }

    #[test]
    fn undeclared_user_exception_becomes_unknown_user() {
        let fallback = local_info();
        let bytes = reply_with(
            &ErrantError::User(UserError::new("::demo::Surprise", vec![])),
            &fallback,
        );

        let err = decode_reply(&bytes, RequestId::new(1), &fallback, &[]).unwrap_err();
        match err {
            ErrantError::UnknownUser(msg) => assert!(msg.contains("::demo::Surprise")),
            other => panic!("expected UnknownUser, got {other}"),
        }
    }

    #[test]
    fn request_failed_reply_backfills_empty_fields() {
        let fallback = local_info();
        // Sender with empty identity and operation, the historical optimization.
        let bytes = reply_with(
            &ErrantError::ObjectNotExist(RequestFailedInfo::default()),
            &RequestFailedInfo::default(),
        );

        let err = decode_reply(&bytes, RequestId::new(1), &fallback, &[]).unwrap_err();
        match err {
            ErrantError::ObjectNotExist(info) => {
                assert_eq!(info.identity, Identity::named("thing"));
                assert_eq!(info.operation, "poke");
            }
            other => panic!("expected ObjectNotExist, got {other}"),
        }
    }

    #[test]
    fn mismatched_request_id_is_a_protocol_error() {
        let fallback = local_info();
        let mut out = OutputStream::new();
        let slot = begin_reply(&mut out, RequestId::new(3));
        write_reply_ok(&mut out, slot, EncodingVersion::V1_0, b"");
        finish_message(&mut out);

        let err =
            decode_reply(&out.into_bytes(), RequestId::new(4), &fallback, &[]).unwrap_err();
        assert!(matches!(err, ErrantError::Protocol(_)));
    }
}
