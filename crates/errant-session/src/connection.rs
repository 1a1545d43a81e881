//! Collaborator contracts: the connection and the connector that produces
//! them.
//!
//! A [`Connection`] moves complete framed messages. It reports per-request
//! progress asynchronously through the [`InvocationCompletion`] handed to it
//! with each send: `sent`, `completed`, `failed`, or `retry`, from whatever
//! task its I/O runs on. The invocation core never sees transport bytes move.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use errant_wire::RequestId;

use crate::{ErrantError, InvocationCompletion, ProxyReference};

/// Whether a send finished before `send_request` returned.
///
/// An immediate completion matters for the no-response modes: the invocation
/// is already terminal at that point and never waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Completed,
    Pending,
}

/// One framed request handed to a connection, plus the completion monitor
/// the connection reports progress to.
pub struct OutgoingRequest {
    /// `RequestId::NONE` when no reply is expected.
    pub request_id: RequestId,
    /// The complete framed message, header included. Cheap to clone for
    /// connections that both queue and trace it.
    pub message: Bytes,
    pub expects_response: bool,
    pub completion: Arc<InvocationCompletion>,
}

/// A live connection able to carry framed requests.
pub trait Connection: Send + Sync + 'static {
    /// Hand a request to the connection. `Ok(Completed)` means the bytes are
    /// fully out; `Ok(Pending)` means completion will be reported through
    /// the request's monitor.
    fn send_request(&self, request: OutgoingRequest) -> Result<SendStatus, ErrantError>;

    /// Best-effort abort of one outstanding request, without closing the
    /// connection. Advisory: a reply that races the cancellation wins.
    fn cancel(&self, request_id: RequestId, reason: ErrantError);

    /// The connection-level timeout, if one is configured. Consulted by
    /// invocations whose timeout defers to the connection.
    fn timeout(&self) -> Option<Duration>;
}

/// Resolves a proxy reference to a live connection, establishing one if
/// needed. Failures surface as retryable connection-level kinds.
pub trait Connector: Send + Sync + 'static {
    fn resolve(
        &self,
        reference: &ProxyReference,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, ErrantError>> + Send + '_>>;
}
