//! The client-side invocation state machine.
//!
//! One [`Invocation`] drives exactly one logical call: marshal, acquire a
//! request handler, hand the bytes to the connection, await completion,
//! retry transient failures, and honor the deadline. Completion
//! notifications arrive from connection I/O tasks through the
//! [`InvocationCompletion`] monitor; the invoking task awaits it.
//!
//! The one subtle rule lives in [`InvocationCompletion::failed`]: a failure
//! notification arriving after the state has advanced past `InProgress` is
//! ignored and the call counts as sent. The reply already left the queue; a
//! transport-level failure notification after that is stale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, trace};

use errant_wire::{Context, OutputStream, RequestHeader, RequestId, begin_request, finish_message};

use crate::errors::{RequestFailedInfo, decode_reply};
use crate::{
    ErrantError, InvocationTimeout, OperationSpec, OutgoingRequest, Proxy, RequestHandler,
    SendStatus,
};

/// Bounded window granted to a cancellation's side effect before the
/// invocation finalizes the timeout locally.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

// ============================================================================
// Invocation state
// ============================================================================

/// Where one invocation attempt stands. Owned by a single
/// [`InvocationCompletion`]; transitions happen only under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Nothing handed to a connection yet.
    Unsent,
    /// Bytes handed to the connection; awaiting send and reply.
    InProgress,
    /// Send observed. Terminal for the no-response modes: sending is
    /// completion.
    Sent,
    /// Reply classified as success. Terminal.
    Ok,
    /// Reply classified as a declared user exception. Terminal.
    UserException,
    /// Classified failure that will not be retried. Terminal.
    LocalException,
    /// The connection signaled a retryable condition; the invocation loops
    /// back with the handler cleared.
    Retry,
    /// A synchronous failure during preparation or handler acquisition.
    Failed,
}

impl InvocationState {
    /// True once the attempt has an outcome (including retry).
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Unsent | Self::InProgress)
    }
}

// ============================================================================
// Completion monitor
// ============================================================================

/// The outcome of one attempt, as observed by the invoking task.
pub(crate) enum Outcome {
    Success(Vec<u8>),
    Error(ErrantError),
    Retry(ErrantError),
}

struct CompletionInner {
    state: InvocationState,
    sent: bool,
    reply: Option<Vec<u8>>,
    error: Option<ErrantError>,
}

/// The invocation-local monitor a connection reports progress to.
///
/// One instance per attempt. Connections call [`sent`](Self::sent),
/// [`completed`](Self::completed), [`failed`](Self::failed), or
/// [`retry`](Self::retry) from their I/O tasks; exactly one of the terminal
/// notifications finalizes the attempt.
pub struct InvocationCompletion {
    expects_response: bool,
    request_id: RequestId,
    local: RequestFailedInfo,
    declared: Vec<String>,
    inner: Mutex<CompletionInner>,
    notify: Notify,
}

impl InvocationCompletion {
    pub(crate) fn new(
        expects_response: bool,
        request_id: RequestId,
        local: RequestFailedInfo,
        declared: Vec<String>,
    ) -> Self {
        Self {
            expects_response,
            request_id,
            local,
            declared,
            inner: Mutex::new(CompletionInner {
                state: InvocationState::Unsent,
                sent: false,
                reply: None,
                error: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn state(&self) -> InvocationState {
        self.inner.lock().state
    }

    pub(crate) fn mark_in_progress(&self) {
        let mut inner = self.inner.lock();
        if inner.state == InvocationState::Unsent {
            inner.state = InvocationState::InProgress;
        }
    }

    /// The connection finished putting the request on the wire.
    pub fn sent(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_settled() {
            return;
        }
        inner.sent = true;
        if !self.expects_response {
            inner.state = InvocationState::Sent;
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// A complete reply message arrived for this request.
    pub fn completed(&self, reply: Vec<u8>) {
        // Classify outside the lock; only the publication happens under it.
        let outcome = decode_reply(&reply, self.request_id, &self.local, &self.declared);
        let mut inner = self.inner.lock();
        if inner.state.is_settled() {
            debug!(request_id = %self.request_id, "dropping stale reply");
            return;
        }
        inner.sent = true;
        // Payload members before the state: the state write is the
        // publication point for the waiting task.
        match outcome {
            Ok(payload) => {
                inner.reply = Some(payload);
                inner.state = InvocationState::Ok;
            }
            Err(error @ ErrantError::User(_)) => {
                inner.error = Some(error);
                inner.state = InvocationState::UserException;
            }
            Err(error) => {
                inner.error = Some(error);
                inner.state = InvocationState::LocalException;
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// The connection reported a failure for this request.
    ///
    /// Ignored once the state has advanced past `InProgress`: the request
    /// was already sent (or answered), so the notification is stale and the
    /// call is treated as sent successfully.
    pub fn failed(&self, error: ErrantError) {
        let mut inner = self.inner.lock();
        match inner.state {
            InvocationState::Unsent | InvocationState::InProgress => {
                inner.error = Some(error);
                inner.state = InvocationState::LocalException;
                drop(inner);
                self.notify.notify_one();
            }
            state => {
                debug!(
                    request_id = %self.request_id,
                    ?state,
                    %error,
                    "ignoring stale failure notification"
                );
            }
        }
    }

    /// The connection reported a retryable condition. Same staleness gate as
    /// [`failed`](Self::failed).
    pub fn retry(&self, error: ErrantError) {
        let mut inner = self.inner.lock();
        match inner.state {
            InvocationState::Unsent | InvocationState::InProgress => {
                inner.error = Some(error);
                inner.state = InvocationState::Retry;
                drop(inner);
                self.notify.notify_one();
            }
            state => {
                debug!(
                    request_id = %self.request_id,
                    ?state,
                    %error,
                    "ignoring stale retry notification"
                );
            }
        }
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        let mut inner = self.inner.lock();
        match inner.state {
            InvocationState::Unsent | InvocationState::InProgress => None,
            InvocationState::Sent => Some(Outcome::Success(Vec::new())),
            InvocationState::Ok => Some(Outcome::Success(inner.reply.take().unwrap_or_default())),
            InvocationState::UserException
            | InvocationState::LocalException
            | InvocationState::Failed => Some(Outcome::Error(
                inner
                    .error
                    .take()
                    .unwrap_or(ErrantError::Unknown("missing error".to_string())),
            )),
            InvocationState::Retry => Some(Outcome::Retry(
                inner
                    .error
                    .take()
                    .unwrap_or(ErrantError::ConnectionLost("retry requested".to_string())),
            )),
        }
    }

    /// Wait until the attempt settles, with no deadline.
    pub(crate) async fn settled(&self) -> Outcome {
        loop {
            let notified = self.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Finalize with `error` unless a notification settled the attempt
    /// first; either way, return the final outcome.
    fn finalize_local(&self, error: ErrantError) -> Outcome {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_settled() {
                inner.error = Some(error);
                inner.state = InvocationState::LocalException;
            }
        }
        self.outcome()
            .unwrap_or(Outcome::Error(ErrantError::Unknown(
                "invocation settled without an outcome".to_string(),
            )))
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// One logical call, from preparation to final outcome.
pub struct Invocation<'a> {
    proxy: &'a Proxy,
    operation: &'a OperationSpec,
    body: Vec<u8>,
    local: RequestFailedInfo,
}

impl<'a> Invocation<'a> {
    /// Validate the call shape against the reference mode and marshal the
    /// request body (everything after the request id).
    ///
    /// A result-bearing operation on a reference that cannot carry a reply
    /// fails here, before anything touches the network.
    pub(crate) fn prepare(
        proxy: &'a Proxy,
        operation: &'a OperationSpec,
        in_params: &[u8],
        context: Option<&Context>,
    ) -> Result<Self, ErrantError> {
        let reference = proxy.reference();
        if operation.returns_data && !reference.mode.expects_response() {
            return Err(ErrantError::TwowayOnly {
                operation: operation.name.clone(),
            });
        }

        let mut out = OutputStream::new();
        RequestHeader::write_body(
            &mut out,
            &reference.identity,
            reference.facet.as_deref(),
            &operation.name,
            reference.mode,
            context.unwrap_or(&reference.context),
        );
        out.write_encaps(reference.encoding, in_params);

        let local = RequestFailedInfo::new(
            reference.identity.clone(),
            reference.facet.clone(),
            operation.name.clone(),
        );
        Ok(Self {
            proxy,
            operation,
            body: out.into_bytes(),
            local,
        })
    }

    /// Drive the call to its final outcome. On success the returned bytes
    /// are the reply's result encapsulation body (empty for the no-response
    /// modes, whose success is the send itself).
    pub(crate) async fn invoke(mut self) -> Result<Vec<u8>, ErrantError> {
        let reference = self.proxy.reference().clone();
        let mode = reference.mode;

        if mode.is_batch() {
            self.proxy.enqueue_batch(std::mem::take(&mut self.body));
            return Ok(Vec::new());
        }

        let expects_response = mode.expects_response();
        let started = Instant::now();
        // The deadline is computed once. The connection-timeout sentinel is
        // resolved lazily, after the first handler is obtained.
        let mut deadline = match reference.invocation_timeout {
            InvocationTimeout::After(timeout) => Some(started + timeout),
            _ => None,
        };
        let mut deadline_resolved =
            reference.invocation_timeout != InvocationTimeout::UseConnection;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let handler = match self.proxy.request_handler().await {
                Ok(handler) => handler,
                Err(error) => {
                    self.backoff_or_surface(error, attempt, deadline).await?;
                    continue;
                }
            };

            if !deadline_resolved {
                deadline = handler
                    .connection()
                    .timeout()
                    .map(|timeout| started + timeout);
                deadline_resolved = true;
            }

            let request_id = if expects_response {
                handler.next_request_id()
            } else {
                RequestId::NONE
            };
            let completion = Arc::new(InvocationCompletion::new(
                expects_response,
                request_id,
                self.local.clone(),
                self.operation.declared_exceptions.clone(),
            ));

            let mut out = OutputStream::new();
            begin_request(&mut out, request_id);
            out.write_raw(&self.body);
            finish_message(&mut out);

            trace!(
                operation = %self.operation.name,
                %request_id,
                attempt,
                "handing request to connection"
            );
            completion.mark_in_progress();
            let send = handler.connection().send_request(OutgoingRequest {
                request_id,
                message: out.into_bytes().into(),
                expects_response,
                completion: completion.clone(),
            });

            let outcome = match send {
                // No response expected and the send already completed: the
                // call is terminal without ever waiting.
                Ok(SendStatus::Completed) if !expects_response => return Ok(Vec::new()),
                Ok(_) => {
                    self.await_completion(&completion, deadline, &handler, request_id)
                        .await
                }
                Err(error) => Outcome::Error(error),
            };

            match outcome {
                Outcome::Success(payload) => return Ok(payload),
                Outcome::Retry(error) | Outcome::Error(error) => {
                    if error.is_retryable() || error.is_fatal_to_connection() {
                        self.proxy.clear_handler_if_current(&handler);
                    }
                    self.backoff_or_surface(error, attempt, deadline).await?;
                }
            }
        }
    }

    /// Await the completion monitor until the attempt settles or the
    /// deadline elapses. Deadline expiry cancels this one request
    /// (advisory), then grants the cancellation a bounded window; a success
    /// that races it is honored.
    async fn await_completion(
        &self,
        completion: &Arc<InvocationCompletion>,
        deadline: Option<Instant>,
        handler: &Arc<RequestHandler>,
        request_id: RequestId,
    ) -> Outcome {
        loop {
            let notified = completion.notified();
            if let Some(outcome) = completion.outcome() {
                return outcome;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        trace!(%request_id, "invocation deadline elapsed, cancelling");
                        handler.cancel(request_id, ErrantError::InvocationTimedOut);
                        let notified = completion.notified();
                        if let Some(outcome) = completion.outcome() {
                            return outcome;
                        }
                        let _ = tokio::time::timeout(CANCEL_GRACE, notified).await;
                        return completion.finalize_local(ErrantError::InvocationTimedOut);
                    }
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                }
            }
        }
    }

    /// Consult the retry policy; either sleep out the backoff (sliced
    /// against the deadline) and return for another attempt, or surface the
    /// error. Exhausted retries always surface the last observed error.
    async fn backoff_or_surface(
        &self,
        error: ErrantError,
        attempt: u32,
        deadline: Option<Instant>,
    ) -> Result<(), ErrantError> {
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match self
            .proxy
            .retry_policy()
            .next_delay(&error, attempt, remaining)
        {
            Some(delay) => {
                trace!(attempt, ?delay, %error, "retrying after transient failure");
                if sleep_sliced(delay, deadline).await.is_err() {
                    return Err(error);
                }
                Ok(())
            }
            None => Err(error),
        }
    }
}

/// Sleep `delay` in slices no larger than what remains of the deadline, so
/// deadline expiry stays responsive during a long backoff.
async fn sleep_sliced(delay: Duration, deadline: Option<Instant>) -> Result<(), ()> {
    let wake = Instant::now() + delay;
    loop {
        let now = Instant::now();
        if now >= wake {
            return Ok(());
        }
        let mut slice = wake - now;
        if let Some(deadline) = deadline {
            if now >= deadline {
                return Err(());
            }
            slice = slice.min(deadline - now);
        }
        tokio::time::sleep(slice).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errant_wire::{EncodingVersion, Identity, begin_reply};

    use crate::errors::{UserError, write_reply_ok};

    fn reply_ok(request_id: RequestId, body: &[u8]) -> Vec<u8> {
        let mut out = OutputStream::new();
        let slot = begin_reply(&mut out, request_id);
        write_reply_ok(&mut out, slot, EncodingVersion::V1_0, body);
        finish_message(&mut out);
        out.into_bytes()
    }

    fn completion(expects_response: bool) -> InvocationCompletion {
        InvocationCompletion::new(
            expects_response,
            if expects_response {
                RequestId::new(1)
            } else {
                RequestId::NONE
            },
            RequestFailedInfo::new(Identity::named("thing"), None, "poke"),
            vec!["::demo::Oops".to_string()],
        )
    }

    #[test]
    fn failure_before_send_finalizes_the_attempt() {
        let completion = completion(true);
        completion.mark_in_progress();
        completion.failed(ErrantError::ConnectionLost("reset".into()));
        assert_eq!(completion.state(), InvocationState::LocalException);
        match completion.outcome() {
            Some(Outcome::Error(ErrantError::ConnectionLost(_))) => {}
            _ => panic!("expected a connection-lost outcome"),
        }
    }

    #[test]
    fn failure_after_oneway_sent_is_ignored() {
        let completion = completion(false);
        completion.mark_in_progress();
        completion.sent();
        assert_eq!(completion.state(), InvocationState::Sent);

        // Stale transport notification after the send: the call stays sent.
        completion.failed(ErrantError::ConnectionLost("reset".into()));
        assert_eq!(completion.state(), InvocationState::Sent);
        assert!(matches!(completion.outcome(), Some(Outcome::Success(_))));
    }

    #[test]
    fn failure_after_reply_is_ignored() {
        let completion = completion(true);
        completion.mark_in_progress();
        completion.sent();
        completion.completed(reply_ok(RequestId::new(1), b"result"));
        assert_eq!(completion.state(), InvocationState::Ok);

        completion.failed(ErrantError::ConnectionLost("reset".into()));
        match completion.outcome() {
            Some(Outcome::Success(payload)) => assert_eq!(payload, b"result"),
            _ => panic!("late failure must not displace the reply"),
        }
    }

    #[test]
    fn reply_after_failure_is_dropped() {
        let completion = completion(true);
        completion.mark_in_progress();
        completion.failed(ErrantError::ConnectionLost("reset".into()));
        completion.completed(reply_ok(RequestId::new(1), b"result"));
        assert_eq!(completion.state(), InvocationState::LocalException);
    }

    #[test]
    fn retry_signal_is_gated_like_failure() {
        let completion = completion(true);
        completion.mark_in_progress();
        completion.completed(reply_ok(RequestId::new(1), b""));
        completion.retry(ErrantError::ConnectionLost("graceful close".into()));
        assert_eq!(completion.state(), InvocationState::Ok);
    }

    #[test]
    fn undeclared_user_exception_classifies_as_unknown_user() {
        use crate::errors::write_reply_error;

        let mut out = OutputStream::new();
        let slot = begin_reply(&mut out, RequestId::new(1));
        write_reply_error(
            &mut out,
            slot,
            EncodingVersion::V1_0,
            &ErrantError::User(UserError::new("::demo::Surprise", vec![])),
            &RequestFailedInfo::default(),
        );
        finish_message(&mut out);

        let completion = completion(true);
        completion.mark_in_progress();
        completion.completed(out.into_bytes());
        assert_eq!(completion.state(), InvocationState::LocalException);
        match completion.outcome() {
            Some(Outcome::Error(ErrantError::UnknownUser(msg))) => {
                assert!(msg.contains("::demo::Surprise"));
            }
            _ => panic!("expected an unknown-user outcome"),
        }
    }

    #[test]
    fn declared_user_exception_settles_as_user_exception() {
        use crate::errors::write_reply_error;

        let mut out = OutputStream::new();
        let slot = begin_reply(&mut out, RequestId::new(1));
        write_reply_error(
            &mut out,
            slot,
            EncodingVersion::V1_0,
            &ErrantError::User(UserError::new("::demo::Oops", b"detail".to_vec())),
            &RequestFailedInfo::default(),
        );
        finish_message(&mut out);

        let completion = completion(true);
        completion.mark_in_progress();
        completion.completed(out.into_bytes());
        assert_eq!(completion.state(), InvocationState::UserException);
    }
}
