//! The server-side dispatch pipeline: one inbound framed request in, exactly
//! one outbound reply (or a deliberate no-response) out.
//!
//! A request moves through `Received → Resolving → Dispatching → Responding`;
//! the not-found paths go straight to responding. The reply buffer is
//! allocated eagerly (header, request id, status slot) before the servant
//! runs; success and failure differ only in what they write after the status
//! slot, and failure paths truncate-then-rewrite from that offset, which is
//! safe because nothing past it has been handed to the connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use errant_wire::{
    EncodingVersion, InputStream, MessageType, OutputStream, RequestHeader, RequestId, begin_reply,
    finish_message, read_message_header,
};

use crate::errors::{write_reply_error, write_reply_ok};
use crate::registry::{Current, LocatorCookie, Servant, ServantLocator, ServantResult};
use crate::{Connection, ErrantError, ServantRegistry};

// ============================================================================
// Dispatch outcome
// ============================================================================

/// What the pipeline hands back to the connection.
///
/// `NoResponse` is an explicit signal, not a silent nothing: the connection
/// uses it to release per-request resources for the modes that never reply.
pub enum DispatchOutcome {
    /// A complete framed reply message.
    Response(Vec<u8>),
    /// No reply is expected for this request.
    NoResponse,
    /// The reply will be produced by an asynchronous servant; resolve it
    /// with [`PendingDispatch::wait`] from an I/O-capable task.
    Deferred(PendingDispatch),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(bytes) => f.debug_tuple("Response").field(&bytes.len()).finish(),
            Self::NoResponse => f.write_str("NoResponse"),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// An async hand-off: ownership of "who may write the reply" has moved to
/// whatever task resolves this.
pub struct PendingDispatch {
    future: Pin<Box<dyn Future<Output = DispatchOutcome> + Send>>,
}

impl PendingDispatch {
    /// Drive the deferred servant to completion and finalize the reply.
    /// Never yields another `Deferred`.
    pub async fn wait(self) -> DispatchOutcome {
        self.future.await
    }
}

impl std::fmt::Debug for PendingDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDispatch").finish_non_exhaustive()
    }
}

// ============================================================================
// Interceptor
// ============================================================================

/// Wraps a dispatch and may redo it.
///
/// An implementation typically checkpoints with
/// [`IncomingRequest::start_over`], calls [`DispatchPipeline::run`], and on
/// a retryable condition calls `start_over` again (which rewinds the
/// buffers) before running once more.
pub trait DispatchInterceptor: Send + Sync + 'static {
    fn dispatch(
        &self,
        pipeline: &DispatchPipeline,
        request: &mut IncomingRequest<'_, '_>,
    ) -> Result<(), ErrantError>;
}

// ============================================================================
// Incoming request
// ============================================================================

struct PendingServant {
    reply: crate::registry::DeferredReply,
    servant: Arc<dyn Servant>,
    locator: Option<(Arc<dyn ServantLocator>, Option<LocatorCookie>)>,
}

/// Per-request pipeline state. Owned by one worker task at a time; never
/// internally synchronized.
pub struct IncomingRequest<'i, 'm> {
    current: Current,
    input: &'i mut InputStream<'m>,
    output: OutputStream,
    status_slot: usize,
    response_expected: bool,
    checkpoint: Option<(usize, usize)>,
    staged: Option<Result<Vec<u8>, ErrantError>>,
    pending: Option<PendingServant>,
}

impl IncomingRequest<'_, '_> {
    pub fn current(&self) -> &Current {
        &self.current
    }

    pub fn response_expected(&self) -> bool {
        self.response_expected
    }

    /// Checkpoint/rewind support for dispatch interceptors.
    ///
    /// The first call records the read cursor and write position. A second
    /// call without intervening writes cancels any pending async hand-off,
    /// truncates the output back to the status slot, and rewinds the input
    /// to the recorded cursor. Further calls repeat the second call's
    /// effect.
    pub fn start_over(&mut self) {
        match self.checkpoint {
            None => {
                self.checkpoint = Some((self.input.position(), self.output.position()));
            }
            Some((read_pos, write_pos)) => {
                self.pending = None;
                self.staged = None;
                if self.response_expected {
                    self.output.truncate(self.status_slot);
                    self.output.write_u8(0);
                    debug_assert_eq!(self.output.position(), write_pos);
                }
                self.input.set_position(read_pos);
            }
        }
    }

    /// Finalize: build the reply (or the no-response signal), or package the
    /// deferred hand-off.
    fn finish(self) -> DispatchOutcome {
        let IncomingRequest {
            current,
            output,
            status_slot,
            response_expected,
            staged,
            pending,
            ..
        } = self;

        if let Some(PendingServant {
            reply,
            servant,
            locator,
        }) = pending
        {
            let future = async move {
                let outcome = reply.await;
                let outcome = run_finished(&current, &servant, locator, outcome);
                complete_reply(output, status_slot, &current, outcome, response_expected)
            };
            return DispatchOutcome::Deferred(PendingDispatch {
                future: Box::pin(future),
            });
        }

        let outcome = staged.unwrap_or_else(|| {
            Err(ErrantError::UnknownLocal(
                "dispatch produced no outcome".to_string(),
            ))
        });
        complete_reply(output, status_slot, &current, outcome, response_expected)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

enum Resolution {
    Found {
        servant: Arc<dyn Servant>,
        locator: Option<(Arc<dyn ServantLocator>, Option<LocatorCookie>)>,
    },
    NotFound(ErrantError),
    /// A locator raised; user exceptions marshal as normal user-exception
    /// replies, everything else classifies through the taxonomy.
    LocatorRaised(ErrantError),
}

/// Turns inbound framed requests into servant calls and replies, given a
/// servant registry.
pub struct DispatchPipeline {
    registry: Arc<dyn ServantRegistry>,
    adapter_name: String,
    interceptor: Option<Arc<dyn DispatchInterceptor>>,
}

impl DispatchPipeline {
    pub fn new(registry: Arc<dyn ServantRegistry>, adapter_name: impl Into<String>) -> Self {
        Self {
            registry,
            adapter_name: adapter_name.into(),
            interceptor: None,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn DispatchInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn registry(&self) -> &Arc<dyn ServantRegistry> {
        &self.registry
    }

    /// Dispatch one inbound message (a request or a batch of them).
    ///
    /// Header decode failures are fatal and propagate to the caller; they
    /// never become replies. Everything after the header terminates in a
    /// classified reply or an explicit no-response.
    pub fn dispatch_message(
        &self,
        message: &[u8],
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<DispatchOutcome, ErrantError> {
        let mut input = InputStream::new(message);
        match read_message_header(&mut input)? {
            MessageType::Request => {
                let request_id = RequestId::new(input.read_i32()?);
                let mut request = self.decode_header(&mut input, request_id, connection)?;
                self.intercept_or_run(&mut request)?;
                Ok(request.finish())
            }
            MessageType::BatchRequest => self.dispatch_batch(&mut input, connection),
            MessageType::Reply => Err(ErrantError::Protocol(
                "unexpected reply message on the dispatch side".to_string(),
            )),
        }
    }

    /// Read the request header, exactly once per request, and allocate the
    /// reply buffer up to the status slot.
    fn decode_header<'i, 'm>(
        &self,
        input: &'i mut InputStream<'m>,
        request_id: RequestId,
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<IncomingRequest<'i, 'm>, ErrantError> {
        let header = RequestHeader::read_body(input, request_id)?;
        trace!(
            identity = %header.identity,
            operation = %header.operation,
            mode = %header.mode,
            %request_id,
            "dispatching request"
        );
        let response_expected = header.mode.expects_response() && !request_id.is_none();
        let current = Current {
            identity: header.identity,
            facet: header.facet,
            operation: header.operation,
            mode: header.mode,
            request_id,
            connection,
            adapter_name: self.adapter_name.clone(),
            encoding: EncodingVersion::V1_0,
            context: header.context,
        };

        let mut output = OutputStream::new();
        let status_slot = if response_expected {
            begin_reply(&mut output, request_id)
        } else {
            0
        };
        Ok(IncomingRequest {
            current,
            input,
            output,
            status_slot,
            response_expected,
            checkpoint: None,
            staged: None,
            pending: None,
        })
    }

    fn intercept_or_run(&self, request: &mut IncomingRequest<'_, '_>) -> Result<(), ErrantError> {
        match self.interceptor.clone() {
            Some(interceptor) => interceptor.dispatch(self, request),
            None => self.run(request),
        }
    }

    /// Resolve the servant and run the operation, staging the outcome in
    /// the request. Interceptors call this directly, possibly more than
    /// once with a `start_over` in between.
    pub fn run(&self, request: &mut IncomingRequest<'_, '_>) -> Result<(), ErrantError> {
        request.staged = None;
        request.pending = None;

        match self.resolve_servant(&request.current) {
            Resolution::Found { servant, locator } => {
                // Parameter encapsulation bounds up front: whatever the
                // servant does with the cursor, it is forced to the entry's
                // end afterwards so a following batch entry stays aligned.
                match request.input.start_encaps() {
                    Ok((encoding, encaps_end)) => {
                        request.current.encoding = encoding;
                        let result = servant.dispatch(&request.current, request.input);
                        request.input.set_position(encaps_end);
                        match result {
                            ServantResult::Completed(outcome) => {
                                let outcome =
                                    run_finished(&request.current, &servant, locator, outcome);
                                request.staged = Some(outcome);
                            }
                            ServantResult::Deferred(reply) => {
                                request.pending = Some(PendingServant {
                                    reply,
                                    servant,
                                    locator,
                                });
                            }
                        }
                    }
                    Err(error) => {
                        request.staged = Some(Err(error.into()));
                    }
                }
            }
            Resolution::NotFound(error) | Resolution::LocatorRaised(error) => {
                // Skip the parameters so a batch stream stays aligned.
                if let Err(skip) = request.input.skip_encaps() {
                    debug!(%skip, "could not skip parameters of a failed dispatch");
                }
                request.staged = Some(Err(error));
            }
        }
        Ok(())
    }

    fn resolve_servant(&self, current: &Current) -> Resolution {
        if let Some(servant) = self.registry.find(&current.identity, current.facet_name()) {
            return Resolution::Found {
                servant,
                locator: None,
            };
        }

        // Locator chain: the identity's category first, the default ("")
        // locator only when no category locator is registered.
        let locator = self
            .registry
            .find_locator(&current.identity.category)
            .or_else(|| self.registry.find_locator(""));
        if let Some(locator) = locator {
            match locator.locate(current) {
                Ok(Some((servant, cookie))) => {
                    return Resolution::Found {
                        servant,
                        locator: Some((locator, cookie)),
                    };
                }
                Ok(None) => {}
                Err(error) => return Resolution::LocatorRaised(error),
            }
        }

        // Not-found tie-break: any servant under the identity means the
        // facet is what is missing.
        let info = current.failed_info();
        if self.registry.has_any(&current.identity) {
            Resolution::NotFound(ErrantError::FacetNotExist(info))
        } else {
            Resolution::NotFound(ErrantError::ObjectNotExist(info))
        }
    }

    fn dispatch_batch(
        &self,
        input: &mut InputStream<'_>,
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<DispatchOutcome, ErrantError> {
        let count = input.read_i32()?;
        if count < 0 {
            return Err(ErrantError::Protocol(format!(
                "negative batch count {count}"
            )));
        }
        trace!(count, "dispatching batch request");

        let mut deferred = Vec::new();
        for _ in 0..count {
            let mut request = self.decode_header(input, RequestId::NONE, connection.clone())?;
            self.intercept_or_run(&mut request)?;
            if let DispatchOutcome::Deferred(pending) = request.finish() {
                deferred.push(pending);
            }
        }
        if input.remaining() != 0 {
            return Err(ErrantError::Protocol(format!(
                "{} trailing bytes after batch entries",
                input.remaining()
            )));
        }

        if deferred.is_empty() {
            Ok(DispatchOutcome::NoResponse)
        } else {
            Ok(DispatchOutcome::Deferred(PendingDispatch {
                future: Box::pin(async move {
                    for pending in deferred {
                        let _ = pending.wait().await;
                    }
                    DispatchOutcome::NoResponse
                }),
            }))
        }
    }
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("adapter_name", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reply finalization
// ============================================================================

/// Run the locator's `finished` hook, always. A failure from the hook
/// replaces the operation's outcome and classifies through the same mapping.
fn run_finished(
    current: &Current,
    servant: &Arc<dyn Servant>,
    locator: Option<(Arc<dyn ServantLocator>, Option<LocatorCookie>)>,
    outcome: Result<Vec<u8>, ErrantError>,
) -> Result<Vec<u8>, ErrantError> {
    let Some((locator, cookie)) = locator else {
        return outcome;
    };
    match locator.finished(current, servant, cookie) {
        Ok(()) => outcome,
        Err(error) => {
            warn!(operation = %current.operation, %error, "servant locator finished() raised");
            Err(error)
        }
    }
}

fn complete_reply(
    mut output: OutputStream,
    status_slot: usize,
    current: &Current,
    outcome: Result<Vec<u8>, ErrantError>,
    response_expected: bool,
) -> DispatchOutcome {
    if !response_expected {
        if let Err(error) = &outcome {
            // No reply can carry this; it is only observable locally.
            debug!(operation = %current.operation, %error, "dispatch failed with no response expected");
        }
        return DispatchOutcome::NoResponse;
    }

    match outcome {
        Ok(body) => write_reply_ok(&mut output, status_slot, current.encoding, &body),
        Err(error) => {
            trace!(
                operation = %current.operation,
                status = %error.reply_status(),
                "classifying dispatch failure"
            );
            write_reply_error(
                &mut output,
                status_slot,
                current.encoding,
                &error,
                &current.failed_info(),
            );
        }
    }
    finish_message(&mut output);
    DispatchOutcome::Response(output.into_bytes())
}
