//! The proxy: the application-facing handle for invoking operations on a
//! remote target.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use errant_wire::{BATCH_COUNT_OFFSET, Context, OutputStream, RequestId, begin_batch, finish_message};

use crate::errors::RequestFailedInfo;
use crate::invocation::{Invocation, InvocationCompletion, Outcome};
use crate::{
    BatchRequestQueue, Connector, ErrantError, HandlerSlot, OperationSpec, OutgoingRequest,
    ProxyReference, RequestHandler, RetryPolicy, SendStatus,
};

/// A remote-object handle: an immutable [`ProxyReference`], a connector to
/// reach it, and the mutable bits shared across invocations: the current
/// request handler and the batch queue.
///
/// Each call gets its own [`Invocation`]; concurrent calls interact only
/// through the handler slot.
pub struct Proxy {
    reference: Arc<ProxyReference>,
    connector: Arc<dyn Connector>,
    retry_policy: RetryPolicy,
    handler: HandlerSlot,
    batch: Mutex<BatchRequestQueue>,
}

impl Proxy {
    pub fn new(reference: impl Into<Arc<ProxyReference>>, connector: Arc<dyn Connector>) -> Self {
        Self {
            reference: reference.into(),
            connector,
            retry_policy: RetryPolicy::default(),
            handler: HandlerSlot::new(),
            batch: Mutex::new(BatchRequestQueue::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn reference(&self) -> &Arc<ProxyReference> {
        &self.reference
    }

    /// A proxy for the same target with a different reference, sharing the
    /// connector and retry policy but nothing mutable.
    pub fn with_reference(&self, reference: ProxyReference) -> Proxy {
        Proxy {
            reference: Arc::new(reference),
            connector: self.connector.clone(),
            retry_policy: self.retry_policy.clone(),
            handler: HandlerSlot::new(),
            batch: Mutex::new(BatchRequestQueue::new()),
        }
    }

    /// Invoke `operation` with `in_params` as the already-marshaled
    /// parameter encapsulation body.
    ///
    /// Returns the reply's result encapsulation body on success. User
    /// exceptions surface as [`ErrantError::User`]; everything else in the
    /// taxonomy surfaces as its own kind.
    pub async fn invoke(
        &self,
        operation: &OperationSpec,
        in_params: &[u8],
        context: Option<&Context>,
    ) -> Result<Vec<u8>, ErrantError> {
        Invocation::prepare(self, operation, in_params, context)?
            .invoke()
            .await
    }

    /// Drain the batch queue into a single message and send it. A flush with
    /// nothing queued is a no-op that produces zero wire bytes.
    pub async fn flush_batch_requests(&self) -> Result<(), ErrantError> {
        let Some((entries, count)) = self.batch.lock().take() else {
            return Ok(());
        };
        trace!(count, "flushing batch requests");

        let handler = self.request_handler().await?;
        let mut out = OutputStream::new();
        begin_batch(&mut out);
        out.write_raw(&entries);
        out.rewrite_i32(BATCH_COUNT_OFFSET, count as i32);
        finish_message(&mut out);

        let completion = Arc::new(InvocationCompletion::new(
            false,
            RequestId::NONE,
            RequestFailedInfo::default(),
            Vec::new(),
        ));
        completion.mark_in_progress();
        let send = handler.connection().send_request(OutgoingRequest {
            request_id: RequestId::NONE,
            message: out.into_bytes().into(),
            expects_response: false,
            completion: completion.clone(),
        });
        match send {
            Ok(SendStatus::Completed) => Ok(()),
            Ok(SendStatus::Pending) => match completion.settled().await {
                Outcome::Success(_) => Ok(()),
                Outcome::Error(error) | Outcome::Retry(error) => {
                    self.clear_handler_if_current(&handler);
                    Err(error)
                }
            },
            Err(error) => {
                self.clear_handler_if_current(&handler);
                Err(error)
            }
        }
    }

    /// Number of batched requests awaiting a flush.
    pub fn pending_batch_requests(&self) -> usize {
        self.batch.lock().len()
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub(crate) fn enqueue_batch(&self, body: Vec<u8>) {
        self.batch.lock().enqueue(body);
    }

    /// The currently installed handler, if any. Mostly useful to observe
    /// handler replacement in tests.
    pub fn current_handler(&self) -> Option<Arc<RequestHandler>> {
        self.handler.get()
    }

    /// Resolve (or reuse) the request handler for this proxy. When two
    /// invocations race here, the install winner's handler is adopted by
    /// both.
    pub(crate) async fn request_handler(&self) -> Result<Arc<RequestHandler>, ErrantError> {
        if let Some(handler) = self.handler.get() {
            return Ok(handler);
        }
        let connection = self.connector.resolve(&self.reference).await?;
        Ok(self
            .handler
            .install_or_reuse(Arc::new(RequestHandler::new(connection))))
    }

    pub(crate) fn clear_handler_if_current(&self, stale: &Arc<RequestHandler>) {
        self.handler.clear_if_current(stale);
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}
