//! The loopback connection: an in-process [`Connection`] that feeds
//! outgoing requests straight into a [`DispatchPipeline`].
//!
//! The simplest deployment mode, and the transport the end-to-end tests run
//! over. Each send is dispatched on its own task, so the client-side race
//! rules are exercised for real.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use errant_wire::RequestId;

use crate::{
    Connection, Connector, DispatchOutcome, DispatchPipeline, ErrantError, InvocationCompletion,
    OutgoingRequest, ProxyReference, SendStatus,
};

struct LoopbackInner {
    pipeline: Arc<DispatchPipeline>,
    pending: Mutex<HashMap<i32, Arc<InvocationCompletion>>>,
    closed: AtomicBool,
    timeout: Option<Duration>,
}

/// An in-process connection over a dispatch pipeline.
#[derive(Clone)]
pub struct LoopbackConnection {
    inner: Arc<LoopbackInner>,
}

impl LoopbackConnection {
    pub fn new(pipeline: Arc<DispatchPipeline>) -> Self {
        Self::build(pipeline, None)
    }

    pub fn with_timeout(pipeline: Arc<DispatchPipeline>, timeout: Duration) -> Self {
        Self::build(pipeline, Some(timeout))
    }

    fn build(pipeline: Arc<DispatchPipeline>, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                pipeline,
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                timeout,
            }),
        }
    }

    /// Close the connection: new sends fail as connection-lost (which the
    /// retry machinery treats as transient) and in-flight requests are
    /// failed out.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, completion) in pending {
            completion.failed(ErrantError::ConnectionLost("connection closed".to_string()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Connection for LoopbackConnection {
    fn send_request(&self, request: OutgoingRequest) -> Result<SendStatus, ErrantError> {
        if self.is_closed() {
            return Err(ErrantError::ConnectionLost("connection closed".to_string()));
        }

        let OutgoingRequest {
            request_id,
            message,
            expects_response,
            completion,
        } = request;

        let inner = self.inner.clone();
        let connection: Arc<dyn Connection> = Arc::new(self.clone());
        if expects_response {
            inner
                .pending
                .lock()
                .insert(request_id.raw(), completion.clone());
        }

        tokio::spawn(async move {
            completion.sent();
            let outcome = match inner.pipeline.dispatch_message(&message, Some(connection)) {
                Ok(outcome) => outcome,
                Err(fatal) => {
                    // Header parse failures are fatal to the connection.
                    error!(%fatal, "loopback dispatch failed, closing connection");
                    inner.closed.store(true, Ordering::SeqCst);
                    if expects_response && inner.pending.lock().remove(&request_id.raw()).is_some()
                    {
                        completion.failed(fatal);
                    }
                    return;
                }
            };
            let mut outcome = outcome;
            while let DispatchOutcome::Deferred(pending) = outcome {
                outcome = pending.wait().await;
            }
            match outcome {
                DispatchOutcome::Response(reply) => {
                    // Deliver only if the request is still wanted; a
                    // cancellation that won the race already finalized it.
                    if inner.pending.lock().remove(&request_id.raw()).is_some() {
                        completion.completed(reply);
                    } else {
                        debug!(%request_id, "dropping reply for cancelled request");
                    }
                }
                DispatchOutcome::NoResponse => {}
                DispatchOutcome::Deferred(_) => {}
            }
        });

        Ok(if expects_response {
            SendStatus::Pending
        } else {
            SendStatus::Completed
        })
    }

    fn cancel(&self, request_id: RequestId, reason: ErrantError) {
        if let Some(completion) = self.inner.pending.lock().remove(&request_id.raw()) {
            trace!(%request_id, %reason, "cancelling in-flight request");
            completion.failed(reason);
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }
}

/// Connector producing loopback connections over one pipeline.
pub struct LoopbackConnector {
    pipeline: Arc<DispatchPipeline>,
    timeout: Option<Duration>,
}

impl LoopbackConnector {
    pub fn new(pipeline: Arc<DispatchPipeline>) -> Self {
        Self {
            pipeline,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Connector for LoopbackConnector {
    fn resolve(
        &self,
        _reference: &ProxyReference,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, ErrantError>> + Send + '_>> {
        let connection: Arc<dyn Connection> = match self.timeout {
            Some(timeout) => Arc::new(LoopbackConnection::with_timeout(
                self.pipeline.clone(),
                timeout,
            )),
            None => Arc::new(LoopbackConnection::new(self.pipeline.clone())),
        };
        Box::pin(async move { Ok(connection) })
    }
}
