//! The request handler: a resolved connection plus per-connection request id
//! allocation, and the compare-and-clear slot that shares one handler across
//! all invocations of a proxy.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use errant_wire::RequestId;

use crate::{Connection, ErrantError};

// ============================================================================
// Request id generation
// ============================================================================

/// Generates unique request ids for a connection: a monotonically increasing
/// counter starting at 1 (0 is the reserved "no reply" id).
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> RequestId {
        RequestId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// RequestHandler
// ============================================================================

/// A live connection bound to a proxy, with the request id allocator that
/// goes with it.
///
/// Handlers are replaced wholesale on failure: the invocation that observed
/// the failure clears the proxy's slot (compare-and-clear) and the next
/// attempt resolves a fresh one.
pub struct RequestHandler {
    connection: Arc<dyn Connection>,
    request_ids: RequestIdGenerator,
}

impl RequestHandler {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            request_ids: RequestIdGenerator::new(),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next()
    }

    /// Ask the connection to abort one outstanding request. Advisory.
    pub fn cancel(&self, request_id: RequestId, reason: ErrantError) {
        self.connection.cancel(request_id, reason);
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler").finish_non_exhaustive()
    }
}

// ============================================================================
// HandlerSlot
// ============================================================================

/// The one piece of state shared between invocations of the same proxy.
///
/// `install_or_reuse` and `clear_if_current` together guarantee that after
/// any number of concurrent failures and re-resolutions, exactly one handler
/// is installed: a loser of the install race adopts the winner's handler,
/// and a failing invocation can only evict the handler it actually used.
#[derive(Default)]
pub struct HandlerSlot {
    inner: Mutex<Option<Arc<RequestHandler>>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<RequestHandler>> {
        self.inner.lock().clone()
    }

    /// Install `handler` unless a concurrent resolution beat us to it, in
    /// which case the already-installed handler is returned instead.
    pub fn install_or_reuse(&self, handler: Arc<RequestHandler>) -> Arc<RequestHandler> {
        let mut slot = self.inner.lock();
        match &*slot {
            Some(existing) => existing.clone(),
            None => {
                *slot = Some(handler.clone());
                handler
            }
        }
    }

    /// Clear the slot only if it still holds `stale`. A fresher handler
    /// installed by a concurrent invocation is left alone.
    pub fn clear_if_current(&self, stale: &Arc<RequestHandler>) {
        let mut slot = self.inner.lock();
        if let Some(current) = &*slot
            && Arc::ptr_eq(current, stale)
        {
            *slot = None;
        }
    }
}
