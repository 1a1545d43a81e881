//! Servants, the registry that stores them, and the locator fallback chain.
//!
//! The registry contract is what the dispatch pipeline consumes; the
//! map-based [`ServantMap`] is the stock implementation used by the loopback
//! connection and by adapters that keep their servants in memory.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use errant_wire::{Context, EncodingVersion, Identity, InputStream, InvocationMode, RequestId};

use crate::errors::RequestFailedInfo;
use crate::{Connection, ErrantError};

// ============================================================================
// Current
// ============================================================================

/// Per-dispatch context handed to a servant call. Created fresh for every
/// inbound request; read-only to the servant.
pub struct Current {
    pub identity: Identity,
    pub facet: Option<String>,
    pub operation: String,
    pub mode: InvocationMode,
    pub request_id: RequestId,
    /// The connection the request arrived on, when the transport exposes
    /// one.
    pub connection: Option<Arc<dyn Connection>>,
    pub adapter_name: String,
    /// Encoding of the request's parameter encapsulation.
    pub encoding: EncodingVersion,
    pub context: Context,
}

impl Current {
    /// The facet as the registry sees it: the empty string for "none".
    pub fn facet_name(&self) -> &str {
        self.facet.as_deref().unwrap_or("")
    }

    pub(crate) fn failed_info(&self) -> RequestFailedInfo {
        RequestFailedInfo::new(
            self.identity.clone(),
            self.facet.clone(),
            self.operation.clone(),
        )
    }
}

impl std::fmt::Debug for Current {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Current")
            .field("identity", &self.identity)
            .field("facet", &self.facet)
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("request_id", &self.request_id)
            .field("adapter_name", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Servant
// ============================================================================

/// A servant operation's reply, produced later by a different call path.
pub type DeferredReply = Pin<Box<dyn Future<Output = Result<Vec<u8>, ErrantError>> + Send>>;

/// Outcome of handing a request to a servant.
pub enum ServantResult {
    /// The operation ran synchronously; `Ok` carries the out-parameter
    /// encapsulation body.
    Completed(Result<Vec<u8>, ErrantError>),
    /// The reply will be produced asynchronously. The pipeline leaves the
    /// reply buffer untouched until the future resolves.
    Deferred(DeferredReply),
}

impl ServantResult {
    pub fn ok(body: Vec<u8>) -> Self {
        Self::Completed(Ok(body))
    }

    pub fn error(error: ErrantError) -> Self {
        Self::Completed(Err(error))
    }

    pub fn deferred(
        reply: impl Future<Output = Result<Vec<u8>, ErrantError>> + Send + 'static,
    ) -> Self {
        Self::Deferred(Box::pin(reply))
    }
}

/// A server-side object registered under an identity/facet.
///
/// `input` is positioned at the parameter encapsulation body. A servant that
/// does not recognize `current.operation` reports
/// [`ErrantError::OperationNotExist`]; the pipeline backfills the identity
/// triple.
pub trait Servant: Send + Sync + 'static {
    fn dispatch(&self, current: &Current, input: &mut InputStream<'_>) -> ServantResult;
}

// ============================================================================
// Registry and locators
// ============================================================================

/// Identity+facet lookup plus the locator chain. What the dispatch pipeline
/// consumes; storage is the adapter's business.
pub trait ServantRegistry: Send + Sync + 'static {
    fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>>;

    /// Whether any servant is registered under `identity`, regardless of
    /// facet. Drives the facet-vs-object not-found tie-break.
    fn has_any(&self, identity: &Identity) -> bool;

    fn find_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>>;
}

/// Opaque state a locator threads from `locate` to `finished`.
pub type LocatorCookie = Box<dyn Any + Send>;

/// Pluggable fallback resolver, consulted when direct lookup misses.
///
/// `locate` may raise: a declared user exception is marshaled as a normal
/// user-exception reply, anything else is classified through the shared
/// taxonomy. When `locate` produced a servant, `finished` is always invoked
/// after the operation, including when the operation raised, and its own
/// failures are re-classified the same way.
pub trait ServantLocator: Send + Sync + 'static {
    fn locate(
        &self,
        current: &Current,
    ) -> Result<Option<(Arc<dyn Servant>, Option<LocatorCookie>)>, ErrantError>;

    fn finished(
        &self,
        current: &Current,
        servant: &Arc<dyn Servant>,
        cookie: Option<LocatorCookie>,
    ) -> Result<(), ErrantError>;
}

// ============================================================================
// ServantMap
// ============================================================================

/// Map-backed registry: exact `{identity, facet}` entries plus per-category
/// locators (category `""` is the default locator).
#[derive(Default)]
pub struct ServantMap {
    servants: RwLock<HashMap<(Identity, String), Arc<dyn Servant>>>,
    locators: RwLock<HashMap<String, Arc<dyn ServantLocator>>>,
}

impl ServantMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the default facet.
    pub fn add(&self, identity: Identity, servant: Arc<dyn Servant>) {
        self.add_facet(identity, "", servant);
    }

    pub fn add_facet(&self, identity: Identity, facet: &str, servant: Arc<dyn Servant>) {
        self.servants
            .write()
            .insert((identity, facet.to_string()), servant);
    }

    pub fn remove(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.servants
            .write()
            .remove(&(identity.clone(), facet.to_string()))
    }

    pub fn add_locator(&self, category: &str, locator: Arc<dyn ServantLocator>) {
        self.locators.write().insert(category.to_string(), locator);
    }

    pub fn set_default_locator(&self, locator: Arc<dyn ServantLocator>) {
        self.add_locator("", locator);
    }
}

impl ServantRegistry for ServantMap {
    fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.servants
            .read()
            .get(&(identity.clone(), facet.to_string()))
            .cloned()
    }

    fn has_any(&self, identity: &Identity) -> bool {
        self.servants
            .read()
            .keys()
            .any(|(registered, _)| registered == identity)
    }

    fn find_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.locators.read().get(category).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopServant;

    impl Servant for NoopServant {
        fn dispatch(&self, _current: &Current, _input: &mut InputStream<'_>) -> ServantResult {
            ServantResult::ok(Vec::new())
        }
    }

    #[test]
    fn find_is_exact_on_identity_and_facet() {
        let map = ServantMap::new();
        let identity = Identity::named("thing");
        map.add_facet(identity.clone(), "admin", Arc::new(NoopServant));

        assert!(map.find(&identity, "admin").is_some());
        assert!(map.find(&identity, "").is_none());
        assert!(map.find(&Identity::named("other"), "admin").is_none());
    }

    #[test]
    fn has_any_ignores_the_facet() {
        let map = ServantMap::new();
        let identity = Identity::named("thing");
        map.add_facet(identity.clone(), "admin", Arc::new(NoopServant));

        assert!(map.has_any(&identity));
        assert!(!map.has_any(&Identity::named("other")));
    }
}
