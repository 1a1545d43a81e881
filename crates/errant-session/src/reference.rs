//! Proxy references: immutable descriptions of a remote target.

use std::sync::Arc;
use std::time::Duration;

use errant_wire::{Context, EncodingVersion, Identity, InvocationMode};

// ============================================================================
// Invocation timeout
// ============================================================================

/// Deadline policy for one invocation.
///
/// `UseConnection` is a sentinel: the deadline is resolved from the
/// connection's own timeout, lazily, once a connection has been obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationTimeout {
    /// No deadline; the invocation waits as long as it takes.
    #[default]
    Unlimited,
    /// Absolute budget for the whole invocation, retries included.
    After(Duration),
    /// Defer to the connection-level timeout.
    UseConnection,
}

// ============================================================================
// ProxyReference
// ============================================================================

/// Immutable description of a remote target: who to talk to and how.
///
/// References are shared as `Arc<ProxyReference>` across many invocations;
/// the `with_*` methods return a modified copy, never mutate in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReference {
    pub identity: Identity,
    pub facet: Option<String>,
    pub mode: InvocationMode,
    pub context: Context,
    pub invocation_timeout: InvocationTimeout,
    pub encoding: EncodingVersion,
}

impl ProxyReference {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            facet: None,
            mode: InvocationMode::Twoway,
            context: Context::new(),
            invocation_timeout: InvocationTimeout::Unlimited,
            encoding: EncodingVersion::V1_0,
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        let facet = facet.into();
        self.facet = if facet.is_empty() { None } else { Some(facet) };
        self
    }

    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: InvocationTimeout) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn with_encoding(mut self, encoding: EncodingVersion) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

// ============================================================================
// Operation description
// ============================================================================

/// What the core needs to know about an operation: its name, whether it
/// produces results, and which user exceptions it declares.
///
/// Parameter marshaling is the application's business; the core only carries
/// the opaque encapsulation body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    pub name: String,
    /// True when the operation has a return value or out-parameters, which
    /// restricts it to twoway references.
    pub returns_data: bool,
    /// Type ids of the operation's declared user exceptions.
    pub declared_exceptions: Vec<String>,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            returns_data: false,
            declared_exceptions: Vec::new(),
        }
    }

    pub fn returning(mut self) -> Self {
        self.returns_data = true;
        self
    }

    pub fn with_exception(mut self, type_id: impl Into<String>) -> Self {
        self.declared_exceptions.push(type_id.into());
        self
    }
}
