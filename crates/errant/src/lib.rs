//! errant - request/reply RPC middleware
//!
//! This crate provides a unified API for the errant invocation-and-dispatch
//! core. Users should depend on this crate rather than the individual
//! component crates.

#![deny(unsafe_code)]

// Client side: references, proxies, invocation machinery.
pub use errant_session::{
    Connection, Connector, ErrantError, HandlerSlot, Invocation, InvocationCompletion,
    InvocationState, InvocationTimeout, OperationSpec, OutgoingRequest, Proxy, ProxyReference,
    RequestFailedInfo, RequestHandler, RequestIdGenerator, RetryPolicy, SendStatus, UserError,
};

// Server side: dispatch pipeline, servants, registries, locators.
pub use errant_session::{
    Current, DeferredReply, DispatchInterceptor, DispatchOutcome, DispatchPipeline,
    IncomingRequest, PendingDispatch, Servant, ServantLocator, ServantMap, ServantRegistry,
    ServantResult,
};

// Batch accumulation and the in-process transport.
pub use errant_session::{BatchRequestQueue, LoopbackConnection, LoopbackConnector};

// Wire-level vocabulary used in public signatures.
pub use errant_wire::{
    Context, EncodingVersion, Identity, InputStream, InvocationMode, OutputStream, ReplyStatus,
    RequestId,
};

// Lower-level wire access for custom transports.
pub use errant_wire as wire;
