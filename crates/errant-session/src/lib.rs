#![deny(unsafe_code)]

//! The errant invocation-and-dispatch core.
//!
//! Client side: a [`Proxy`] holds an immutable [`ProxyReference`] and drives
//! each call through an [`Invocation`] (marshal, send, await, retry,
//! timeout) over a [`Connection`] resolved by a [`Connector`] and cached in
//! the proxy's handler slot.
//!
//! Server side: a [`DispatchPipeline`] turns each inbound framed request
//! into a servant call against a [`ServantRegistry`] (with a
//! [`ServantLocator`] fallback chain) and exactly one classified reply, or
//! an explicit no-response.
//!
//! The two sides share one closed exception taxonomy, [`ErrantError`],
//! mapped to and from the wire's reply status byte at a single marshaling
//! boundary.

mod batch;
mod connection;
mod dispatch;
mod errors;
mod handler;
mod invocation;
mod local;
mod proxy;
mod reference;
mod registry;
mod retry;

pub use batch::BatchRequestQueue;
pub use connection::{Connection, Connector, OutgoingRequest, SendStatus};
pub use dispatch::{
    DispatchInterceptor, DispatchOutcome, DispatchPipeline, IncomingRequest, PendingDispatch,
};
pub use errors::{ErrantError, RequestFailedInfo, UserError};
pub use handler::{HandlerSlot, RequestHandler, RequestIdGenerator};
pub use invocation::{Invocation, InvocationCompletion, InvocationState};
pub use local::{LoopbackConnection, LoopbackConnector};
pub use proxy::Proxy;
pub use reference::{InvocationTimeout, OperationSpec, ProxyReference};
pub use registry::{
    Current, DeferredReply, LocatorCookie, Servant, ServantLocator, ServantMap, ServantRegistry,
    ServantResult,
};
pub use retry::RetryPolicy;

#[cfg(test)]
mod tests;
