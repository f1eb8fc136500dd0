//! RPC transport used between the local and remote side of a session.
//!
//! The file system lives and dies by call latency, which rules out the usual
//! HTTP-shaped RPC stacks, and schema compilers are a poor fit for a protocol
//! that only ever talks to itself. What ships here instead is a small framed
//! protocol over TCP: a request is `[token, method-or-nil, args...]`, a reply
//! is `[tag, value]`, both encoded as MessagePack (see [`codec`]).
//!
//! The [`server`] accepts connections and fans requests out to a fixed pool
//! of worker threads over an in-process queue, so unrelated calls proceed in
//! parallel while each connection stays strictly request/reply. The
//! [`client`] keeps a pool of connections and hands one to each concurrent
//! caller; a connection is never shared between two in-flight calls. Every
//! request carries the session token because connections hold no state.
//!
//! Authentication failures, transported exceptions and timeouts all surface
//! through [`crate::error::Error`].

pub mod client;
pub mod codec;
pub mod server;

pub use client::Client;
pub use server::{Server, ServerHandle};

use rmpv::Value;

use crate::error::{Error, ErrorKind, RemoteError, Result};

/// Reply tag: the call succeeded and the payload is its return value.
pub(crate) const TAG_NORMAL: i64 = 0;
/// Reply tag: the call failed and the payload is the transported error.
pub(crate) const TAG_EXCEPTION: i64 = 1;
/// Reply tag: the request token did not match the server's.
pub(crate) const TAG_TOKEN_ERROR: i64 = 2;

/// Number of worker threads a server starts by default.
pub const DEFAULT_WORKERS: usize = 4;

/// A service that can be exposed by a [`Server`].
///
/// Implementations dispatch on the method name, decode the positional
/// arguments with [`codec::args`], and encode the result with
/// [`codec::to_value`]. The set of methods is fixed per service; an
/// unrecognized name must be answered with [`unknown_method`].
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, method: &str, args: Vec<Value>) -> Result<Value>;
}

/// The error a service returns for a method it does not expose.
pub fn unknown_method(method: &str) -> Error {
    Error::Remote(RemoteError::new(
        ErrorKind::Protocol,
        format!("unknown method '{method}'"),
    ))
}
