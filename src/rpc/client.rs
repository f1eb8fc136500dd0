//! Pooled RPC client.
//!
//! Connections are created lazily and checked out per call, so concurrent
//! callers never share one and every connection carries strictly paired
//! request/reply traffic. A connection that sees any failure (including a
//! timeout) is discarded instead of returned to the pool, because a late
//! reply would otherwise desynchronize the next call on it.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::{debug, log_enabled, Level};
use parking_lot::Mutex;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{codec, TAG_EXCEPTION, TAG_NORMAL, TAG_TOKEN_ERROR};
use crate::error::{Error, RemoteError, Result};

/// RPC client for one service endpoint.
#[derive(Debug)]
pub struct Client {
    endpoint: String,
    token: String,
    timeout: Option<Duration>,
    pool: Mutex<Vec<TcpStream>>,
}

impl Client {
    /// Create a client for `endpoint` (`host:port`).
    ///
    /// The timeout applies to every send and receive; `None` waits forever,
    /// which is what the file system hot path uses since a slow local disk
    /// must not look like a network failure.
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Client {
            endpoint: endpoint.into(),
            token: token.into(),
            timeout,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Check that the service is reachable and accepts our token.
    ///
    /// Uses the constructor timeout unless one is given here; mount setup
    /// pings with a short timeout before committing to the session.
    pub fn ping(&self, timeout: Option<Duration>) -> Result<()> {
        self.call_value(None, Vec::new(), timeout.or(self.timeout))?;
        Ok(())
    }

    /// Invoke `method` with positional arguments and decode the result.
    ///
    /// `args` is usually a tuple; it serializes as the argument sequence of
    /// the call. The unit value sends no arguments.
    pub fn call<A: Serialize, R: DeserializeOwned>(&self, method: &str, args: A) -> Result<R> {
        self.call_with_timeout(method, args, self.timeout)
    }

    /// Like [`call`](Self::call) with an explicit timeout for this call only.
    pub fn call_with_timeout<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: A,
        timeout: Option<Duration>,
    ) -> Result<R> {
        let args = match codec::to_value(&args)? {
            Value::Nil => Vec::new(),
            Value::Array(items) => items,
            single => vec![single],
        };

        let started = Instant::now();
        let value = self.call_value(Some(method), args, timeout)?;

        if log_enabled!(Level::Debug) {
            debug!("rpc::{method} - {} ms", started.elapsed().as_millis());
        }

        codec::from_value(value)
    }

    fn call_value(
        &self,
        method: Option<&str>,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let mut stream = self.checkout(timeout)?;

        let mut frame = Vec::with_capacity(args.len() + 2);
        frame.push(Value::from(self.token.as_str()));
        frame.push(method.map_or(Value::Nil, Value::from));
        frame.extend(args);

        let reply = (|| {
            codec::write_frame(&mut stream, &Value::Array(frame))?;
            codec::read_frame(&mut stream)
        })();

        let reply = match reply {
            Ok(reply) => reply,
            // The connection is poisoned after any failure; a late reply
            // would be paired with the wrong request.
            Err(e) => return Err(map_transport_error(e)),
        };

        self.checkin(stream);
        decode_reply(reply)
    }

    fn checkout(&self, timeout: Option<Duration>) -> Result<TcpStream> {
        let pooled = self.pool.lock().pop();

        let stream = match pooled {
            Some(stream) => stream,
            None => TcpStream::connect(&self.endpoint)?,
        };

        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;

        Ok(stream)
    }

    fn checkin(&self, stream: TcpStream) {
        self.pool.lock().push(stream);
    }

    /// Number of pooled (idle) connections.
    #[cfg(test)]
    pub(crate) fn pooled_connections(&self) -> usize {
        self.pool.lock().len()
    }
}

fn map_transport_error(error: Error) -> Error {
    match error {
        Error::Io(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "rpc call timed out",
            ))
        }
        other => other,
    }
}

fn decode_reply(reply: Value) -> Result<Value> {
    let mut parts = match reply {
        Value::Array(parts) if parts.len() == 2 => parts,
        _ => return Err(Error::Protocol("malformed reply frame".to_string())),
    };

    let value = parts.pop().unwrap_or(Value::Nil);
    let tag = parts.pop().and_then(|t| t.as_i64());

    match tag {
        Some(TAG_NORMAL) => Ok(value),
        Some(TAG_EXCEPTION) => Err(Error::Remote(codec::from_value::<RemoteError>(value)?)),
        Some(TAG_TOKEN_ERROR) => Err(Error::InvalidToken),
        _ => Err(Error::Protocol("unexpected reply tag".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{unknown_method, Handler, Server};

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, method: &str, args: Vec<Value>) -> Result<Value> {
            match method {
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Nil)),
                _ => Err(unknown_method(method)),
            }
        }
    }

    #[test]
    fn connections_are_reused_between_sequential_calls() {
        let server = Server::new(Echo, "t").bind("127.0.0.1:0").unwrap();
        let client = Client::new(
            server.local_addr().to_string(),
            "t",
            Some(Duration::from_secs(5)),
        );

        for i in 0..3i64 {
            let back: i64 = client.call("echo", (i,)).unwrap();
            assert_eq!(back, i);
        }

        assert_eq!(client.pooled_connections(), 1);
    }
}
