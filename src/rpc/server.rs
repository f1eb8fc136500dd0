//! Threaded RPC server.
//!
//! One acceptor thread takes connections, one reader thread per connection
//! parses frames, and a shared worker pool executes the calls. The reply is
//! written back on the connection the request arrived on; since clients keep
//! their connections strictly request/reply there is never more than one
//! reply in flight per connection.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use parking_lot::Mutex;
use rmpv::Value;
use threadpool::ThreadPool;

use super::{codec, Handler, DEFAULT_WORKERS, TAG_EXCEPTION, TAG_NORMAL, TAG_TOKEN_ERROR};
use crate::error::{Error, Result};

/// RPC server exposing one service instance to any number of clients.
///
/// The service's methods may be invoked from all worker threads at once, so
/// implementations must be internally thread-safe.
#[derive(Debug)]
pub struct Server<H> {
    service: Arc<H>,
    token: String,
    workers: usize,
}

impl<H: Handler> Server<H> {
    pub fn new(service: H, token: impl Into<String>) -> Self {
        Server {
            service: Arc::new(service),
            token: token.into(),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Override the number of worker threads handling calls.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Bind the endpoint and start serving in background threads.
    pub fn bind(self, endpoint: impl ToSocketAddrs) -> Result<ServerHandle> {
        let listener = TcpListener::bind(endpoint)?;
        let addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);

        let service = self.service;
        let token = Arc::new(self.token);
        let pool = ThreadPool::new(self.workers);

        let accept_thread = std::thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }

                match stream {
                    Ok(stream) => {
                        spawn_reader(Arc::clone(&service), Arc::clone(&token), pool.clone(), stream)
                    }
                    Err(e) => {
                        warn!("failed to accept rpc connection: {e}");
                        break;
                    }
                }
            }
        });

        Ok(ServerHandle {
            addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }
}

/// Handle to a running server; dropping it stops accepting connections.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Poke the listener so the accept loop observes the flag.
        let _ = TcpStream::connect(self.addr);

        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

fn spawn_reader<H: Handler>(
    service: Arc<H>,
    token: Arc<String>,
    pool: ThreadPool,
    stream: TcpStream,
) {
    std::thread::spawn(move || {
        let writer = match stream.try_clone() {
            Ok(writer) => Arc::new(Mutex::new(writer)),
            Err(e) => {
                warn!("failed to clone rpc connection: {e}");
                return;
            }
        };

        let mut reader = stream;
        loop {
            let frame = match codec::read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    debug!("dropping rpc connection: {e}");
                    break;
                }
            };

            let service = Arc::clone(&service);
            let token = Arc::clone(&token);
            let writer = Arc::clone(&writer);

            pool.execute(move || {
                let reply = handle_request(&*service, token.as_str(), frame);
                let mut writer = writer.lock();
                if let Err(e) = codec::write_frame(&mut *writer, &reply) {
                    warn!("failed to write rpc reply: {e}");
                }
            });
        }
    });
}

/// Decode one request, run it, and build the reply frame.
fn handle_request<H: Handler>(service: &H, token: &str, frame: Value) -> Value {
    let mut parts = match frame {
        Value::Array(parts) if parts.len() >= 2 => parts,
        _ => return exception_reply(&Error::Protocol("malformed request frame".to_string())),
    };

    let args = parts.split_off(2);
    let method = parts.pop().unwrap_or(Value::Nil);
    let request_token = parts.pop().unwrap_or(Value::Nil);

    if request_token.as_str() != Some(token) {
        return Value::Array(vec![Value::from(TAG_TOKEN_ERROR), Value::Nil]);
    }

    let result = match &method {
        // A nil method is a ping; it only verifies token and liveness.
        Value::Nil => Ok(Value::Nil),
        Value::String(_) => match method.as_str() {
            Some(name) => service.handle(name, args),
            None => Err(Error::Protocol("method name is not valid UTF-8".to_string())),
        },
        _ => Err(Error::Protocol("method name must be a string or nil".to_string())),
    };

    match result {
        Ok(value) => Value::Array(vec![Value::from(TAG_NORMAL), value]),
        Err(e) => exception_reply(&e),
    }
}

fn exception_reply(error: &Error) -> Value {
    let payload = codec::to_value(&error.to_remote()).unwrap_or(Value::Nil);
    Value::Array(vec![Value::from(TAG_EXCEPTION), payload])
}
