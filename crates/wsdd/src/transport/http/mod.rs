// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-address HTTP endpoint.
//!
//! One nonblocking listener on `(addr, 5357)` plus a set of connections.
//! Each connection runs an `InHeader`/`InBody` state machine: the only
//! accepted request is `POST /<uuid>` with `Content-Type:
//! application/soap+xml` and a declared body length; the body is handed to
//! the protocol machine and the reply (or a stock error page) is written
//! back.

pub mod parser;
pub mod response;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

use self::parser::{HttpRequest, ParseOutcome, RequestParser};
use self::response::{HttpResponse, Status};
use crate::transport::WSD_HTTP_PORT;

/// Ceiling on request bodies. The head bound (8 KiB) does not apply to
/// bodies; this does.
const MAX_BODY_LEN: usize = 65536;

/// Read chunk size per connection.
const READ_BUF_LEN: usize = 8192;

/// Produces the SOAP reply for a complete request body, if any.
pub trait RequestHandler {
    fn handle(&mut self, body: &[u8]) -> Option<Vec<u8>>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&[u8]) -> Option<Vec<u8>>,
{
    fn handle(&mut self, body: &[u8]) -> Option<Vec<u8>> {
        self(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    InHeader,
    InBody,
}

/// What the pipeline wants after consuming input.
#[derive(Debug, PartialEq, Eq)]
pub struct FeedResult {
    /// Serialized response bytes to queue, if a response became due.
    pub output: Vec<u8>,
    /// Close the connection once the queued output is flushed.
    pub close: bool,
    /// A response is pending (true even for keep-alive).
    pub respond: bool,
}

/// The socket-free request/response state machine of one connection.
/// [`HttpConnection`] pairs it with a stream; tests drive it directly.
pub struct RequestPipeline {
    http_path: String,
    peer: String,
    state: PipelineState,
    parser: RequestParser,
    request: HttpRequest,
    content_remaining: usize,
    body: Vec<u8>,
    keep_alive: bool,
}

impl RequestPipeline {
    pub fn new(http_path: &str, peer: String) -> Self {
        Self {
            http_path: format!("/{}", http_path),
            peer,
            state: PipelineState::InHeader,
            parser: RequestParser::new(),
            request: HttpRequest::default(),
            content_remaining: 0,
            body: Vec::new(),
            keep_alive: false,
        }
    }

    /// Consume input until a response becomes due or the input runs out.
    /// Input left over after a response is dropped (no pipelining).
    pub fn feed(&mut self, mut input: &[u8], handler: &mut dyn RequestHandler) -> FeedResult {
        while !input.is_empty() {
            let (result, consumed) = match self.state {
                PipelineState::InHeader => self.feed_header(input),
                PipelineState::InBody => self.feed_body(input, handler),
            };
            match result {
                None => input = &input[consumed..],
                Some(result) => return result,
            }
        }
        FeedResult {
            output: Vec::new(),
            close: false,
            respond: false,
        }
    }

    fn feed_header(&mut self, input: &[u8]) -> (Option<FeedResult>, usize) {
        let (outcome, consumed) = self.parser.parse(&mut self.request, input);
        match outcome {
            ParseOutcome::Bad => {
                log::info!("HTTP from {}: bad HTTP request", self.peer);
                (Some(self.error(Status::BadRequest)), consumed)
            }
            ParseOutcome::Indeterminate => (None, consumed),
            ParseOutcome::Good => (self.validate_head(), consumed),
        }
    }

    /// Head-complete checks: method, path, Content-Length, Content-Type.
    fn validate_head(&mut self) -> Option<FeedResult> {
        log::debug!(
            "HTTP from {}: {} {}",
            self.peer,
            self.request.method,
            self.request.uri
        );

        if self.request.method != "POST" || self.request.uri != self.http_path {
            return Some(self.error(Status::NotFound));
        }

        let content_length = match self.request.content_length() {
            Ok(Some(length)) => length,
            Ok(None) | Err(_) => {
                log::info!("HTTP from {}: missing Content-Length header", self.peer);
                return Some(self.error(Status::BadRequest));
            }
        };
        if content_length > MAX_BODY_LEN {
            log::info!(
                "HTTP from {}: request body of {} bytes is too large",
                self.peer,
                content_length
            );
            return Some(self.error(Status::BadRequest));
        }

        match self.request.content_type() {
            Ok(Some(parts)) => {
                if parts.is_empty() || parts.len() > 2 || parts[0] != "application/soap+xml" {
                    log::info!(
                        "HTTP from {}: invalid Content-Type '{}'",
                        self.peer,
                        parts.join(",")
                    );
                    return Some(self.error(Status::BadRequest));
                }
                if parts.len() == 2 {
                    let Some(charset) = parts[1].strip_prefix("charset=") else {
                        log::info!(
                            "HTTP from {}: invalid Content-Type '{}'",
                            self.peer,
                            parts.join(",")
                        );
                        return Some(self.error(Status::BadRequest));
                    };
                    if !charset_is_supported(charset) {
                        log::info!("HTTP from {}: unsupported charset '{}'", self.peer, charset);
                        return Some(self.error(Status::BadRequest));
                    }
                }
            }
            Ok(None) | Err(_) => {
                log::info!("HTTP from {}: missing Content-Type header", self.peer);
                return Some(self.error(Status::BadRequest));
            }
        }

        self.keep_alive = self.request.keep_alive();
        self.content_remaining = content_length;
        self.body.clear();
        self.parser.reset();
        self.state = PipelineState::InBody;
        None
    }

    fn feed_body(
        &mut self,
        input: &[u8],
        handler: &mut dyn RequestHandler,
    ) -> (Option<FeedResult>, usize) {
        let chunk = input.len().min(self.content_remaining);
        self.body.extend_from_slice(&input[..chunk]);
        self.content_remaining -= chunk;

        if self.content_remaining > 0 {
            return (None, chunk);
        }

        // Body complete: well-formedness gate, then dispatch.
        let text = match std::str::from_utf8(&self.body) {
            Ok(text) => text,
            Err(_) => {
                log::info!("HTTP from {}: request body is not valid UTF-8", self.peer);
                return (Some(self.error(Status::BadRequest)), chunk);
            }
        };
        if roxmltree::Document::parse(text).is_err() {
            log::info!("HTTP from {}: XML is not well formed", self.peer);
            return (Some(self.error(Status::BadRequest)), chunk);
        }

        let reply = handler.handle(&self.body);
        let result = match reply {
            Some(payload) => {
                let close = !self.keep_alive;
                self.state = PipelineState::InHeader;
                self.request = HttpRequest::default();
                FeedResult {
                    output: HttpResponse::soap_reply(&payload).into_bytes(),
                    close,
                    respond: true,
                }
            }
            None => self.error(Status::BadRequest),
        };
        (Some(result), chunk)
    }

    fn error(&mut self, status: Status) -> FeedResult {
        FeedResult {
            output: HttpResponse::stock(status).into_bytes(),
            close: true,
            respond: true,
        }
    }
}

/// `utf-8` (and its strict subset) is what the push parser accepts.
fn charset_is_supported(charset: &str) -> bool {
    let trimmed = charset.trim_matches('"');
    trimmed.eq_ignore_ascii_case("utf-8") || trimmed.eq_ignore_ascii_case("us-ascii")
}

/// What the event loop should do with a connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    Keep,
    Close,
}

/// One accepted connection: a nonblocking stream plus its pipeline and
/// pending output.
pub struct HttpConnection {
    stream: mio::net::TcpStream,
    pipeline: RequestPipeline,
    write_buf: Vec<u8>,
    close_after_write: bool,
}

impl HttpConnection {
    fn new(stream: mio::net::TcpStream, peer: SocketAddr, http_path: &str) -> Self {
        Self {
            stream,
            pipeline: RequestPipeline::new(http_path, peer.ip().to_string()),
            write_buf: Vec::new(),
            close_after_write: false,
        }
    }

    pub fn source(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    /// Drain readable data through the pipeline, then flush whatever output
    /// became due.
    pub fn on_readable(&mut self, handler: &mut dyn RequestHandler) -> ConnAction {
        let mut buf = [0u8; READ_BUF_LEN];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return ConnAction::Close,
                Ok(len) => {
                    let result = self.pipeline.feed(&buf[..len], handler);
                    if result.respond {
                        self.write_buf.extend_from_slice(&result.output);
                        self.close_after_write = result.close;
                        match self.flush() {
                            ConnAction::Close => return ConnAction::Close,
                            // Closing but output still queued: wait for
                            // writability, stop reading.
                            ConnAction::Keep if self.close_after_write => return ConnAction::Keep,
                            // Keep-alive: go on reading the next request.
                            ConnAction::Keep => {}
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ConnAction::Keep,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::debug!("HTTP from {}, error reading: {}", self.pipeline.peer, err);
                    return ConnAction::Close;
                }
            }
        }
    }

    pub fn on_writable(&mut self) -> ConnAction {
        self.flush()
    }

    fn flush(&mut self) -> ConnAction {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return ConnAction::Close,
                Ok(written) => {
                    self.write_buf.drain(..written);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ConnAction::Keep,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::debug!("HTTP from {}, error writing: {}", self.pipeline.peer, err);
                    return ConnAction::Close;
                }
            }
        }
        if self.close_after_write {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            ConnAction::Close
        } else {
            ConnAction::Keep
        }
    }
}

/// The per-address HTTP endpoint: listener plus live connections.
pub struct HttpEndpoint {
    listener: mio::net::TcpListener,
    http_path: String,
    connections: HashMap<u64, HttpConnection>,
    next_conn_id: u64,
    local_addr: SocketAddr,
}

impl HttpEndpoint {
    pub fn new(http_path: &str, addr: IpAddr, scope_id: u32) -> io::Result<Self> {
        let bind_addr = match addr {
            IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), WSD_HTTP_PORT),
            IpAddr::V6(v6) => {
                SocketAddr::V6(std::net::SocketAddrV6::new(v6, WSD_HTTP_PORT, 0, scope_id))
            }
        };

        let domain = if bind_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if bind_addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(16)?;

        Ok(Self {
            listener: mio::net::TcpListener::from_std(socket.into()),
            http_path: http_path.to_owned(),
            connections: HashMap::new(),
            next_conn_id: 0,
            local_addr: bind_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        registry.register(&mut self.listener, token, mio::Interest::READABLE)
    }

    /// Deregister the listener and every connection, dropping them all.
    pub fn deregister(&mut self, registry: &mio::Registry) {
        let _ = registry.deregister(&mut self.listener);
        for (_, mut connection) in self.connections.drain() {
            let _ = registry.deregister(&mut connection.stream);
        }
    }

    /// Accept one pending connection. `None` when the backlog is drained.
    pub fn accept_one(&mut self) -> io::Result<Option<u64>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let id = self.next_conn_id;
                self.next_conn_id += 1;
                log::debug!("HTTP from {}, starting", peer.ip());
                self.connections
                    .insert(id, HttpConnection::new(stream, peer, &self.http_path));
                Ok(Some(id))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn connection_mut(&mut self, id: u64) -> Option<&mut HttpConnection> {
        self.connections.get_mut(&id)
    }

    pub fn close_connection(&mut self, id: u64, registry: &mio::Registry) {
        if let Some(mut connection) = self.connections.remove(&id) {
            log::debug!("HTTP from {}, stopping", connection.pipeline.peer);
            let _ = registry.deregister(&mut connection.stream);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
