//! The stateful request handle: configure, optionally stream a body, then
//! take the response. State only moves forward; mutating a phase that has
//! already passed is a state error, not a silent no-op.

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use url::Url;

use crate::Result;
use crate::client::ClientInner;
use crate::controller::{self, CallSpec, Established};
use crate::engine::{self, HeadBody, RequestHead, SentHead};
use crate::error::Error;
use crate::headers::Headers;
use crate::pool::Connection;
use crate::response::Response;
use crate::transfer::{ChunkedWriter, FixedLengthWriter};
use crate::util::lock_unpoisoned;

#[derive(Default)]
struct CancelState {
    canceled: bool,
    socket: Option<TcpStream>,
}

/// Shared cancellation flag plus the socket currently carrying the
/// request. Cancelling shuts the socket down so a blocked read or write
/// unblocks promptly instead of waiting for a timeout.
#[derive(Clone, Default)]
pub(crate) struct CancelCell {
    inner: Arc<Mutex<CancelState>>,
}

impl CancelCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, socket: TcpStream) {
        let mut state = lock_unpoisoned(&self.inner);
        if state.canceled {
            let _ = socket.shutdown(Shutdown::Both);
            return;
        }
        state.socket = Some(socket);
    }

    pub(crate) fn forget_socket(&self) {
        lock_unpoisoned(&self.inner).socket = None;
    }

    pub(crate) fn cancel(&self) {
        let mut state = lock_unpoisoned(&self.inner);
        state.canceled = true;
        if let Some(socket) = state.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        lock_unpoisoned(&self.inner).canceled
    }
}

/// Clonable handle for aborting an in-flight request from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    cell: CancelCell,
}

impl CancelHandle {
    /// Aborts the request. Any blocked body read or write fails promptly
    /// and the request's connection is never returned to the pool.
    pub fn cancel(&self) {
        self.cell.cancel();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Buffered,
    FixedStream(u64),
    ChunkedStream(usize),
}

enum StreamCoder {
    Fixed(FixedLengthWriter),
    Chunked(ChunkedWriter),
}

/// A connection carrying a request whose body is going out incrementally.
struct StreamingExchange {
    conn: Connection,
    coder: StreamCoder,
    sent: SentHead,
    sequence: u64,
}

enum Stage {
    Prepared { body: Option<Vec<u8>> },
    Streaming(Box<StreamingExchange>),
    Finished,
}

/// A single logical HTTP request. Obtained from
/// [`HttpClient::open`](crate::client::HttpClient::open), configured while
/// still in the prepared phase, and consumed by [`Request::response`].
pub struct Request {
    client: Arc<ClientInner>,
    method: String,
    url: Url,
    headers: Headers,
    follow_redirects: bool,
    body_mode: BodyMode,
    cancel: CancelCell,
    stage: Stage,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub(crate) fn new(client: Arc<ClientInner>, url: Url) -> Self {
        Self {
            client,
            method: "GET".to_owned(),
            url,
            headers: Headers::new(),
            follow_redirects: true,
            body_mode: BodyMode::Buffered,
            cancel: CancelCell::new(),
            stage: Stage::Prepared { body: None },
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, method: &str) -> Result<&mut Self> {
        self.ensure_prepared("method")?;
        self.method = method.to_owned();
        Ok(self)
    }

    /// Appends a header without replacing earlier values of the same name.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        self.ensure_prepared("headers")?;
        self.headers.add(name, value);
        Ok(self)
    }

    /// Replaces every value of `name` with a single one.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        self.ensure_prepared("headers")?;
        self.headers.set(name, value);
        Ok(self)
    }

    /// The headers as configured so far. Like the mutators, this is only
    /// available before the request head is sent; afterwards the handle no
    /// longer reflects what went on the wire.
    pub fn request_headers(&self) -> Result<&Headers> {
        match self.stage {
            Stage::Prepared { .. } => Ok(&self.headers),
            _ => Err(Error::state(
                "request headers are unavailable after the request head was sent",
            )),
        }
    }

    pub fn set_follow_redirects(&mut self, follow: bool) -> Result<&mut Self> {
        self.ensure_prepared("redirect policy")?;
        self.follow_redirects = follow;
        Ok(self)
    }

    /// Declares an exact body length up front so it streams out without
    /// buffering. The body becomes non-replayable; a response that would
    /// normally be retried internally fails instead.
    pub fn set_fixed_length_streaming(&mut self, length: u64) -> Result<&mut Self> {
        self.ensure_prepared("streaming mode")?;
        if self.body_mode != BodyMode::Buffered {
            return Err(Error::state("a streaming mode is already set"));
        }
        self.body_mode = BodyMode::FixedStream(length);
        Ok(self)
    }

    /// Streams the body with chunked transfer-coding. `wire_budget` caps
    /// the size of each chunk as it appears on the wire, size token and
    /// CRLFs included; `0` picks a default payload size.
    pub fn set_chunked_streaming(&mut self, wire_budget: usize) -> Result<&mut Self> {
        self.ensure_prepared("streaming mode")?;
        if self.body_mode != BodyMode::Buffered {
            return Err(Error::state("a streaming mode is already set"));
        }
        self.body_mode = BodyMode::ChunkedStream(wire_budget);
        Ok(self)
    }

    /// Handle for aborting this request from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cell: self.cancel.clone(),
        }
    }

    /// Aborts the request in place.
    pub fn disconnect(&mut self) {
        self.cancel.cancel();
    }

    /// Opens the request body for writing. Asking for a body turns a GET
    /// into a POST. In the default buffered mode the bytes are held in
    /// memory and the request stays replayable; in a streaming mode this
    /// connects and transmits the request head immediately.
    pub fn body_writer(&mut self) -> Result<BodyWriter<'_>> {
        if self.cancel.is_canceled() {
            return Err(Error::state("request was disconnected"));
        }
        if matches!(self.stage, Stage::Finished) {
            return Err(Error::state("response already taken"));
        }
        if matches!(self.method.as_str(), "GET" | "HEAD") {
            self.method = "POST".to_owned();
        }
        if let Stage::Prepared { body } = &mut self.stage
            && self.body_mode == BodyMode::Buffered
        {
            body.get_or_insert_with(Vec::new);
            return Ok(BodyWriter { request: self });
        }
        if matches!(self.stage, Stage::Prepared { .. }) {
            self.begin_streaming()?;
        }
        Ok(BodyWriter { request: self })
    }

    fn begin_streaming(&mut self) -> Result<()> {
        let mut proxy_authorization = None;
        let Established { mut conn, via_proxy } = controller::establish(
            &self.client,
            &self.url,
            &mut proxy_authorization,
            false,
            &self.cancel,
        )?;
        let sequence = conn.next_sequence_number();
        let (head_body, coder) = match self.body_mode {
            BodyMode::FixedStream(length) => (
                HeadBody::FixedStream(length),
                StreamCoder::Fixed(FixedLengthWriter::new(length)),
            ),
            BodyMode::ChunkedStream(wire_budget) => (
                HeadBody::ChunkedStream,
                StreamCoder::Chunked(ChunkedWriter::new(wire_budget)),
            ),
            BodyMode::Buffered => return Err(Error::state("buffered body cannot stream")),
        };
        let head = RequestHead {
            method: &self.method,
            url: &self.url,
            headers: &self.headers,
            via_proxy,
            user_agent: &self.client.user_agent,
            body: head_body,
        };
        let sent = engine::write_request_head(&mut conn, &head)?;
        self.stage = Stage::Streaming(Box::new(StreamingExchange {
            conn,
            coder,
            sent,
            sequence,
        }));
        Ok(())
    }

    /// Executes the request and returns the response, following redirects
    /// and answering authentication challenges for replayable bodies.
    /// Consumes the handle's forward progress; a second call is an error.
    pub fn response(&mut self) -> Result<Response> {
        if self.cancel.is_canceled() {
            return Err(Error::state("request was disconnected"));
        }
        match std::mem::replace(&mut self.stage, Stage::Finished) {
            Stage::Prepared { body } => {
                let spec = CallSpec {
                    method: self.method.clone(),
                    url: self.url.clone(),
                    headers: self.headers.clone(),
                    body: body.map(Bytes::from),
                    follow_redirects: self.follow_redirects,
                    cancel: self.cancel.clone(),
                };
                controller::execute(&self.client, spec)
            }
            Stage::Streaming(exchange) => self.finish_streamed(*exchange),
            Stage::Finished => Err(Error::state("response already taken")),
        }
    }

    fn finish_streamed(&mut self, exchange: StreamingExchange) -> Result<Response> {
        let StreamingExchange {
            mut conn,
            mut coder,
            sent,
            sequence,
        } = exchange;
        let result = match &mut coder {
            StreamCoder::Fixed(writer) => writer.finish(conn.writer()),
            StreamCoder::Chunked(writer) => writer.finish(conn.writer()),
        };
        if let Err(source) = result {
            conn.shutdown();
            if matches!(source.kind(), io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput) {
                return Err(Error::state(source.to_string()));
            }
            return Err(Error::Io { source });
        }

        let raw = engine::read_response_head(&mut conn, self.client.read_timeout)?;
        controller::streamed_retry_check(
            &self.client,
            &self.method,
            &self.url,
            &raw,
            self.follow_redirects,
        )
        .inspect_err(|_| conn.shutdown())?;

        let keep_alive = engine::response_keeps_alive(&raw, sent.request_close);
        let framing = engine::response_framing(&self.method, &raw, keep_alive);
        Ok(controller::build_response(
            &self.client,
            &self.method,
            self.url.clone(),
            conn,
            raw,
            sent,
            keep_alive,
            framing,
            sequence,
            &self.cancel,
        ))
    }

    fn ensure_prepared(&self, what: &str) -> Result<()> {
        match self.stage {
            Stage::Prepared { .. } => Ok(()),
            Stage::Streaming(_) => Err(Error::state(format!(
                "cannot change {what} after the request head was sent"
            ))),
            Stage::Finished => Err(Error::state(format!(
                "cannot change {what} after the response was taken"
            ))),
        }
    }
}

/// `Write` view over the request body. Buffered bodies accumulate in
/// memory; streamed bodies go straight through the transfer coder onto
/// the connection.
pub struct BodyWriter<'a> {
    request: &'a mut Request,
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.request.cancel.is_canceled() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "request was disconnected",
            ));
        }
        match &mut self.request.stage {
            Stage::Prepared { body: Some(body) } => {
                body.extend_from_slice(buf);
                Ok(buf.len())
            }
            Stage::Streaming(exchange) => {
                let StreamingExchange { conn, coder, .. } = exchange.as_mut();
                match coder {
                    StreamCoder::Fixed(writer) => writer.write(conn.writer(), buf),
                    StreamCoder::Chunked(writer) => writer.write(conn.writer(), buf),
                }
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "request body is not writable",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.request.stage {
            Stage::Streaming(exchange) => {
                let StreamingExchange { conn, coder, .. } = exchange.as_mut();
                match coder {
                    StreamCoder::Fixed(_) => conn.flush(),
                    StreamCoder::Chunked(writer) => writer.flush(conn.writer()),
                }
            }
            _ => Ok(()),
        }
    }
}
