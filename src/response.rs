//! The caller-visible response: an immutable header snapshot plus a lazy,
//! once-readable body stream that returns its connection to the pool when
//! fully drained.

use std::io::{self, Cursor, Read};
use std::sync::Arc;

use flate2::read::GzDecoder;
use url::Url;

use crate::cache::CacheSink;
use crate::engine::ResponseFraming;
use crate::headers::HeaderSnapshot;
use crate::pool::{Connection, ConnectionPool};
use crate::request::CancelCell;
use crate::transfer::{ChunkedReader, FixedLengthReader, UntilCloseReader};

pub(crate) enum FramingState {
    Fixed(FixedLengthReader),
    Chunked(ChunkedReader),
    UntilClose(UntilCloseReader),
    Empty,
}

impl FramingState {
    pub(crate) fn new(framing: ResponseFraming) -> Self {
        match framing {
            ResponseFraming::Fixed(length) => Self::Fixed(FixedLengthReader::new(length)),
            ResponseFraming::Chunked => Self::Chunked(ChunkedReader::new()),
            ResponseFraming::UntilClose => Self::UntilClose(UntilCloseReader::new()),
            ResponseFraming::Empty => Self::Empty,
        }
    }

    fn reusable_after_drain(&self) -> bool {
        !matches!(self, Self::UntilClose(_))
    }
}

/// Body stream reading straight off the pooled connection through the
/// transfer coder. Owns the connection until the body completes.
pub(crate) struct RawBody {
    framing: FramingState,
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    sink: Option<Box<dyn CacheSink>>,
    cancel: CancelCell,
    keep_alive: bool,
    finished: bool,
}

impl RawBody {
    pub(crate) fn new(
        framing: FramingState,
        conn: Connection,
        pool: Arc<ConnectionPool>,
        sink: Option<Box<dyn CacheSink>>,
        cancel: CancelCell,
        keep_alive: bool,
    ) -> Self {
        let mut body = Self {
            framing,
            conn: Some(conn),
            pool,
            sink,
            cancel,
            keep_alive,
            finished: false,
        };
        // A bodyless exchange is complete up front; park the connection
        // now rather than waiting for a read that may never come.
        if matches!(body.framing, FramingState::Empty) {
            body.finish();
        }
        body
    }

    /// Clean end of body: decide reuse, hand the socket back and commit
    /// the cache entry.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.cancel.forget_socket();
        if let Some(mut conn) = self.conn.take() {
            if !self.keep_alive || !self.framing.reusable_after_drain() {
                conn.mark_not_reusable();
            }
            // Reset to the client-wide default happens on next acquire.
            self.pool.release(conn);
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.flush();
        }
    }

    /// Failure path: the socket is poisoned and the cache entry aborted.
    fn poison(&mut self) {
        self.finished = true;
        self.cancel.forget_socket();
        if let Some(conn) = self.conn.take() {
            conn.shutdown();
        }
        if let Some(mut sink) = self.sink.take() {
            sink.abort();
        }
    }
}

impl Read for RawBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_canceled() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "request was disconnected",
            ));
        }
        if self.finished {
            return Ok(0);
        }
        let Some(conn) = self.conn.as_mut() else {
            self.finished = true;
            return Ok(0);
        };
        let result = match &mut self.framing {
            FramingState::Fixed(reader) => reader.read(conn.reader(), buf),
            FramingState::Chunked(reader) => reader.read(conn.reader(), buf),
            FramingState::UntilClose(reader) => reader.read(conn.reader(), buf),
            FramingState::Empty => Ok(0),
        };
        match result {
            Ok(0) => {
                self.finish();
                Ok(0)
            }
            Ok(read) => {
                if let Some(sink) = self.sink.as_mut()
                    && sink.write_all(&buf[..read]).is_err()
                    && let Some(mut sink) = self.sink.take()
                {
                    sink.abort();
                }
                Ok(read)
            }
            Err(error) => {
                self.poison();
                Err(error)
            }
        }
    }
}

impl Drop for RawBody {
    fn drop(&mut self) {
        if !self.finished {
            self.poison();
        }
    }
}

pub(crate) enum BodyReader {
    Plain(RawBody),
    Gzip(Box<GzDecoder<RawBody>>),
    Cached(Cursor<Vec<u8>>),
}

/// A received response. The body is exposed through `Read`; it can be
/// consumed exactly once and completes the underlying connection's
/// exchange when drained.
pub struct Response {
    status: i32,
    reason: String,
    status_line: String,
    url: Url,
    headers: HeaderSnapshot,
    sequence_number: u64,
    from_cache: bool,
    body: BodyReader,
}

impl Response {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: i32,
        reason: String,
        status_line: String,
        url: Url,
        headers: HeaderSnapshot,
        sequence_number: u64,
        from_cache: bool,
        body: BodyReader,
    ) -> Self {
        Self {
            status,
            reason,
            status_line,
            url,
            headers,
            sequence_number,
            from_cache,
            body,
        }
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderSnapshot {
        &self.headers
    }

    /// `Content-Encoding` as visible to the caller. `None` when the engine
    /// negotiated gzip itself and decoded the body transparently.
    pub fn content_encoding(&self) -> Option<&str> {
        self.headers.get(Some("Content-Encoding"))
    }

    /// Sequence number of this exchange on its physical socket: 0 for a
    /// fresh connection, incrementing with each reuse.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn connection_reused(&self) -> bool {
        self.sequence_number > 0
    }

    pub fn was_cached(&self) -> bool {
        self.from_cache
    }

    /// Reads the whole remaining body into a `Vec`.
    pub fn read_body(&mut self) -> crate::Result<Vec<u8>> {
        let mut body = Vec::new();
        self.read_to_end(&mut body)
            .map_err(|source| crate::error::Error::Io { source })?;
        Ok(body)
    }
}

impl Read for Response {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.body {
            BodyReader::Plain(raw) => raw.read(buf),
            BodyReader::Gzip(decoder) => {
                let read = decoder.read(buf)?;
                if read == 0 {
                    // The gzip trailer can end short of the framing end;
                    // drain the remainder so the connection is reusable.
                    let raw = decoder.get_mut();
                    let mut scratch = [0_u8; 512];
                    while raw.read(&mut scratch)? > 0 {}
                }
                Ok(read)
            }
            BodyReader::Cached(cursor) => cursor.read(buf),
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("url", &self.url.as_str())
            .field("sequence_number", &self.sequence_number)
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}
