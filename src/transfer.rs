//! Request/response body framing: fixed-length, chunked and
//! end-of-stream coders.
//!
//! Readers surface framing violations as `io::Error` so they compose with
//! the blocking `Read` the response body exposes; truncated bodies map to
//! `UnexpectedEof` and malformed chunk metadata to `InvalidData`.

use std::io::{self, BufRead, Read, Write};

/// Default chunk payload size when the caller asked for chunked streaming
/// without a usable wire budget.
pub(crate) const DEFAULT_CHUNK_PAYLOAD: usize = 1024;

/// Converts a caller-declared chunk wire budget into the payload bytes per
/// chunk. The budget counts the whole chunk: hex size token, the two CRLFs
/// and the payload. A budget of 8 therefore carries 3 payload bytes.
pub(crate) fn chunk_payload_for_budget(wire_budget: usize) -> usize {
    if wire_budget == 0 {
        return DEFAULT_CHUNK_PAYLOAD;
    }
    let mut payload = wire_budget.saturating_sub(4).max(1);
    while payload > 1 && payload + hex_digits(payload) + 4 > wire_budget {
        payload -= 1;
    }
    payload
}

fn hex_digits(value: usize) -> usize {
    let mut digits = 1;
    let mut rest = value >> 4;
    while rest > 0 {
        digits += 1;
        rest >>= 4;
    }
    digits
}

/// Writer that emits exactly `expected` bytes with no framing.
pub(crate) struct FixedLengthWriter {
    expected: u64,
    written: u64,
}

impl FixedLengthWriter {
    pub(crate) fn new(expected: u64) -> Self {
        Self {
            expected,
            written: 0,
        }
    }

    pub(crate) fn write<W: Write + ?Sized>(&mut self, sink: &mut W, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.expected - self.written;
        if (buf.len() as u64) > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "fixed-length body overflow: declared {} bytes, would write {}",
                    self.expected,
                    self.written + buf.len() as u64
                ),
            ));
        }
        sink.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    pub(crate) fn finish<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        if self.written != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "fixed-length body underflow: declared {} bytes, wrote {}",
                    self.expected, self.written
                ),
            ));
        }
        sink.flush()
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.written
    }
}

/// Writer that frames the body as `<hex>\r\n<payload>\r\n` chunks and a
/// terminating zero chunk. Payload is buffered up to the per-chunk budget.
pub(crate) struct ChunkedWriter {
    payload_budget: usize,
    buffer: Vec<u8>,
    written: u64,
}

impl ChunkedWriter {
    pub(crate) fn new(wire_budget: usize) -> Self {
        Self {
            payload_budget: chunk_payload_for_budget(wire_budget),
            buffer: Vec::new(),
            written: 0,
        }
    }

    pub(crate) fn write<W: Write + ?Sized>(&mut self, sink: &mut W, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.payload_budget - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.payload_budget {
                self.emit_chunk(sink)?;
            }
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    pub(crate) fn flush<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        self.emit_chunk(sink)?;
        sink.flush()
    }

    pub(crate) fn finish<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        self.emit_chunk(sink)?;
        sink.write_all(b"0\r\n\r\n")?;
        sink.flush()
    }

    fn emit_chunk<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        write!(sink, "{:x}\r\n", self.buffer.len())?;
        sink.write_all(&self.buffer)?;
        sink.write_all(b"\r\n")?;
        self.buffer.clear();
        Ok(())
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.written
    }
}

/// Reader that stops after `remaining` bytes regardless of socket state.
/// Peer close before the declared length is a hard error; extra bytes past
/// the declared length are left unread, by design.
pub(crate) struct FixedLengthReader {
    remaining: u64,
}

impl FixedLengthReader {
    pub(crate) fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    pub(crate) fn read<R: Read>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let limit = (buf.len() as u64).min(self.remaining) as usize;
        let read = source.read(&mut buf[..limit])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "connection closed with {} content-length bytes outstanding",
                    self.remaining
                ),
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

/// Reader for `Transfer-Encoding: chunked` bodies.
pub(crate) struct ChunkedReader {
    chunk_remaining: u64,
    done: bool,
}

impl ChunkedReader {
    pub(crate) fn new() -> Self {
        Self {
            chunk_remaining: 0,
            done: false,
        }
    }

    pub(crate) fn read<R: BufRead>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        if self.chunk_remaining == 0 {
            self.begin_chunk(source)?;
            if self.done {
                return Ok(0);
            }
        }
        let limit = (buf.len() as u64).min(self.chunk_remaining) as usize;
        let read = source.read(&mut buf[..limit])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-chunk before the terminating zero chunk",
            ));
        }
        self.chunk_remaining -= read as u64;
        if self.chunk_remaining == 0 {
            consume_crlf(source)?;
        }
        Ok(read)
    }

    fn begin_chunk<R: BufRead>(&mut self, source: &mut R) -> io::Result<()> {
        let line = read_line(source)?;
        let token = line
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_owned();
        if token.is_empty() || !token.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected a hex chunk size, got {line:?}"),
            ));
        }
        let size = u64::from_str_radix(&token, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size out of range"))?;
        if size == 0 {
            self.done = true;
            self.skip_trailers(source)?;
            return Ok(());
        }
        self.chunk_remaining = size;
        Ok(())
    }

    // Trailer headers are read and discarded up to the blank line.
    fn skip_trailers<R: BufRead>(&mut self, source: &mut R) -> io::Result<()> {
        loop {
            let line = read_line(source)?;
            if line.is_empty() {
                return Ok(());
            }
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }
}

/// Reader for bodies with no framing: everything until the peer closes.
pub(crate) struct UntilCloseReader {
    saw_eof: bool,
}

impl UntilCloseReader {
    pub(crate) fn new() -> Self {
        Self { saw_eof: false }
    }

    pub(crate) fn read<R: Read>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if self.saw_eof {
            return Ok(0);
        }
        let read = source.read(buf)?;
        if read == 0 {
            self.saw_eof = true;
        }
        Ok(read)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.saw_eof
    }
}

/// Reads one CRLF-terminated line, without the terminator. A bare LF is
/// tolerated the way lenient HTTP/1.1 parsers treat it.
pub(crate) fn read_line<R: BufRead>(source: &mut R) -> io::Result<String> {
    let mut raw = Vec::new();
    let read = source.read_until(b'\n', &mut raw)?;
    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed while expecting a line",
        ));
    }
    if raw.last() == Some(&b'\n') {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    }
    String::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "line is not valid utf-8"))
}

fn consume_crlf<R: BufRead>(source: &mut R) -> io::Result<()> {
    let mut terminator = [0_u8; 2];
    let mut read = 0;
    while read < terminator.len() {
        let got = source.read(&mut terminator[read..])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunk terminator",
            ));
        }
        read += got;
    }
    if &terminator != b"\r\n" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk data not followed by CRLF",
        ));
    }
    Ok(())
}
