//! The HTTP/1.1 protocol state machine: request head/body transmission,
//! status-line and header parsing, and response framing selection.

use std::time::Duration;

use url::Url;

use crate::Result;
use crate::error::Error;
use crate::headers::Headers;
use crate::pool::Connection;
use crate::transfer::{ChunkedReader, FixedLengthReader, read_line};
use crate::util::{host_header_value, request_target};

/// Body intent for the head being written.
pub(crate) enum HeadBody<'a> {
    None,
    Buffered(&'a [u8]),
    FixedStream(u64),
    ChunkedStream,
}

/// Everything needed to serialize one request head.
pub(crate) struct RequestHead<'a> {
    pub(crate) method: &'a str,
    pub(crate) url: &'a Url,
    pub(crate) headers: &'a Headers,
    pub(crate) via_proxy: bool,
    pub(crate) user_agent: &'a str,
    pub(crate) body: HeadBody<'a>,
}

/// What the engine decided while writing the head.
pub(crate) struct SentHead {
    /// The engine added `Accept-Encoding: gzip` itself, so a gzip response
    /// is decoded transparently and the encoding hidden from the caller.
    pub(crate) transparent_gzip: bool,
    /// The caller asked for `Connection: close`.
    pub(crate) request_close: bool,
}

/// Writes the request line, caller headers, engine defaults and, for a
/// buffered body, the body itself. Streamed bodies are written by the
/// caller through a transfer coder afterwards.
pub(crate) fn write_request_head(conn: &mut Connection, head: &RequestHead<'_>) -> Result<SentHead> {
    let mut wire = String::new();
    wire.push_str(head.method);
    wire.push(' ');
    wire.push_str(&request_target(head.url, head.via_proxy));
    wire.push_str(" HTTP/1.1\r\n");

    for (name, value) in head.headers.iter() {
        wire.push_str(name);
        wire.push_str(": ");
        wire.push_str(value);
        wire.push_str("\r\n");
    }

    if !head.headers.contains("Host") {
        wire.push_str("Host: ");
        wire.push_str(&host_header_value(head.url)?);
        wire.push_str("\r\n");
    }
    if !head.headers.contains("User-Agent") {
        wire.push_str("User-Agent: ");
        wire.push_str(head.user_agent);
        wire.push_str("\r\n");
    }
    let transparent_gzip = !head.headers.contains("Accept-Encoding");
    if transparent_gzip {
        wire.push_str("Accept-Encoding: gzip\r\n");
    }
    if head.via_proxy && !head.headers.contains("Proxy-Connection") {
        wire.push_str("Proxy-Connection: Keep-Alive\r\n");
    }
    match head.body {
        HeadBody::None => {}
        HeadBody::Buffered(body) => {
            if !head.headers.contains("Content-Length") {
                wire.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
        }
        HeadBody::FixedStream(length) => {
            if !head.headers.contains("Content-Length") {
                wire.push_str(&format!("Content-Length: {length}\r\n"));
            }
        }
        HeadBody::ChunkedStream => {
            if !head.headers.contains("Transfer-Encoding") {
                wire.push_str("Transfer-Encoding: chunked\r\n");
            }
        }
    }
    wire.push_str("\r\n");

    tracing::debug!(
        method = head.method,
        url = %head.url,
        via_proxy = head.via_proxy,
        "sending request"
    );
    conn.write_all(wire.as_bytes()).map_err(io_to_error)?;
    if let HeadBody::Buffered(body) = head.body {
        conn.write_all(body).map_err(io_to_error)?;
    }
    conn.flush().map_err(io_to_error)?;

    let request_close = head
        .headers
        .get("Connection")
        .is_some_and(|value| value.eq_ignore_ascii_case("close"));
    Ok(SentHead {
        transparent_gzip,
        request_close,
    })
}

fn io_to_error(source: std::io::Error) -> Error {
    Error::Io { source }
}

/// A parsed status line plus the response headers.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub(crate) status: i32,
    pub(crate) reason: String,
    pub(crate) status_line: String,
    pub(crate) version_minor: u8,
    pub(crate) headers: Headers,
}

/// Reads and parses the response head, skipping interim 1xx responses.
pub(crate) fn read_response_head(
    conn: &mut Connection,
    read_timeout: Option<Duration>,
) -> Result<RawResponse> {
    conn.set_read_timeout(read_timeout)
        .map_err(io_to_error)?;
    let timeout_ms = read_timeout.map(|timeout| timeout.as_millis()).unwrap_or(0);

    loop {
        let line = read_line(conn.reader()).map_err(|error| map_read_error(error, timeout_ms))?;
        let (status, reason, version_minor) = parse_status_line(&line)?;
        let mut headers = Headers::new();
        loop {
            let header_line =
                read_line(conn.reader()).map_err(|error| map_read_error(error, timeout_ms))?;
            if header_line.is_empty() {
                break;
            }
            let Some((name, value)) = header_line.split_once(':') else {
                return Err(Error::protocol(format!(
                    "malformed header line: {header_line:?}"
                )));
            };
            headers.add(name.trim(), value.trim());
        }

        if (100..200).contains(&status) {
            tracing::debug!(status, "skipping interim response");
            continue;
        }
        return Ok(RawResponse {
            status,
            reason,
            status_line: line,
            version_minor,
            headers,
        });
    }
}

fn map_read_error(error: std::io::Error, timeout_ms: u128) -> Error {
    if crate::error::io_error_is_timeout(&error) {
        return Error::Timeout { timeout_ms };
    }
    match error.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            Error::protocol(error.to_string())
        }
        _ => Error::Io { source: error },
    }
}

/// Parses `HTTP/<major>.<minor> <code> <reason>`. The code must be decimal
/// digits that fit an `i32`; anything else, including leading or trailing
/// junk, is a protocol error.
pub(crate) fn parse_status_line(line: &str) -> Result<(i32, String, u8)> {
    let rest = line
        .strip_prefix("HTTP/1.")
        .ok_or_else(|| Error::protocol(format!("malformed status line: {line:?}")))?;
    let mut parts = rest.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::protocol(format!("malformed status line: {line:?}")))?;
    let version_minor = match version {
        "0" => 0,
        "1" => 1,
        _ => {
            return Err(Error::protocol(format!(
                "unsupported http version in status line: {line:?}"
            )));
        }
    };
    let code_token = parts
        .next()
        .ok_or_else(|| Error::protocol(format!("status line missing code: {line:?}")))?;
    if code_token.is_empty() || !code_token.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(Error::protocol(format!(
            "non-numeric status code: {line:?}"
        )));
    }
    let status: i32 = code_token
        .parse()
        .map_err(|_| Error::protocol(format!("status code out of range: {line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_owned();
    Ok((status, reason, version_minor))
}

/// Whether the connection survives this exchange for reuse.
pub(crate) fn response_keeps_alive(raw: &RawResponse, request_close: bool) -> bool {
    if request_close {
        return false;
    }
    match raw.headers.get("Connection") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => raw.version_minor >= 1,
    }
}

/// How the response body is delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    Fixed(u64),
    Chunked,
    UntilClose,
    Empty,
}

/// Framing selection: chunked transfer-coding wins over content-length;
/// with neither, a connection that stays alive is assumed to carry a
/// zero-length body and one that closes is read to end-of-stream.
pub(crate) fn response_framing(method: &str, raw: &RawResponse, keep_alive: bool) -> ResponseFraming {
    if method.eq_ignore_ascii_case("HEAD") {
        return ResponseFraming::Empty;
    }
    if raw.status == 204 || raw.status == 304 {
        return ResponseFraming::Empty;
    }
    let chunked = raw
        .headers
        .get("Transfer-Encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));
    if chunked {
        return ResponseFraming::Chunked;
    }
    if let Some(value) = raw.headers.get("Content-Length")
        && let Ok(length) = value.trim().parse::<u64>()
    {
        return ResponseFraming::Fixed(length);
    }
    if keep_alive {
        ResponseFraming::Empty
    } else {
        ResponseFraming::UntilClose
    }
}

/// Reads and discards the remainder of a framed body so the socket is
/// clean for the next exchange. End-of-stream bodies are not drainable;
/// the caller must not re-pool such a connection.
pub(crate) fn drain_body(conn: &mut Connection, framing: ResponseFraming) -> Result<()> {
    let mut scratch = [0_u8; 8 * 1024];
    match framing {
        ResponseFraming::Empty | ResponseFraming::UntilClose => Ok(()),
        ResponseFraming::Fixed(length) => {
            let mut reader = FixedLengthReader::new(length);
            loop {
                let read = reader
                    .read(conn.reader(), &mut scratch)
                    .map_err(|error| map_read_error(error, 0))?;
                if read == 0 {
                    return Ok(());
                }
            }
        }
        ResponseFraming::Chunked => {
            let mut reader = ChunkedReader::new();
            loop {
                let read = reader
                    .read(conn.reader(), &mut scratch)
                    .map_err(|error| map_read_error(error, 0))?;
                if read == 0 {
                    return Ok(());
                }
            }
        }
    }
}
