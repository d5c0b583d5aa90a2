//! Scripted HTTP server and fake collaborators shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use htx::{Authenticator, CachedResponse, Credentials, HttpClient, TlsFactory};

static LOGGING: Once = Once::new();

/// Routes engine tracing through the test harness. `RUST_LOG` picks the
/// verbosity when a failing test needs wire-level detail.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One scripted response, served verbatim to whichever request arrives
/// next, regardless of which connection carries it.
#[derive(Clone)]
pub struct MockResponse {
    raw: Vec<u8>,
    close: bool,
    stall: Option<Duration>,
}

impl MockResponse {
    pub fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let body = body.into();
        let mut raw = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
        let mut has_length = false;
        for (name, value) in headers {
            let name = name.into();
            if name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Transfer-Encoding")
            {
                has_length = true;
            }
            raw.push_str(&name);
            raw.push_str(": ");
            raw.push_str(&value.into());
            raw.push_str("\r\n");
        }
        if !has_length {
            raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        raw.push_str("\r\n");
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(&body);
        Self {
            raw,
            close: false,
            stall: None,
        }
    }

    /// Exact bytes on the wire, no framing added. The connection closes
    /// afterwards so end-of-stream bodies terminate.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: bytes.into(),
            close: true,
            stall: None,
        }
    }

    /// Keeps the connection open after a `raw` response.
    pub fn keep_open(mut self) -> Self {
        self.close = false;
        self
    }

    /// Closes the connection after serving.
    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Sleeps before writing anything, to trip client read timeouts.
    pub fn stall(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    /// Index of the physical connection that carried this request.
    pub connection: usize,
    /// Zero-based position of this request on its connection.
    pub sequence: usize,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Payload sizes of each chunk for chunked request bodies.
    pub chunk_sizes: Vec<usize>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct MockServer {
    address: std::net::SocketAddr,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    stop: Arc<AtomicBool>,
    accept_join: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start(script: Vec<MockResponse>) -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(VecDeque::from(script)));
        let stop = Arc::new(AtomicBool::new(false));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);
        let stop_clone = Arc::clone(&stop);

        let accept_join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut handlers: Vec<JoinHandle<()>> = Vec::new();
            let mut connection_index = 0;

            while Instant::now() < deadline && !stop_clone.load(Ordering::SeqCst) {
                if queue.lock().expect("lock script").is_empty() {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let queue = Arc::clone(&queue);
                        let served = Arc::clone(&served_clone);
                        let captured = Arc::clone(&captured_clone);
                        let connection = connection_index;
                        connection_index += 1;
                        handlers.push(thread::spawn(move || {
                            serve_connection(stream, connection, queue, served, captured);
                        }));
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
            for handler in handlers {
                let _ = handler.join();
            }
        });

        Self {
            address,
            served,
            captured,
            stop,
            accept_join: Some(accept_join),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn address(&self) -> std::net::SocketAddr {
        self.address
    }

    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("lock captured").clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    connection: usize,
    queue: Arc<Mutex<VecDeque<MockResponse>>>,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
    let mut sequence = 0;
    let mut buffered = Vec::new();

    loop {
        let request = match read_request(&mut stream, &mut buffered, connection, sequence) {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => return,
        };
        sequence += 1;
        captured.lock().expect("lock captured").push(request);
        served.fetch_add(1, Ordering::SeqCst);

        let Some(response) = queue.lock().expect("lock script").pop_front() else {
            let _ = stream.write_all(b"HTTP/1.1 500 Script Exhausted\r\nContent-Length: 0\r\n\r\n");
            return;
        };
        if let Some(delay) = response.stall {
            thread::sleep(delay);
        }
        if stream.write_all(&response.raw).is_err() || stream.flush().is_err() {
            return;
        }
        if response.close {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_request(
    stream: &mut TcpStream,
    buffered: &mut Vec<u8>,
    connection: usize,
    sequence: usize,
) -> std::io::Result<Option<CapturedRequest>> {
    while find_header_end(buffered).is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Ok(None);
        }
        buffered.extend_from_slice(&chunk[..read]);
    }
    let header_end = find_header_end(buffered).expect("header terminator present");
    let head: Vec<u8> = buffered.drain(..header_end + 4).collect();
    let header_text = String::from_utf8_lossy(&head[..header_end]).into_owned();

    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());
    let chunked = headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("Transfer-Encoding") && value.eq_ignore_ascii_case("chunked")
        });

    let mut body = Vec::new();
    let mut chunk_sizes = Vec::new();
    if chunked {
        read_chunked_body(stream, buffered, &mut body, &mut chunk_sizes)?;
    } else if let Some(length) = content_length {
        while buffered.len() < length {
            let mut chunk = [0_u8; 1024];
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffered.extend_from_slice(&chunk[..read]);
        }
        let take = length.min(buffered.len());
        body = buffered.drain(..take).collect();
    }

    Ok(Some(CapturedRequest {
        connection,
        sequence,
        method,
        target,
        headers,
        body,
        chunk_sizes,
    }))
}

fn read_chunked_body(
    stream: &mut TcpStream,
    buffered: &mut Vec<u8>,
    body: &mut Vec<u8>,
    chunk_sizes: &mut Vec<usize>,
) -> std::io::Result<()> {
    loop {
        let line = read_buffered_line(stream, buffered)?;
        let size = usize::from_str_radix(line.trim(), 16).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size")
        })?;
        if size == 0 {
            // Trailer section up to the blank line.
            loop {
                if read_buffered_line(stream, buffered)?.is_empty() {
                    return Ok(());
                }
            }
        }
        chunk_sizes.push(size);
        while buffered.len() < size + 2 {
            let mut chunk = [0_u8; 1024];
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated chunk",
                ));
            }
            buffered.extend_from_slice(&chunk[..read]);
        }
        let payload: Vec<u8> = buffered.drain(..size + 2).collect();
        body.extend_from_slice(&payload[..size]);
    }
}

fn read_buffered_line(stream: &mut TcpStream, buffered: &mut Vec<u8>) -> std::io::Result<String> {
    loop {
        if let Some(position) = buffered.iter().position(|&byte| byte == b'\n') {
            let mut line: Vec<u8> = buffered.drain(..=position).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
        buffered.extend_from_slice(&chunk[..read]);
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// TLS factory that hands the socket back untouched, so "https" traffic
/// stays plaintext against the scripted server.
pub struct PassthroughTls;

impl TlsFactory for PassthroughTls {
    fn handshake(
        &self,
        tcp: TcpStream,
        _host: &str,
        _mode: htx::TlsMode,
    ) -> htx::Result<Box<dyn htx::IoStream>> {
        Ok(Box::new(tcp))
    }
}

/// Factory whose `Modern` handshake always fails, counting attempts per
/// protocol ceiling.
#[derive(Default)]
pub struct FlakyModernTls {
    pub modern_attempts: AtomicUsize,
    pub compat_attempts: AtomicUsize,
}

impl FlakyModernTls {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TlsFactory for FlakyModernTls {
    fn handshake(
        &self,
        tcp: TcpStream,
        host: &str,
        mode: htx::TlsMode,
    ) -> htx::Result<Box<dyn htx::IoStream>> {
        match mode {
            htx::TlsMode::Modern => {
                self.modern_attempts.fetch_add(1, Ordering::SeqCst);
                Err(htx::Error::Tls {
                    host: host.to_owned(),
                    message: "peer rejected the modern ceiling".to_owned(),
                })
            }
            htx::TlsMode::Compat => {
                self.compat_attempts.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(tcp))
            }
        }
    }
}

/// Authenticator with fixed credentials; counts how often it is asked.
pub struct FixedCredentials {
    pub username: String,
    pub password: String,
    pub calls: AtomicUsize,
}

impl FixedCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Authenticator for FixedCredentials {
    fn credentials(&self, _context: &htx::AuthContext<'_>) -> Option<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(Credentials::new(
            self.username.clone(),
            self.password.clone(),
        ))
    }
}

/// In-memory cache storing at most one entry, committed on flush.
#[derive(Default)]
pub struct SingleEntryCache {
    entry: Arc<Mutex<Option<CachedResponse>>>,
}

impl SingleEntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Option<CachedResponse> {
        self.entry.lock().expect("lock cache").clone()
    }
}

pub struct SingleEntrySink {
    target: Arc<Mutex<Option<CachedResponse>>>,
    pending: Option<CachedResponse>,
}

impl Write for SingleEntrySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(pending) = self.pending.as_mut() {
            pending.body.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(pending) = self.pending.take() {
            *self.target.lock().expect("lock cache") = Some(pending);
        }
        Ok(())
    }
}

impl htx::CacheSink for SingleEntrySink {
    fn abort(&mut self) {
        self.pending = None;
    }
}

impl htx::ResponseCache for SingleEntryCache {
    fn get(
        &self,
        _url: &url::Url,
        _method: &str,
        _request_headers: &htx::Headers,
    ) -> Option<CachedResponse> {
        self.entry.lock().expect("lock cache").clone()
    }

    fn put(&self, record: &htx::CacheRecord<'_>) -> Option<Box<dyn htx::CacheSink>> {
        let mut headers = htx::Headers::new();
        for (name, values) in record.headers.fields() {
            if let Some(name) = name {
                for value in values {
                    headers.add(name, value);
                }
            }
        }
        Some(Box::new(SingleEntrySink {
            target: Arc::clone(&self.entry),
            pending: Some(CachedResponse {
                status_line: record.status_line.to_owned(),
                headers,
                body: Vec::new(),
            }),
        }))
    }
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

pub fn client() -> HttpClient {
    init_logging();
    HttpClient::builder()
        .read_timeout(Duration::from_secs(2))
        .build()
        .expect("build client")
}
