//! Pluggable response-cache collaborator. The engine only exercises the
//! get/put/abort contract; `None` anywhere means "no cached entry" or
//! "do not cache" and never fails a request.

use std::io::Write;

use url::Url;

use crate::headers::{HeaderSnapshot, Headers};

/// A previously stored response served without touching the network.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status_line: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Metadata handed to `put` when a response becomes cacheable.
#[derive(Debug)]
pub struct CacheRecord<'a> {
    pub url: &'a Url,
    pub method: &'a str,
    pub status_line: &'a str,
    pub headers: &'a HeaderSnapshot,
}

/// Sink receiving the raw body bytes as the caller drains them. `abort`
/// is invoked when the body does not complete cleanly.
pub trait CacheSink: Write + Send {
    fn abort(&mut self);
}

/// The store contract. Implementations decide what is cacheable; the
/// engine never second-guesses a `None`.
pub trait ResponseCache: Send + Sync {
    fn get(&self, url: &Url, method: &str, request_headers: &Headers) -> Option<CachedResponse>;

    fn put(&self, record: &CacheRecord<'_>) -> Option<Box<dyn CacheSink>>;
}
