//! `htx` is a blocking HTTP/1.1 client engine built around a stateful
//! request handle and a shared connection pool.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::io::Read;
//! use std::time::Duration;
//! use htx::prelude::HttpClient;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .user_agent("my-tool/1.0")
//!         .connect_timeout(Duration::from_secs(5))
//!         .read_timeout(Duration::from_secs(10))
//!         .build()?;
//!
//!     let mut request = client.open("https://example.com/data")?;
//!     request.set_header("Accept", "text/plain")?;
//!     let mut response = request.response()?;
//!
//!     println!("status: {}", response.status());
//!     let mut body = String::new();
//!     response.read_to_string(&mut body)?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```
//!
//! # Behavior Notes
//!
//! - Connections are pooled per (host, port, proxy, TLS factory instance)
//!   and reused across requests, including across followed redirects.
//! - Redirects and Basic `401`/`407` challenges are handled internally for
//!   replayable request bodies; streamed bodies surface a hard error when
//!   a retry would be needed.
//! - `Accept-Encoding: gzip` is negotiated automatically when the caller
//!   does not set it, and such responses are decoded transparently.

mod auth;
mod cache;
mod client;
mod controller;
mod engine;
mod error;
mod headers;
mod pool;
mod request;
mod response;
mod route;
mod tls;
mod transfer;
mod tunnel;
mod util;

pub use crate::auth::{AuthContext, Authenticator, Challenge, ChallengeTarget, Credentials};
pub use crate::cache::{CacheRecord, CacheSink, CachedResponse, ResponseCache};
pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::error::{Error, ErrorCode};
pub use crate::headers::{HeaderSnapshot, Headers};
pub use crate::request::{BodyWriter, CancelHandle, Request};
pub use crate::response::Response;
pub use crate::route::{DnsResolver, ProxyServer, ProxySelector, SystemDns};
pub use crate::tls::{
    AcceptTlsVerified, HostnameVerifier, IoStream, RustlsFactory, TlsFactory, TlsMode,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Authenticator, CancelHandle, Credentials, Error, ErrorCode, Headers, HttpClient,
        HttpClientBuilder, ProxyServer, Request, Response, Result, TlsFactory,
    };
}
