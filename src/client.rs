//! Client construction and shared per-client state: timeouts, proxy
//! policy, collaborators and the connection pool every request draws from.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use url::Url;

use crate::Result;
use crate::auth::Authenticator;
use crate::cache::ResponseCache;
use crate::pool::ConnectionPool;
use crate::request::Request;
use crate::route::{DnsResolver, ProxyPolicy, ProxyServer, ProxySelector, SystemDns};
use crate::tls::{RustlsFactory, TlsFactory};
use crate::util::{lock_unpoisoned, parse_url};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_USER_AGENT: &str = concat!("htx/", env!("CARGO_PKG_VERSION"));

/// Shared state behind every [`Request`] a client opens.
pub(crate) struct ClientInner {
    pub(crate) user_agent: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) proxy: ProxyPolicy,
    pub(crate) dns: Arc<dyn DnsResolver>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) cache: Option<Arc<dyn ResponseCache>>,
    pub(crate) pool: Arc<ConnectionPool>,
    // Swappable at runtime; pooled sockets from the old factory become
    // unreachable because reuse is keyed on the factory instance.
    tls_factory: Mutex<Option<Arc<dyn TlsFactory>>>,
}

impl ClientInner {
    pub(crate) fn tls_factory(&self) -> Option<Arc<dyn TlsFactory>> {
        lock_unpoisoned(&self.tls_factory).clone()
    }
}

/// Blocking HTTP/1.1 client. Cheap to clone; clones share the connection
/// pool and configuration.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Client with default configuration and a rustls TLS factory.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Opens a request handle for `url`. Nothing touches the network until
    /// the body writer or the response is asked for.
    pub fn open(&self, url: &str) -> Result<Request> {
        let url = parse_url(url)?;
        Ok(Request::new(Arc::clone(&self.inner), url))
    }

    /// Replaces the TLS socket factory. Existing pooled TLS sockets stay
    /// keyed to the old instance and will not be reused.
    pub fn set_tls_factory(&self, factory: Arc<dyn TlsFactory>) {
        *lock_unpoisoned(&self.inner.tls_factory) = Some(factory);
    }

    /// Removes the TLS socket factory; subsequent https requests fail
    /// until one is set again.
    pub fn clear_tls_factory(&self) {
        *lock_unpoisoned(&self.inner.tls_factory) = None;
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("user_agent", &self.inner.user_agent)
            .field("connect_timeout", &self.inner.connect_timeout)
            .field("read_timeout", &self.inner.read_timeout)
            .field("proxy", &self.inner.proxy)
            .finish_non_exhaustive()
    }
}

pub struct HttpClientBuilder {
    user_agent: String,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    proxy: ProxyPolicy,
    dns: Arc<dyn DnsResolver>,
    authenticator: Option<Arc<dyn Authenticator>>,
    cache: Option<Arc<dyn ResponseCache>>,
    tls_factory: Option<Arc<dyn TlsFactory>>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: None,
            proxy: ProxyPolicy::Direct,
            dns: Arc::new(SystemDns),
            authenticator: None,
            cache: None,
            tls_factory: None,
        }
    }
}

impl HttpClientBuilder {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read timeout applied to every socket read; `None` blocks forever.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Routes every request through one HTTP proxy.
    pub fn proxy(mut self, proxy: ProxyServer) -> Self {
        self.proxy = ProxyPolicy::Server(proxy);
        self
    }

    /// Per-URL proxy selection with direct fallback on an empty result.
    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy = ProxyPolicy::Selector(selector);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn DnsResolver>) -> Self {
        self.dns = dns;
        self
    }

    /// Reactive authenticator answering `401`/`407` Basic challenges.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn tls_factory(mut self, factory: Arc<dyn TlsFactory>) -> Self {
        self.tls_factory = Some(factory);
        self
    }

    /// Builds the client. A default rustls factory is constructed unless
    /// one was supplied.
    pub fn build(self) -> Result<HttpClient> {
        let tls_factory: Arc<dyn TlsFactory> = match self.tls_factory {
            Some(factory) => factory,
            None => Arc::new(RustlsFactory::new()?),
        };
        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                user_agent: self.user_agent,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                proxy: self.proxy,
                dns: self.dns,
                authenticator: self.authenticator,
                cache: self.cache,
                pool: Arc::new(ConnectionPool::new()),
                tls_factory: Mutex::new(Some(tls_factory)),
            }),
        })
    }
}
