//! Route selection: proxy policy, DNS capability and the ordered
//! sequence of candidate routes a connect attempt walks through.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use url::Url;

use crate::Result;
use crate::error::Error;

/// An HTTP proxy endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
}

impl ProxyServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ProxyServer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}:{}", self.host, self.port)
    }
}

/// Capability that maps a request URL to an ordered proxy preference list.
/// An empty list means "go direct".
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &Url) -> Vec<ProxyServer>;
}

/// How the client reaches an origin.
#[derive(Clone)]
pub enum ProxyPolicy {
    Direct,
    Server(ProxyServer),
    Selector(Arc<dyn ProxySelector>),
}

impl ProxyPolicy {
    /// Ordered proxy candidates for a URL; `None` is the direct route.
    pub(crate) fn candidates(&self, url: &Url) -> Vec<Option<ProxyServer>> {
        match self {
            Self::Direct => vec![None],
            Self::Server(server) => vec![Some(server.clone())],
            Self::Selector(selector) => {
                let selected = selector.select(url);
                if selected.is_empty() {
                    vec![None]
                } else {
                    selected.into_iter().map(Some).collect()
                }
            }
        }
    }
}

impl std::fmt::Debug for ProxyPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => formatter.write_str("Direct"),
            Self::Server(server) => write!(formatter, "Server({server})"),
            Self::Selector(_) => formatter.write_str("Selector(..)"),
        }
    }
}

/// DNS capability: a host resolves to an ordered address sequence.
pub trait DnsResolver: Send + Sync {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDns;

impl DnsResolver for SystemDns {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // Port 0 is a placeholder; only the addresses matter here.
        let addresses: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()?
            .map(|address| address.ip())
            .collect();
        if addresses.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(addresses)
    }
}

/// One fully resolved way to reach the target. Immutable once produced.
#[derive(Clone, Debug)]
pub(crate) struct Route {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) proxy: Option<ProxyServer>,
    pub(crate) address: SocketAddr,
}

impl Route {
    /// The socket is dialed to the proxy when one applies, the origin
    /// otherwise.
    pub(crate) fn uses_proxy(&self) -> bool {
        self.proxy.is_some()
    }
}

/// Lazily walks the cartesian sequence of (proxy candidate × resolved
/// address). The caller pulls the next route after each connect failure;
/// exhaustion is a terminal connect error.
pub(crate) struct RouteSelector {
    host: String,
    port: u16,
    candidates: Vec<Option<ProxyServer>>,
    dns: Arc<dyn DnsResolver>,
    next_candidate: usize,
    pending: VecDeque<Route>,
    last_failure: Option<String>,
}

impl RouteSelector {
    pub(crate) fn new(
        host: &str,
        port: u16,
        policy: &ProxyPolicy,
        url: &Url,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            host: host.to_owned(),
            port,
            candidates: policy.candidates(url),
            dns,
            next_candidate: 0,
            pending: VecDeque::new(),
            last_failure: None,
        }
    }

    pub(crate) fn note_failure(&mut self, message: impl Into<String>) {
        self.last_failure = Some(message.into());
    }

    /// Next candidate route, resolving the relevant host on demand. The
    /// *proxy's* host is the one resolved when a proxy applies, so a proxy
    /// resolving to several addresses yields one route per address.
    pub(crate) fn next_route(&mut self) -> Result<Route> {
        loop {
            if let Some(route) = self.pending.pop_front() {
                return Ok(route);
            }
            if self.next_candidate >= self.candidates.len() {
                return Err(self.exhausted());
            }
            let proxy = self.candidates[self.next_candidate].clone();
            self.next_candidate += 1;

            let (dial_host, dial_port) = match &proxy {
                Some(server) => (server.host.clone(), server.port),
                None => (self.host.clone(), self.port),
            };
            match self.dns.resolve(&dial_host) {
                Ok(addresses) => {
                    for ip in addresses {
                        self.pending.push_back(Route {
                            host: self.host.clone(),
                            port: self.port,
                            proxy: proxy.clone(),
                            address: SocketAddr::new(ip, dial_port),
                        });
                    }
                }
                Err(error) => {
                    tracing::debug!(host = %dial_host, %error, "dns resolution failed, trying next candidate");
                    self.last_failure = Some(format!("failed to resolve {dial_host}: {error}"));
                }
            }
        }
    }

    fn exhausted(&self) -> Error {
        let message = self
            .last_failure
            .clone()
            .unwrap_or_else(|| "exhausted all routes".to_owned());
        Error::Connect {
            host: self.host.clone(),
            port: self.port,
            message,
        }
    }
}
