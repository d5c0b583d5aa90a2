//! Live-socket ownership: the pooled connection and the idle set it
//! returns to between logical requests.

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::route::{ProxyServer, Route};
use crate::tls::{IoStream, TlsFactory};
use crate::util::lock_unpoisoned;

const MAX_IDLE_CONNECTIONS: usize = 16;

/// Identity of a route for reuse purposes. The TLS factory participates by
/// *instance* (pointer), not configuration: a different factory instance
/// must never pick up a socket handshaken by another.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) proxy: Option<ProxyServer>,
    pub(crate) tls_factory: Option<usize>,
}

impl PoolKey {
    pub(crate) fn new(
        host: &str,
        port: u16,
        proxy: Option<&ProxyServer>,
        tls_factory: Option<&Arc<dyn TlsFactory>>,
    ) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            port,
            proxy: proxy.cloned(),
            tls_factory: tls_factory.map(tls_factory_identity),
        }
    }
}

pub(crate) fn tls_factory_identity(factory: &Arc<dyn TlsFactory>) -> usize {
    Arc::as_ptr(factory) as *const () as usize
}

/// A live socket plus its buffered reader. Owned by the pool while idle and
/// by exactly one exchange while in use.
pub(crate) struct Connection {
    key: PoolKey,
    route: Route,
    tcp: TcpStream,
    io: BufReader<Box<dyn IoStream>>,
    exchange_count: u64,
    reusable: bool,
}

impl Connection {
    pub(crate) fn new(key: PoolKey, route: Route, tcp: TcpStream, io: Box<dyn IoStream>) -> Self {
        Self {
            key,
            route,
            tcp,
            io: BufReader::new(io),
            exchange_count: 0,
            reusable: true,
        }
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    /// Claims the next exchange slot on this socket and returns its
    /// sequence number: 0 for a fresh socket, incrementing per request
    /// (a tunnel CONNECT consumes a slot like any other exchange).
    pub(crate) fn next_sequence_number(&mut self) -> u64 {
        let sequence = self.exchange_count;
        self.exchange_count += 1;
        sequence
    }

    pub(crate) fn last_sequence_number(&self) -> u64 {
        self.exchange_count.saturating_sub(1)
    }

    /// Replaces the plain socket stream with its TLS upgrade after a
    /// CONNECT tunnel. Any buffered plaintext would be a protocol
    /// violation, so the buffer is simply dropped with the old reader.
    pub(crate) fn upgrade_io(&mut self, io: Box<dyn IoStream>) {
        self.io = BufReader::new(io);
    }

    pub(crate) fn reader(&mut self) -> &mut BufReader<Box<dyn IoStream>> {
        &mut self.io
    }

    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.io.get_mut().write_all(bytes)
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        self.io.get_mut().flush()
    }

    pub(crate) fn writer(&mut self) -> &mut dyn Write {
        self.io.get_mut()
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.tcp.set_read_timeout(timeout)
    }

    /// Clone of the raw socket handle, used by cancellation to unblock a
    /// reader from another thread.
    pub(crate) fn cancel_socket(&self) -> std::io::Result<TcpStream> {
        self.tcp.try_clone()
    }

    pub(crate) fn mark_not_reusable(&mut self) {
        self.reusable = false;
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tcp.shutdown(Shutdown::Both);
    }

    /// Peeks whether buffered data or a readable byte is available; a
    /// pooled socket whose peer already closed is unusable.
    pub(crate) fn looks_alive(&mut self) -> bool {
        if !self.io.buffer().is_empty() {
            return true;
        }
        // A zero-duration read distinguishes "peer closed" from "no data".
        if self.tcp.set_read_timeout(Some(Duration::from_micros(1))).is_err() {
            return false;
        }
        let mut probe = [0_u8; 1];
        let alive = match self.tcp.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(error) => crate::error::io_error_is_timeout(&error),
        };
        let _ = self.tcp.set_read_timeout(None);
        alive
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.io.read(buf)
    }
}

/// Idle-socket set keyed by route identity. Mutation is mutually exclusive
/// across caller threads; a connection is never handed out twice.
#[derive(Default)]
pub(crate) struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Most recently released matching connection, if any survives the
    /// liveness probe.
    pub(crate) fn acquire(&self, key: &PoolKey) -> Option<Connection> {
        loop {
            let candidate = {
                let mut idle = lock_unpoisoned(&self.idle);
                let position = idle.iter().rposition(|connection| connection.key() == key)?;
                idle.remove(position)
            };
            let mut connection = candidate;
            if connection.looks_alive() {
                tracing::debug!(
                    host = %key.host,
                    port = key.port,
                    sequence = connection.exchange_count,
                    "reusing pooled connection"
                );
                return Some(connection);
            }
            tracing::debug!(host = %key.host, port = key.port, "discarding dead pooled connection");
            connection.shutdown();
        }
    }

    /// Returns a connection to the idle set, or closes it when it is no
    /// longer fit for reuse.
    pub(crate) fn release(&self, connection: Connection) {
        if !connection.is_reusable() {
            connection.shutdown();
            return;
        }
        let mut idle = lock_unpoisoned(&self.idle);
        if idle.len() >= MAX_IDLE_CONNECTIONS {
            let evicted = idle.remove(0);
            evicted.shutdown();
        }
        idle.push(connection);
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        lock_unpoisoned(&self.idle).len()
    }
}
