//! Drives one or more engine executions for a single caller-visible
//! request: route selection, pooled connects, proxy tunneling with TLS
//! fallback, redirect following and `401`/`407` credential retries.

use std::net::TcpStream;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use url::Url;

use crate::Result;
use crate::auth::{
    AUTHORIZATION, AuthContext, ChallengeTarget, PROXY_AUTHORIZATION, select_challenge,
};
use crate::cache::CacheRecord;
use crate::client::ClientInner;
use crate::engine::{
    self, HeadBody, RawResponse, RequestHead, ResponseFraming, SentHead, response_framing,
    response_keeps_alive,
};
use crate::error::{Error, ErrorCode};
use crate::headers::Headers;
use crate::pool::{Connection, PoolKey};
use crate::request::CancelCell;
use crate::response::{BodyReader, FramingState, RawBody, Response};
use crate::route::{ProxyPolicy, Route, RouteSelector};
use crate::tls::{TlsFactory, TlsMode};
use crate::tunnel::{TunnelNegotiator, TunnelOutcome};
use crate::util::{effective_port, is_https, url_host};

pub(crate) const MAX_REDIRECTS: usize = 5;
pub(crate) const MAX_AUTH_RETRIES: usize = 3;

/// One caller-visible request as the controller sees it.
pub(crate) struct CallSpec {
    pub(crate) method: String,
    pub(crate) url: Url,
    pub(crate) headers: Headers,
    pub(crate) body: Option<Bytes>,
    pub(crate) follow_redirects: bool,
    pub(crate) cancel: CancelCell,
}

/// A connection ready to carry an exchange, plus whether the request line
/// must use absolute-form because it goes through a plain HTTP proxy.
pub(crate) struct Established {
    pub(crate) conn: Connection,
    pub(crate) via_proxy: bool,
}

enum RouteAttempt {
    Connected(Connection),
    DialFailed(std::io::Error),
}

/// Pool lookup first, then fresh routes in selector order, advancing on
/// dial failure. TLS handshake failures get a single `Compat` retry on
/// the same route before the whole connect fails.
pub(crate) fn establish(
    client: &ClientInner,
    url: &Url,
    proxy_authorization: &mut Option<String>,
    force_direct: bool,
    cancel: &CancelCell,
) -> Result<Established> {
    let host = url_host(url)?.to_owned();
    let port = effective_port(url);
    let https = is_https(url);
    let tls_factory = if https {
        Some(client.tls_factory().ok_or_else(|| {
            Error::tls(host.clone(), "no tls socket factory configured")
        })?)
    } else {
        None
    };

    let policy = if force_direct {
        ProxyPolicy::Direct
    } else {
        client.proxy.clone()
    };

    for candidate in policy.candidates(url) {
        let key = PoolKey::new(&host, port, candidate.as_ref(), tls_factory.as_ref());
        if let Some(conn) = client.pool.acquire(&key) {
            if let Ok(socket) = conn.cancel_socket() {
                cancel.register(socket);
            }
            let via_proxy = candidate.is_some() && !https;
            return Ok(Established { conn, via_proxy });
        }
    }

    let mut selector = RouteSelector::new(&host, port, &policy, url, Arc::clone(&client.dns));
    loop {
        let route = selector.next_route()?;
        let attempt = connect_via_route(
            client,
            &route,
            tls_factory.as_ref(),
            TlsMode::Modern,
            proxy_authorization,
            url,
            &host,
            port,
        )?;
        let conn = match attempt {
            RouteAttempt::Connected(conn) => conn,
            RouteAttempt::DialFailed(error) => {
                tracing::debug!(address = %route.address, %error, "route connect failed, advancing");
                selector.note_failure(format!("{}: {error}", route.address));
                continue;
            }
        };
        if let Ok(socket) = conn.cancel_socket() {
            cancel.register(socket);
        }
        let via_proxy = route.uses_proxy() && !https;
        return Ok(Established { conn, via_proxy });
    }
}

#[allow(clippy::too_many_arguments)]
fn connect_via_route(
    client: &ClientInner,
    route: &Route,
    tls_factory: Option<&Arc<dyn TlsFactory>>,
    mode: TlsMode,
    proxy_authorization: &mut Option<String>,
    url: &Url,
    host: &str,
    port: u16,
) -> Result<RouteAttempt> {
    let result = connect_once(
        client,
        route,
        tls_factory,
        mode,
        proxy_authorization,
        url,
        host,
        port,
    );
    match result {
        Err(error) if error.code() == ErrorCode::Tls && mode == TlsMode::Modern => {
            tracing::warn!(%host, %error, "tls handshake failed, retrying with compat ceiling");
            connect_once(
                client,
                route,
                tls_factory,
                TlsMode::Compat,
                proxy_authorization,
                url,
                host,
                port,
            )
        }
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
fn connect_once(
    client: &ClientInner,
    route: &Route,
    tls_factory: Option<&Arc<dyn TlsFactory>>,
    mode: TlsMode,
    proxy_authorization: &mut Option<String>,
    url: &Url,
    host: &str,
    port: u16,
) -> Result<RouteAttempt> {
    let tcp = match TcpStream::connect_timeout(&route.address, client.connect_timeout) {
        Ok(tcp) => tcp,
        Err(error) => return Ok(RouteAttempt::DialFailed(error)),
    };
    let _ = tcp.set_nodelay(true);
    let key = PoolKey::new(host, port, route.proxy.as_ref(), tls_factory);

    let Some(factory) = tls_factory else {
        let io = tcp.try_clone().map_err(|source| Error::Io { source })?;
        return Ok(RouteAttempt::Connected(Connection::new(
            key,
            route.clone(),
            tcp,
            Box::new(io),
        )));
    };

    if route.uses_proxy() {
        let io = tcp.try_clone().map_err(|source| Error::Io { source })?;
        let mut conn = Connection::new(key.clone(), route.clone(), tcp, Box::new(io));
        let negotiator = TunnelNegotiator {
            url,
            host,
            port,
            user_agent: &client.user_agent,
            authenticator: client.authenticator.as_ref(),
            read_timeout: client.read_timeout,
        };
        loop {
            match negotiator.negotiate(&mut conn, proxy_authorization)? {
                TunnelOutcome::Established => break,
                TunnelOutcome::ReconnectWithAuth => {
                    conn.shutdown();
                    let tcp = match TcpStream::connect_timeout(&route.address, client.connect_timeout)
                    {
                        Ok(tcp) => tcp,
                        Err(error) => return Ok(RouteAttempt::DialFailed(error)),
                    };
                    let _ = tcp.set_nodelay(true);
                    let io = tcp.try_clone().map_err(|source| Error::Io { source })?;
                    conn = Connection::new(key.clone(), route.clone(), tcp, Box::new(io));
                }
            }
        }
        let tls_socket = conn.cancel_socket().map_err(|source| Error::Io { source })?;
        let tls = factory.handshake(tls_socket, host, mode)?;
        conn.upgrade_io(tls);
        return Ok(RouteAttempt::Connected(conn));
    }

    let tls_socket = tcp.try_clone().map_err(|source| Error::Io { source })?;
    let tls = factory.handshake(tls_socket, host, mode)?;
    Ok(RouteAttempt::Connected(Connection::new(
        key,
        route.clone(),
        tcp,
        tls,
    )))
}

/// Executes a request with a replayable (buffered or absent) body,
/// following redirects and answering Basic challenges.
pub(crate) fn execute(client: &Arc<ClientInner>, spec: CallSpec) -> Result<Response> {
    let original_host = url_host(&spec.url)?.to_owned();
    let mut method = spec.method.clone();
    let mut url = spec.url.clone();
    let mut body = spec.body.clone();
    let mut redirects = 0_usize;
    let mut force_direct = false;
    let mut authorization: Option<String> = None;
    let mut proxy_authorization: Option<String> = None;
    let mut origin_auth_attempts = 0_usize;
    let mut proxy_auth_attempts = 0_usize;

    loop {
        if let Some(cache) = &client.cache
            && let Some(hit) = cache.get(&url, &method, &spec.headers)
        {
            tracing::debug!(url = %url, "serving response from cache");
            return cached_response(&url, hit);
        }

        let Established { mut conn, via_proxy } = establish(
            client,
            &url,
            &mut proxy_authorization,
            force_direct,
            &spec.cancel,
        )?;
        let sequence = conn.next_sequence_number();

        let hop_headers = hop_headers(
            &spec.headers,
            &url,
            &original_host,
            authorization.as_deref(),
            via_proxy.then_some(proxy_authorization.as_deref()).flatten(),
        );
        let head_body = match &body {
            Some(bytes) => HeadBody::Buffered(bytes.as_ref()),
            None => HeadBody::None,
        };
        let head = RequestHead {
            method: &method,
            url: &url,
            headers: &hop_headers,
            via_proxy,
            user_agent: &client.user_agent,
            body: head_body,
        };
        let sent = engine::write_request_head(&mut conn, &head)?;
        let raw = engine::read_response_head(&mut conn, client.read_timeout)?;
        let keep_alive = response_keeps_alive(&raw, sent.request_close);
        let framing = response_framing(&method, &raw, keep_alive);

        // Redirects.
        if spec.follow_redirects
            && let Some(next) = redirect_target(&method, &url, &raw)?
        {
            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(Error::RedirectLimitExceeded {
                    max_redirects: MAX_REDIRECTS,
                    url: spec.url.to_string(),
                });
            }
            tracing::debug!(status = raw.status, from = %url, to = %next.url, "following redirect");
            park_connection(client, conn, framing, keep_alive, &spec.cancel)?;
            if is_https(&next.url) && !is_https(&url) {
                // Upgrading to https drops the proxy for the remaining hops.
                force_direct = true;
            }
            if url_host(&next.url)? != url_host(&url)? {
                authorization = None;
            }
            if next.forces_get {
                method = "GET".to_owned();
                body = None;
            }
            url = next.url;
            continue;
        }

        // Authentication challenges.
        if raw.status == 401 || raw.status == 407 {
            let target = if raw.status == 401 {
                ChallengeTarget::Origin
            } else {
                ChallengeTarget::Proxy
            };
            if target == ChallengeTarget::Proxy && !via_proxy {
                return Err(Error::protocol(
                    "received 407 proxy challenge while not using a proxy",
                ));
            }
            let attempts = match target {
                ChallengeTarget::Origin => &mut origin_auth_attempts,
                ChallengeTarget::Proxy => &mut proxy_auth_attempts,
            };
            match answer_challenge(client, &url, &raw, target, &conn, *attempts)? {
                ChallengeAnswer::Retry(credential) => {
                    *attempts += 1;
                    match target {
                        ChallengeTarget::Origin => authorization = Some(credential),
                        ChallengeTarget::Proxy => proxy_authorization = Some(credential),
                    }
                    park_connection(client, conn, framing, keep_alive, &spec.cancel)?;
                    continue;
                }
                ChallengeAnswer::Surface => {}
            }
        }

        return Ok(build_response(
            client, &method, url, conn, raw, sent, keep_alive, framing, sequence, &spec.cancel,
        ));
    }
}

struct RedirectTarget {
    url: Url,
    forces_get: bool,
}

/// Whether the response redirects somewhere the engine will follow.
/// `None` surfaces the response to the caller instead.
fn redirect_target(method: &str, url: &Url, raw: &RawResponse) -> Result<Option<RedirectTarget>> {
    let forces_get = match raw.status {
        300..=303 | 305 => true,
        // 305 is deliberately followed like a plain redirect rather than
        // honored as "route through this proxy".
        307 => {
            if !matches!(method, "GET" | "HEAD") {
                return Ok(None);
            }
            false
        }
        _ => return Ok(None),
    };
    let Some(location) = raw.headers.get("Location") else {
        return Ok(None);
    };
    let next = url
        .join(location)
        .map_err(|_| Error::InvalidRedirectLocation {
            location: location.to_owned(),
            url: url.to_string(),
        })?;
    if !matches!(next.scheme(), "http" | "https") {
        return Err(Error::InvalidRedirectLocation {
            location: location.to_owned(),
            url: url.to_string(),
        });
    }
    // https -> http downgrades are refused; the response is surfaced.
    if is_https(url) && !is_https(&next) {
        return Ok(None);
    }
    Ok(Some(RedirectTarget {
        url: next,
        forces_get,
    }))
}

enum ChallengeAnswer {
    Retry(String),
    Surface,
}

fn answer_challenge(
    client: &ClientInner,
    url: &Url,
    raw: &RawResponse,
    target: ChallengeTarget,
    conn: &Connection,
    attempts: usize,
) -> Result<ChallengeAnswer> {
    let Some(challenge) = select_challenge(&raw.headers, target) else {
        return Ok(ChallengeAnswer::Surface);
    };
    let Some(authenticator) = client.authenticator.as_ref() else {
        return Ok(ChallengeAnswer::Surface);
    };
    if !challenge.is_basic() {
        // With an authenticator configured the caller expected the
        // challenge to be answerable; fail predictably instead of
        // silently retrying an unsupported scheme.
        return Err(Error::UnsupportedAuthScheme {
            scheme: challenge.scheme,
        });
    }
    if attempts >= MAX_AUTH_RETRIES {
        tracing::warn!(url = %url, attempts, "giving up on authentication challenge");
        return Ok(ChallengeAnswer::Surface);
    }
    let (host, port) = match target {
        ChallengeTarget::Origin => (url_host(url)?.to_owned(), effective_port(url)),
        ChallengeTarget::Proxy => {
            let proxy = conn.route().proxy.as_ref().ok_or_else(|| {
                Error::protocol("proxy challenge on a direct route")
            })?;
            (proxy.host.clone(), proxy.port)
        }
    };
    let context = AuthContext {
        host: &host,
        port,
        address: Some(conn.route().address),
        url,
        realm: &challenge.realm,
        scheme: &challenge.scheme,
        protocol: url.scheme(),
        target,
    };
    match authenticator.credentials(&context) {
        Some(credentials) => Ok(ChallengeAnswer::Retry(credentials.basic_header_value())),
        None => Ok(ChallengeAnswer::Surface),
    }
}

/// Per-hop header set: the caller's headers plus whichever credential
/// belongs on this leg. Proxy credentials never reach a tunneled origin
/// request and origin credentials never reach a proxy.
fn hop_headers(
    caller: &Headers,
    url: &Url,
    original_host: &str,
    authorization: Option<&str>,
    proxy_authorization: Option<&str>,
) -> Headers {
    let mut headers = caller.clone();
    if url
        .host_str()
        .is_some_and(|host| !host.eq_ignore_ascii_case(original_host))
    {
        headers.remove_all(AUTHORIZATION);
    }
    if let Some(value) = authorization {
        headers.set(AUTHORIZATION, value);
    }
    if let Some(value) = proxy_authorization {
        headers.set(PROXY_AUTHORIZATION, value);
    }
    headers
}

/// Drains the hop's body and returns the connection to the pool so the
/// next hop can pick it up (sequence number + 1 on the same socket).
fn park_connection(
    client: &ClientInner,
    mut conn: Connection,
    framing: ResponseFraming,
    keep_alive: bool,
    cancel: &CancelCell,
) -> Result<()> {
    cancel.forget_socket();
    if !keep_alive || framing == ResponseFraming::UntilClose {
        conn.shutdown();
        return Ok(());
    }
    engine::drain_body(&mut conn, framing)?;
    client.pool.release(conn);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_response(
    client: &Arc<ClientInner>,
    method: &str,
    url: Url,
    conn: Connection,
    raw: RawResponse,
    sent: SentHead,
    keep_alive: bool,
    framing: ResponseFraming,
    sequence: u64,
    cancel: &CancelCell,
) -> Response {
    let mut headers = raw.headers;
    let gzip_body = sent.transparent_gzip
        && framing != ResponseFraming::Empty
        && headers
            .get("Content-Encoding")
            .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));
    if gzip_body {
        // The caller sees decoded bytes; the encoding and the now-wrong
        // length are hidden.
        headers.remove_all("Content-Encoding");
        headers.remove_all("Content-Length");
    }
    let snapshot = headers.snapshot(Some(raw.status_line.clone()));

    // A transparently decoded body no longer matches the stored headers,
    // so such responses are not offered to the cache.
    let sink = if gzip_body {
        None
    } else {
        client.cache.as_ref().and_then(|cache| {
            cache.put(&CacheRecord {
                url: &url,
                method,
                status_line: &raw.status_line,
                headers: &snapshot,
            })
        })
    };

    let raw_body = RawBody::new(
        FramingState::new(framing),
        conn,
        Arc::clone(&client.pool),
        sink,
        cancel.clone(),
        keep_alive,
    );
    let body = if gzip_body {
        BodyReader::Gzip(Box::new(GzDecoder::new(raw_body)))
    } else {
        BodyReader::Plain(raw_body)
    };
    Response::new(
        raw.status,
        raw.reason,
        raw.status_line,
        url,
        snapshot,
        sequence,
        false,
        body,
    )
}

fn cached_response(url: &Url, hit: crate::cache::CachedResponse) -> Result<Response> {
    let (status, reason, _) = engine::parse_status_line(&hit.status_line)?;
    let snapshot = hit.headers.snapshot(Some(hit.status_line.clone()));
    Ok(Response::new(
        status,
        reason,
        hit.status_line,
        url.clone(),
        snapshot,
        0,
        true,
        BodyReader::Cached(std::io::Cursor::new(hit.body)),
    ))
}

/// Classification for a request whose body was streamed and cannot be
/// replayed: any outcome that would normally trigger a retry is a hard
/// "body already consumed" error instead of a silent resend.
pub(crate) fn streamed_retry_check(
    client: &ClientInner,
    method: &str,
    url: &Url,
    raw: &RawResponse,
    follow_redirects: bool,
) -> Result<()> {
    if follow_redirects && redirect_target(method, url, raw)?.is_some() {
        return Err(Error::BodyAlreadyConsumed {
            method: method.to_owned(),
            url: url.to_string(),
        });
    }
    if (raw.status == 401 || raw.status == 407)
        && client.authenticator.is_some()
        && select_challenge(
            &raw.headers,
            if raw.status == 401 {
                ChallengeTarget::Origin
            } else {
                ChallengeTarget::Proxy
            },
        )
        .is_some_and(|challenge| challenge.is_basic())
    {
        return Err(Error::BodyAlreadyConsumed {
            method: method.to_owned(),
            url: url.to_string(),
        });
    }
    Ok(())
}
