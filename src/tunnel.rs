//! CONNECT tunnel negotiation for HTTPS origins behind an HTTP proxy.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::Result;
use crate::auth::{
    AuthContext, Authenticator, ChallengeTarget, PROXY_AUTHORIZATION, select_challenge,
};
use crate::engine::{self, ResponseFraming};
use crate::error::Error;
use crate::pool::Connection;

/// Outcome of one CONNECT attempt on an established proxy socket.
pub(crate) enum TunnelOutcome {
    /// Proxy granted the tunnel; the socket is ready for the TLS handshake.
    Established,
    /// Proxy demanded credentials and closed the connection; the caller
    /// must dial the proxy again and retry with the credential attached.
    ReconnectWithAuth,
}

pub(crate) struct TunnelNegotiator<'a> {
    pub(crate) url: &'a Url,
    pub(crate) host: &'a str,
    pub(crate) port: u16,
    pub(crate) user_agent: &'a str,
    pub(crate) authenticator: Option<&'a Arc<dyn Authenticator>>,
    pub(crate) read_timeout: Option<Duration>,
}

impl TunnelNegotiator<'_> {
    /// Negotiates the tunnel. A `407` is answered at most once with a
    /// `Proxy-Authorization` credential, obtained through the
    /// authentication capability and cached in `proxy_authorization` for
    /// any reconnect. Origin request headers never appear on the CONNECT.
    pub(crate) fn negotiate(
        &self,
        conn: &mut Connection,
        proxy_authorization: &mut Option<String>,
    ) -> Result<TunnelOutcome> {
        let mut authenticated = proxy_authorization.is_some();
        loop {
            let sequence = conn.next_sequence_number();
            tracing::debug!(
                host = self.host,
                port = self.port,
                sequence,
                "sending CONNECT to proxy"
            );
            self.write_connect(conn, proxy_authorization.as_deref())?;

            let raw = engine::read_response_head(conn, self.read_timeout)?;
            match raw.status {
                200 => return Ok(TunnelOutcome::Established),
                407 => {
                    if authenticated {
                        return Err(Error::protocol(
                            "proxy rejected CONNECT credentials with 407",
                        ));
                    }
                    let challenge = select_challenge(&raw.headers, ChallengeTarget::Proxy)
                        .ok_or_else(|| {
                            Error::protocol("407 CONNECT response without a proxy challenge")
                        })?;
                    if !challenge.is_basic() {
                        return Err(Error::UnsupportedAuthScheme {
                            scheme: challenge.scheme,
                        });
                    }
                    let Some(authenticator) = self.authenticator else {
                        return Err(Error::protocol(
                            "proxy requires authentication but no authenticator is configured",
                        ));
                    };
                    let context = AuthContext {
                        host: self.host,
                        port: self.port,
                        address: Some(conn.route().address),
                        url: self.url,
                        realm: &challenge.realm,
                        scheme: &challenge.scheme,
                        protocol: "http",
                        target: ChallengeTarget::Proxy,
                    };
                    let Some(credentials) = authenticator.credentials(&context) else {
                        return Err(Error::protocol(
                            "authenticator declined proxy CONNECT challenge",
                        ));
                    };
                    *proxy_authorization = Some(credentials.basic_header_value());
                    authenticated = true;

                    let keep_alive = engine::response_keeps_alive(&raw, false);
                    let framing = engine::response_framing("CONNECT", &raw, keep_alive);
                    if !keep_alive || framing == ResponseFraming::UntilClose {
                        conn.mark_not_reusable();
                        return Ok(TunnelOutcome::ReconnectWithAuth);
                    }
                    engine::drain_body(conn, framing)?;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "proxy refused CONNECT tunnel with status {other}"
                    )));
                }
            }
        }
    }

    /// Only proxy-scoped headers go on the CONNECT line; the origin
    /// request's headers must never leak into the tunnel handshake.
    fn write_connect(&self, conn: &mut Connection, proxy_authorization: Option<&str>) -> Result<()> {
        let mut wire = format!("CONNECT {}:{} HTTP/1.1\r\n", self.host, self.port);
        wire.push_str(&format!("Host: {}:{}\r\n", self.host, self.port));
        wire.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        wire.push_str("Proxy-Connection: Keep-Alive\r\n");
        if let Some(value) = proxy_authorization {
            wire.push_str(PROXY_AUTHORIZATION);
            wire.push_str(": ");
            wire.push_str(value);
            wire.push_str("\r\n");
        }
        wire.push_str("\r\n");
        conn.write_all(wire.as_bytes())
            .map_err(|source| Error::Io { source })?;
        conn.flush().map_err(|source| Error::Io { source })
    }
}
