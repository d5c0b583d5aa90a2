//! Authentication: challenge parsing, the caller-supplied authenticator
//! capability, and Basic credential encoding.

use std::net::SocketAddr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use url::Url;

use crate::headers::Headers;

pub(crate) const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub(crate) const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
pub(crate) const AUTHORIZATION: &str = "Authorization";
pub(crate) const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";

/// Who issued the challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeTarget {
    Origin,
    Proxy,
}

/// A parsed `WWW-Authenticate`/`Proxy-Authenticate` challenge. Only the
/// `Basic` scheme is actionable by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
    pub target: ChallengeTarget,
}

impl Challenge {
    pub fn is_basic(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("Basic")
    }
}

/// Username/password pair returned by an authenticator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(user:pass)>`.
    pub fn basic_header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64.encode(raw.as_bytes()))
    }
}

/// Everything the engine knows when asking for credentials.
#[derive(Debug)]
pub struct AuthContext<'a> {
    pub host: &'a str,
    pub port: u16,
    pub address: Option<SocketAddr>,
    pub url: &'a Url,
    pub realm: &'a str,
    pub scheme: &'a str,
    pub protocol: &'a str,
    pub target: ChallengeTarget,
}

/// Capability invoked synchronously on `401`/`407`. Returning `None` stops
/// the retry loop and surfaces the challenge response.
pub trait Authenticator: Send + Sync {
    fn credentials(&self, context: &AuthContext<'_>) -> Option<Credentials>;
}

/// First challenge carried by the response, if any. Only the first
/// challenge of the first matching header is considered.
pub(crate) fn select_challenge(headers: &Headers, target: ChallengeTarget) -> Option<Challenge> {
    let header = match target {
        ChallengeTarget::Origin => WWW_AUTHENTICATE,
        ChallengeTarget::Proxy => PROXY_AUTHENTICATE,
    };
    let value = headers.values(header).next()?;
    parse_challenge(value, target)
}

fn parse_challenge(value: &str, target: ChallengeTarget) -> Option<Challenge> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (scheme, params) = match trimmed.split_once(char::is_whitespace) {
        Some((scheme, params)) => (scheme, params.trim()),
        None => (trimmed, ""),
    };
    let realm = params
        .split(',')
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("realm"))
        .map(|(_, value)| value.trim().trim_matches('"').to_owned())
        .unwrap_or_default();
    Some(Challenge {
        scheme: scheme.to_owned(),
        realm,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::{Challenge, ChallengeTarget, Credentials, select_challenge};
    use crate::headers::Headers;

    #[test]
    fn basic_credentials_encode_to_the_wire_form() {
        let credentials = Credentials::new("user", "pass");
        assert_eq!(credentials.basic_header_value(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn quoted_realm_is_extracted_from_the_first_challenge() {
        let mut headers = Headers::new();
        headers.add("WWW-Authenticate", "Basic realm=\"protected area\"");
        headers.add("WWW-Authenticate", "Basic realm=\"second\"");

        let challenge =
            select_challenge(&headers, ChallengeTarget::Origin).expect("challenge parsed");
        assert_eq!(
            challenge,
            Challenge {
                scheme: "Basic".to_owned(),
                realm: "protected area".to_owned(),
                target: ChallengeTarget::Origin,
            }
        );
        assert!(challenge.is_basic());
    }

    #[test]
    fn non_basic_scheme_is_parsed_but_not_actionable() {
        let mut headers = Headers::new();
        headers.add("Proxy-Authenticate", "Digest realm=x, nonce=abc");

        let challenge =
            select_challenge(&headers, ChallengeTarget::Proxy).expect("challenge parsed");
        assert_eq!(challenge.scheme, "Digest");
        assert_eq!(challenge.realm, "x");
        assert!(!challenge.is_basic());
    }

    #[test]
    fn missing_challenge_header_yields_none() {
        let headers = Headers::new();
        assert!(select_challenge(&headers, ChallengeTarget::Origin).is_none());
    }
}
