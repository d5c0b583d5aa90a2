use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    Protocol,
    Connect,
    Timeout,
    Tls,
    State,
    UnsupportedAuthScheme,
    BodyAlreadyConsumed,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
    Io,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::Protocol => "protocol",
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::State => "state",
            Self::UnsupportedAuthScheme => "unsupported_auth_scheme",
            Self::BodyAlreadyConsumed => "body_already_consumed",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("http protocol error: {message}")]
    Protocol { message: String },
    #[error("failed to connect to {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },
    #[error("read timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("tls handshake with {host} failed: {message}")]
    Tls { host: String, message: String },
    #[error("invalid connection state: {message}")]
    State { message: String },
    #[error("unsupported authentication scheme: {scheme}")]
    UnsupportedAuthScheme { scheme: String },
    #[error("cannot retry {method} {url}: streamed request body already consumed")]
    BodyAlreadyConsumed { method: String, url: String },
    #[error("invalid redirect location {location} for {url}")]
    InvalidRedirectLocation { location: String, url: String },
    #[error("redirect limit exceeded ({max_redirects}) for {url}")]
    RedirectLimitExceeded { max_redirects: usize, url: String },
    #[error("i/o error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::Connect { .. } => ErrorCode::Connect,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Tls { .. } => ErrorCode::Tls,
            Self::State { .. } => ErrorCode::State,
            Self::UnsupportedAuthScheme { .. } => ErrorCode::UnsupportedAuthScheme,
            Self::BodyAlreadyConsumed { .. } => ErrorCode::BodyAlreadyConsumed,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    pub(crate) fn tls(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tls {
            host: host.into(),
            message: message.into(),
        }
    }
}

pub(crate) fn io_error_is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}
