use std::sync::Mutex;

use url::Url;

use crate::error::Error;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn parse_url(text: &str) -> Result<Url, Error> {
    let url = Url::parse(text).map_err(|_| Error::InvalidUrl {
        url: text.to_owned(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::InvalidUrl {
            url: text.to_owned(),
        });
    }
    Ok(url)
}

pub(crate) fn is_https(url: &Url) -> bool {
    url.scheme().eq_ignore_ascii_case("https")
}

pub(crate) fn effective_port(url: &Url) -> u16 {
    url.port_or_known_default()
        .unwrap_or(if is_https(url) { 443 } else { 80 })
}

pub(crate) fn url_host(url: &Url) -> Result<&str, Error> {
    url.host_str().ok_or_else(|| Error::InvalidUrl {
        url: url.to_string(),
    })
}

/// `Host` header value: the port is included only when it is not the
/// scheme default.
pub(crate) fn host_header_value(url: &Url) -> Result<String, Error> {
    let host = url_host(url)?;
    let port = effective_port(url);
    let default = if is_https(url) { 443 } else { 80 };
    if port == default {
        Ok(host.to_owned())
    } else {
        Ok(format!("{host}:{port}"))
    }
}

/// Request-target for the request line: absolute-form through an HTTP
/// proxy, origin-form otherwise.
pub(crate) fn request_target(url: &Url, via_proxy: bool) -> String {
    if via_proxy {
        return url.as_str().to_owned();
    }
    let mut target = url.path().to_owned();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

#[cfg(test)]
mod tests {
    use super::{host_header_value, parse_url, request_target};

    #[test]
    fn host_header_omits_default_port_only() {
        let plain = parse_url("http://a.example/x").expect("url");
        let ported = parse_url("https://a.example:8443/x").expect("url");
        assert_eq!(host_header_value(&plain).expect("host"), "a.example");
        assert_eq!(host_header_value(&ported).expect("host"), "a.example:8443");
    }

    #[test]
    fn proxied_request_target_is_the_absolute_url() {
        let url = parse_url("http://a.example/x?q=1").expect("url");
        assert_eq!(request_target(&url, false), "/x?q=1");
        assert_eq!(request_target(&url, true), "http://a.example/x?q=1");
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        assert!(parse_url("ftp://a.example/").is_err());
        assert!(parse_url("http://").is_err());
    }
}
